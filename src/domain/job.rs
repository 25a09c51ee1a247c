//! Stage attempts recorded in the job ledger.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::item::StageKind;

/// Status of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed rows are never touched again
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" | "running" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Classification of a stage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network or transport problem; the next run tries again
    Transient,
    /// Missing or malformed prerequisite
    Permanent,
    /// The model or tool behind the executor failed
    Executor,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Executor => "executor",
        }
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "permanent" => Ok(Self::Permanent),
            "executor" => Ok(Self::Executor),
            other => Err(format!("unknown failure kind: {}", other)),
        }
    }
}

/// Per-item failure returned from a stage executor.
///
/// Every variant is handled the same way by the scheduler (recorded, item
/// stays eligible); the kind only feeds the ledger and the logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageFailure {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("missing or invalid prerequisite: {0}")]
    Permanent(String),

    #[error("executor failure: {0}")]
    Executor(String),
}

impl StageFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient(_) => FailureKind::Transient,
            Self::Permanent(_) => FailureKind::Permanent,
            Self::Executor(_) => FailureKind::Executor,
        }
    }

    /// Message without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) | Self::Executor(m) => m,
        }
    }
}

/// Handle returned by `begin_attempt`, used by `start_attempt` and
/// `complete_attempt`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: i64,
    pub stage: StageKind,
    pub item_id: i64,
    pub queued_at: DateTime<Utc>,
}

/// How an attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { result: String },
    Failed { kind: FailureKind, message: String },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed { .. } => JobStatus::Completed,
            Self::Failed { .. } => JobStatus::Failed,
        }
    }
}

impl From<&StageFailure> for JobOutcome {
    fn from(failure: &StageFailure) -> Self {
        Self::Failed {
            kind: failure.kind(),
            message: failure.message().to_string(),
        }
    }
}

/// One row of the job ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub stage: StageKind,
    pub item_id: i64,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Short description of a successful result
    pub result: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub error_message: Option<String>,
    /// Item retry counter at the time the attempt began
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}
