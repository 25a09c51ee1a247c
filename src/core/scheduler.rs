//! Stage scheduler: runs one stage over a snapshot of eligible items.
//!
//! Each item gets its own task; a semaphore keeps at most `concurrency`
//! executor calls in flight. Per item the sequence is fixed:
//!
//! 1. open a `pending` ledger row
//! 2. wait for a worker slot, then mark the row `processing`
//! 3. run the executor (a panic is caught and becomes a failure)
//! 4. record the outcome in the registry, exactly once
//! 5. finalize the ledger row
//!
//! When the registry refuses a successful output (missing predecessor,
//! unknown item, storage error) the refusal itself is recorded as the
//! item's failure, so every attempt leaves a trace on the item.
//!
//! Nothing that happens to one item affects the others. Ledger writes are
//! best effort; a failed ledger write is logged and the item proceeds.
//! SQLite calls run on the blocking pool so slow disks never stall the
//! async workers.
//!
//! There is no claim step between snapshot and commit, so two overlapping
//! runs against the same database can process the same item twice.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::database::StoreError;
use super::ledger::JobLedger;
use super::registry::ItemRegistry;
use crate::adapters::StageExecutor;
use crate::domain::{
    FailureKind, Item, JobHandle, JobOutcome, StageFailure, StageKind, StageOutput,
};

/// Errors that abort a whole stage run
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("failed to load eligible items: {0}")]
    Registry(#[from] StoreError),
}

/// Aggregate result of one stage run. `attempted == succeeded + failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageRunSummary {
    pub stage: StageKind,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl StageRunSummary {
    pub fn empty(stage: StageKind) -> Self {
        Self {
            stage,
            attempted: 0,
            succeeded: 0,
            failed: 0,
        }
    }
}

/// Bounded-concurrency stage runner
#[derive(Debug, Clone)]
pub struct StageScheduler {
    registry: ItemRegistry,
    ledger: JobLedger,
}

impl StageScheduler {
    pub fn new(registry: ItemRegistry, ledger: JobLedger) -> Self {
        Self { registry, ledger }
    }

    /// Snapshot every eligible item for `stage` and run it
    pub async fn run_stage(
        &self,
        stage: StageKind,
        executor: Arc<dyn StageExecutor>,
        concurrency: usize,
    ) -> Result<StageRunSummary, SchedulerError> {
        self.run_stage_limited(stage, executor, concurrency, None)
            .await
    }

    /// Like [`run_stage`](Self::run_stage) with the snapshot capped at `limit` items
    pub async fn run_stage_limited(
        &self,
        stage: StageKind,
        executor: Arc<dyn StageExecutor>,
        concurrency: usize,
        limit: Option<usize>,
    ) -> Result<StageRunSummary, SchedulerError> {
        if concurrency == 0 {
            return Err(SchedulerError::InvalidConcurrency);
        }

        // Items that become eligible after this point wait for the next run
        let snapshot = self.registry.eligible_for(stage, limit)?;
        self.dispatch(stage, snapshot, executor, concurrency).await
    }

    /// Run `executor` over an explicit snapshot
    #[instrument(skip(self, snapshot, executor), fields(stage = %stage, executor = executor.name(), items = snapshot.len()))]
    pub async fn dispatch(
        &self,
        stage: StageKind,
        snapshot: Vec<Item>,
        executor: Arc<dyn StageExecutor>,
        concurrency: usize,
    ) -> Result<StageRunSummary, SchedulerError> {
        if concurrency == 0 {
            return Err(SchedulerError::InvalidConcurrency);
        }

        if snapshot.is_empty() {
            debug!("No eligible items");
            return Ok(StageRunSummary::empty(stage));
        }

        info!(concurrency, "Dispatching stage");

        let attempted = snapshot.len();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut join_set: JoinSet<bool> = JoinSet::new();

        for item in snapshot {
            let worker = ItemWorker {
                registry: self.registry.clone(),
                ledger: self.ledger.clone(),
                executor: Arc::clone(&executor),
                stage,
            };
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(worker.process(item, semaphore));
        }

        let mut succeeded = 0;
        let mut failed = 0;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(true) => succeeded += 1,
                Ok(false) => failed += 1,
                Err(e) => {
                    error!(error = %e, "Item task aborted");
                    failed += 1;
                }
            }
        }

        let summary = StageRunSummary {
            stage,
            attempted,
            succeeded,
            failed,
        };
        info!(succeeded, failed, "Stage complete");
        Ok(summary)
    }
}

/// Everything one item task needs
struct ItemWorker {
    registry: ItemRegistry,
    ledger: JobLedger,
    executor: Arc<dyn StageExecutor>,
    stage: StageKind,
}

impl ItemWorker {
    /// Returns true when the item's stage artifact was committed
    async fn process(self, item: Item, slots: Arc<Semaphore>) -> bool {
        let stage = self.stage;
        let item_id = item.id;

        let handle = self.open_job(&item).await;

        let permit = slots.acquire_owned().await;
        let started_at = match (&permit, &handle) {
            (Ok(_), Some(handle)) => self.start_job(handle).await,
            _ => Utc::now(),
        };

        let outcome = match permit {
            Ok(_permit) => match self.execute_isolated(item).await {
                Ok(output) if output.stage() != stage => Err(StageFailure::Permanent(format!(
                    "executor returned {} output for the {} stage",
                    output.stage(),
                    stage
                ))),
                other => other,
            },
            Err(_) => Err(StageFailure::Executor("worker pool closed".to_string())),
        };

        let recorded = self.record(item_id, started_at, outcome.clone()).await;

        let (succeeded, job_outcome) = match (&outcome, &recorded) {
            (Ok(output), Ok(())) => {
                debug!(item_id, %stage, artifact = output.artifact(), "Item complete");
                (
                    true,
                    JobOutcome::Completed {
                        result: output.describe(),
                    },
                )
            }
            (Ok(_), Err(e)) => {
                error!(item_id, %stage, error = %e, "Failed to record stage output");
                let failure = rejected_commit(e);
                if let Err(e) = self.record(item_id, started_at, Err(failure.clone())).await {
                    error!(item_id, %stage, error = %e, "Failed to record stage failure");
                }
                (false, JobOutcome::from(&failure))
            }
            (Err(failure), recorded) => {
                warn!(item_id, %stage, kind = failure.kind().as_str(), error = %failure, "Item failed");
                if let Err(e) = recorded {
                    error!(item_id, %stage, error = %e, "Failed to record stage failure");
                }
                (false, JobOutcome::from(failure))
            }
        };

        if let Some(handle) = handle {
            let ledger = self.ledger.clone();
            let job_id = handle.id;
            let finalized =
                blocking(move || ledger.complete_attempt(&handle, &job_outcome)).await;
            if let Err(e) = finalized {
                warn!(item_id, job_id, error = %e, "Failed to finalize job row");
            }
        }

        succeeded
    }

    async fn open_job(&self, item: &Item) -> Option<JobHandle> {
        let ledger = self.ledger.clone();
        let stage = self.stage;
        let queued = item.clone();
        match blocking(move || ledger.begin_attempt(stage, &queued)).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(item_id = item.id, %stage, error = %e, "Failed to open job row");
                None
            }
        }
    }

    /// Mark the job `processing`; the returned time is the attempt's start
    async fn start_job(&self, handle: &JobHandle) -> DateTime<Utc> {
        let ledger = self.ledger.clone();
        let running = handle.clone();
        match blocking(move || ledger.start_attempt(&running)).await {
            Ok(started_at) => started_at,
            Err(e) => {
                warn!(job_id = handle.id, error = %e, "Failed to mark job processing");
                Utc::now()
            }
        }
    }

    async fn record(
        &self,
        item_id: i64,
        started_at: DateTime<Utc>,
        outcome: Result<StageOutput, StageFailure>,
    ) -> Result<(), StoreError> {
        let registry = self.registry.clone();
        let stage = self.stage;
        blocking(move || registry.record_outcome(item_id, stage, started_at, &outcome)).await
    }

    /// Run the executor on its own task so a panic stays contained
    async fn execute_isolated(&self, item: Item) -> Result<StageOutput, StageFailure> {
        let executor = Arc::clone(&self.executor);
        let task = tokio::spawn(async move { executor.execute(&item).await });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(StageFailure::Executor(format!(
                "executor panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(e) => Err(StageFailure::Executor(format!("executor cancelled: {}", e))),
        }
    }
}

/// Run a store call on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(StoreError::TaskFailed(e.to_string())))
}

/// Failure recorded on the item when the registry refuses its output
fn rejected_commit(err: &StoreError) -> StageFailure {
    let message = format!("failed to record output: {}", err);
    match store_failure_kind(err) {
        FailureKind::Permanent => StageFailure::Permanent(message),
        _ => StageFailure::Transient(message),
    }
}

fn store_failure_kind(err: &StoreError) -> FailureKind {
    match err {
        StoreError::MissingPrerequisite { .. }
        | StoreError::StageMismatch { .. }
        | StoreError::NotFound(_) => FailureKind::Permanent,
        _ => FailureKind::Transient,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
