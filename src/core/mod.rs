//! Core orchestration logic.
//!
//! This module contains:
//! - Database: shared SQLite handle and schema
//! - ItemRegistry: per-item stage state
//! - JobLedger: append-only audit of stage attempts
//! - StageScheduler: bounded-concurrency stage runs
//! - DigestWindowSelector, FanoutDispatcher, DigestLog: the digest path
//! - Orchestrator: wires all of the above to the adapters

pub mod database;
pub mod digest_log;
pub mod fanout;
pub mod ledger;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod window;

// Re-export commonly used types
pub use database::{Database, StoreError};
pub use digest_log::DigestLog;
pub use fanout::FanoutDispatcher;
pub use ledger::JobLedger;
pub use orchestrator::{
    next_digest_at, DeliveryChannel, DigestReport, Orchestrator, PipelineReport, StageExecutors,
    StatusReport,
};
pub use registry::{ItemRegistry, RegistryStats};
pub use scheduler::{SchedulerError, StageRunSummary, StageScheduler};
pub use window::DigestWindowSelector;
