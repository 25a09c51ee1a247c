//! podcast-agent - Podcast pipeline orchestrator
//!
//! Tracks podcast episodes through download, transcription and
//! summarization, then sends a daily digest of what was summarized.
//!
//! # Architecture
//!
//! All state lives in one SQLite database:
//! - The item registry holds each episode and its per-stage completion markers
//! - Eligibility for a stage is derived from those markers, never stored
//! - The job ledger records every stage attempt for auditing only
//! - Failed items stay eligible and are retried on the next run
//!
//! # Modules
//!
//! - `adapters`: External system integrations (RSS, HTTP, whisper, Ollama, SMTP, Telegram, webhooks)
//! - `core`: Orchestration logic (Registry, Ledger, Scheduler, Digest)
//! - `domain`: Data structures (Item, Job, Digest)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Fetch feeds and process everything eligible
//! podcast-agent run
//!
//! # Preview today's digest
//! podcast-agent digest --dry-run
//!
//! # Run on a schedule
//! podcast-agent daemon
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

#[cfg(test)]
mod test_support;

// Re-export main types at crate root for convenience
pub use crate::config::Settings;
pub use crate::core::{Database, Orchestrator};
pub use crate::domain::{Item, StageKind};
