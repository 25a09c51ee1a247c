//! Domain types for the podcast pipeline.
//!
//! This module contains the core data structures:
//! - Item: an episode and its per-stage markers
//! - Job: one stage attempt in the audit ledger
//! - Digest: payloads, delivery outcomes and batch records

pub mod digest;
pub mod item;
pub mod job;

// Re-export commonly used types
pub use digest::{
    ChannelDelivery, ChannelKind, DeliveryOutcome, DeliveryReport, DigestBatch, DigestEntry,
    DigestPayload, NoOpReason, RecipientError,
};
pub use item::{Highlight, Item, NewItem, Sentiment, StageKind, StageOutput, SummaryRecord};
pub use job::{FailureKind, Job, JobHandle, JobOutcome, JobStatus, StageFailure};
