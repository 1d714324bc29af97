//! `jobhost-jobs`: background job engine with SQLite persistence.
//!
//! # Overview
//!
//! A [`Job`] is a unit of background work with a persisted identity. Jobs
//! are submitted to a [`CommandProcessor`], which registers them with the
//! [`JobRegistry`] (persisting them as `queued`) and hands them to a fixed
//! pool of worker threads in submission order.
//!
//! | Status        | Meaning                                             |
//! |---------------|-----------------------------------------------------|
//! | `queued`      | Registered, waiting for a worker                    |
//! | `in_progress` | A worker is running the job's work function         |
//! | `stopped`     | Stopped by an operator (terminal)                   |
//! | `done`        | Work function returned, progress is 100 (terminal)  |
//!
//! Cancellation is cooperative: a stop is recorded immediately, and a
//! running job unwinds at its next progress report or checkpoint.
//!
//! The registry can always be rebuilt from the store with
//! [`JobRegistry::recover`], so any handler or a restarted process sees the
//! same queued and active sets.

pub mod db;
pub mod error;
pub mod job;
pub mod kinds;
pub mod log;
pub mod periodic;
pub mod processor;
pub mod registry;
pub mod store;
pub mod types;

pub use error::{JobError, Result};
pub use job::{Job, JobContext, Work};
pub use periodic::{PeriodicScheduler, PeriodicTrigger};
pub use processor::CommandProcessor;
pub use registry::JobRegistry;
pub use store::JobStore;
pub use types::{AuditEntry, AuditStatus, CommandOutcome, JobRecord, JobStatus};
