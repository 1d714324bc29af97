//! `jobhost-core`: configuration and shared error types for the job host.

pub mod config;
pub mod error;

pub use config::JobhostConfig;
pub use error::{JobhostError, Result};
