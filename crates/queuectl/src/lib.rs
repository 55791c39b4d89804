//! Persistent background job queue for shell commands.
//!
//! Jobs live in a SQLite store ([`jobs::JobsRepo`]); a [`jobs::WorkerPool`]
//! leases them, runs them through an [`jobs::Executor`], and retries failures
//! with exponential backoff until they land in the dead-letter queue.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod service;
pub mod settings;
pub mod shutdown;
pub mod telemetry;

pub use error::{QueueError, Result};
