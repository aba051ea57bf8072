//! Download job lifecycle.
//!
//! Core components:
//! - `state`: Job status machine (Starting → Running → Completed/Stopped/Error)
//! - `store`: JobStore registry and per-job cancellation signals
//! - `runner`: JobRunner driving one job against a chat source
//! - `manager`: JobManager with admission control, submission, stop, queries

pub mod manager;
pub mod runner;
pub mod state;
pub mod store;

pub use manager::{Artifact, DownloadConfig, DownloadRequest, JobManager, JobSummary, Submission};
pub use runner::{JobRunner, RunnerDeps};
pub use state::{JobRecord, JobStatus, OutputFormat, StateTransition};
pub use store::{CancelSignal, JobStore};
