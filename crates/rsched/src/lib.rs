//! # rsched
//!
//! Per-worker RDMA operation scheduler for coroutine-based transaction
//! engines.
//!
//! This crate provides:
//! - The issuance façade (`read`, `write`, `compare_and_swap`, doorbell
//!   batches) with completion-signal coalescing
//! - Pending-operation accounting per coroutine and per connection
//! - The completion drain loop (`poll_comps`) that resumes coroutines
//! - Configuration with environment overrides
//! - Diagnostic counters and a one-line report
//! - `LoopbackQp`, an in-memory connection for tests and smoke runs
//!
//! A scheduler and its connections belong to one worker thread. There is
//! no locking anywhere in the issuance or drain paths.

pub mod config;
pub mod pending;
pub mod scheduler;
pub mod stats;
pub mod loopback;

// Re-exports
pub use config::SchedConfig;
pub use pending::PendingTable;
pub use scheduler::{Posted, RdmaScheduler};
pub use stats::SchedStats;
pub use loopback::{Delivery, LoopbackConfig, LoopbackQp};

pub use rsched_core::{
    send_flags, ConnId, Connection, CoroutineId, CoroutineRuntime, LocalBuf, OpFailure,
    PostError, SchedError, WcStatus, WorkCompletion, WorkRequest, Watermark, WrId, WrIdLayout,
};
