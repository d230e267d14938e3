//! # rsched-core
//!
//! Core types and traits for the rsched RDMA operation scheduler.
//!
//! This crate is platform-agnostic and contains no verbs or device code.
//! It defines the vocabulary shared by the scheduler, the connections it
//! drives and the coroutine runtime it reports to.
//!
//! ## Modules
//!
//! - `id` - coroutine and connection identifiers
//! - `wrid` - completion identifier codec (coroutine id + watermark)
//! - `entry` - work request and work completion types
//! - `connection` - the queue-pair capability trait
//! - `runtime` - the coroutine runtime callback trait
//! - `error` - error types
//! - `kprint` - kernel-style debug printing macros
//! - `env` - environment variable utilities

pub mod id;
pub mod wrid;
pub mod entry;
pub mod connection;
pub mod runtime;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{ConnId, CoroutineId};
pub use wrid::{Watermark, WrId, WrIdLayout, COR_ID_BIT};
pub use entry::{send_flags, LocalBuf, Opcode, WcStatus, WorkCompletion, WorkRequest};
pub use connection::Connection;
pub use runtime::{CoroutineRuntime, OpFailure};
pub use error::{PostError, PostResult, SchedError, SchedResult};
pub use env::{env_get, env_get_bool};

/// Constants shared across the workspace
pub mod constants {
    /// Widest coroutine-id field a `WrIdLayout` accepts.
    pub const MAX_COR_ID_BITS: u32 = 16;

    /// Default number of coroutines hosted by one worker thread.
    pub const DEFAULT_MAX_COROUTINES: usize = 1 << crate::wrid::COR_ID_BIT;

    /// Default number of completions fetched per connection poll.
    pub const DEFAULT_POLL_BATCH: usize = 64;
}
