//! Library defaults for `SchedConfig`.

use rsched_core::constants::{DEFAULT_MAX_COROUTINES, DEFAULT_POLL_BATCH};
use rsched_core::wrid::COR_ID_BIT;

/// Coroutines per worker thread
pub const MAX_COROUTINES: usize = DEFAULT_MAX_COROUTINES;

/// Width of the coroutine-id field in a `WrId`
pub const COR_ID_BITS: u32 = COR_ID_BIT;

/// Completions fetched per connection per drain pass
pub const POLL_BATCH: usize = DEFAULT_POLL_BATCH;

/// Apply the notification-required check to single operations too
pub const COALESCE_SINGLES: bool = true;

/// Trace every post and completion
pub const DEBUG_LOGGING: bool = false;
