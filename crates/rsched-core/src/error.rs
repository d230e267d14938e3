//! Error types for the rsched scheduler

use crate::id::ConnId;
use crate::wrid::WrId;

use core::fmt;

/// Result type for scheduler setup and drain operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Result type for posting operations
pub type PostResult<T> = Result<T, PostError>;

/// Errors raised while configuring or running a scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Coroutine-id field width outside 1..=16
    InvalidCorIdBits(u32),

    /// More coroutines requested than the id layout can encode
    TooManyCoroutines { requested: usize, limit: usize },

    /// Other invalid configuration value
    InvalidConfig(&'static str),

    /// A completion that matches no outstanding signaled operation
    UnknownCompletion { conn: ConnId, wr_id: WrId },
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::InvalidCorIdBits(bits) => {
                write!(f, "coroutine id width must be 1..=16 bits, got {}", bits)
            }
            SchedError::TooManyCoroutines { requested, limit } => {
                write!(f, "{} coroutines requested, id layout holds {}", requested, limit)
            }
            SchedError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            SchedError::UnknownCompletion { conn, wr_id } => {
                write!(f, "unknown completion {:?} on {}", wr_id, conn)
            }
        }
    }
}

impl std::error::Error for SchedError {}

/// Synchronous posting failures reported by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostError {
    /// Send queue has no free slots (`ENOMEM` from `ibv_post_send`)
    QueueFull,

    /// A request in a chain was refused; nothing was posted
    Rejected { bad_index: usize, errno: i32 },

    /// Local or remote range outside the registered region
    OutOfBounds,

    /// Any other OS error with errno
    Os(i32),
}

impl PostError {
    /// The errno a verbs provider would have returned.
    pub fn errno(&self) -> i32 {
        match self {
            PostError::QueueFull => libc::ENOMEM,
            PostError::Rejected { errno, .. } => *errno,
            PostError::OutOfBounds => libc::EINVAL,
            PostError::Os(e) => *e,
        }
    }
}

impl fmt::Display for PostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostError::QueueFull => write!(f, "send queue full"),
            PostError::Rejected { bad_index, errno } => {
                write!(f, "chain rejected at item {}: errno {}", bad_index, errno)
            }
            PostError::OutOfBounds => write!(f, "buffer outside registered region"),
            PostError::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for PostError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = SchedError::TooManyCoroutines { requested: 300, limit: 256 };
        assert_eq!(format!("{}", e), "300 coroutines requested, id layout holds 256");

        let e = PostError::Rejected { bad_index: 2, errno: libc::EINVAL };
        assert_eq!(
            format!("{}", e),
            format!("chain rejected at item 2: errno {}", libc::EINVAL)
        );
    }

    #[test]
    fn test_post_errno() {
        assert_eq!(PostError::QueueFull.errno(), libc::ENOMEM);
        assert_eq!(PostError::OutOfBounds.errno(), libc::EINVAL);
        assert_eq!(PostError::Os(libc::ENETDOWN).errno(), libc::ENETDOWN);
    }
}
