//! Work request and work completion types.
//!
//! These mirror the shape of `ibv_send_wr` / `ibv_wc` closely enough for a
//! verbs-backed connection to translate them field by field, but are plain
//! safe Rust types. They are the *lingua franca* between the scheduler and
//! every `Connection` implementation.

use crate::wrid::WrId;

use core::fmt;

/// Send flags, bit-compatible with `ibv_send_flags`.
pub mod send_flags {
    /// Order this request after prior RDMA reads/atomics complete.
    pub const FENCE: u32 = 1 << 0;
    /// Produce a work completion for this request.
    pub const SIGNALED: u32 = 1 << 1;
    /// Ask for a solicited event at the responder.
    pub const SOLICITED: u32 = 1 << 2;
    /// Copy the payload into the WQE.
    pub const INLINE: u32 = 1 << 3;
}

/// One-sided operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Read,
    Write,
    CompareSwap,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Read => write!(f, "READ"),
            Opcode::Write => write!(f, "WRITE"),
            Opcode::CompareSwap => write!(f, "CAS"),
        }
    }
}

/// A region of the connection's registered local memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalBuf {
    /// Address (or offset into the local region, for loopback connections).
    pub addr: u64,
    /// Length in bytes.
    pub len: u32,
}

impl LocalBuf {
    #[inline]
    pub const fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }
}

/// A single work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkRequest {
    /// Correlation token handed back in the completion.
    pub wr_id: WrId,
    pub opcode: Opcode,
    pub local: LocalBuf,
    /// Offset into the peer's registered region.
    pub remote_offset: u64,
    /// `send_flags::*`
    pub flags: u32,
    /// Compare operand (CAS only).
    pub compare: u64,
    /// Swap operand (CAS only).
    pub swap: u64,
}

impl WorkRequest {
    pub fn read(local: LocalBuf, remote_offset: u64, flags: u32) -> Self {
        Self {
            wr_id: WrId(0),
            opcode: Opcode::Read,
            local,
            remote_offset,
            flags,
            compare: 0,
            swap: 0,
        }
    }

    pub fn write(local: LocalBuf, remote_offset: u64, flags: u32) -> Self {
        Self {
            opcode: Opcode::Write,
            ..Self::read(local, remote_offset, flags)
        }
    }

    /// 8-byte atomic compare-and-swap; the old remote value lands in `local`.
    pub fn compare_swap(
        local: LocalBuf,
        remote_offset: u64,
        compare: u64,
        swap: u64,
        flags: u32,
    ) -> Self {
        Self {
            wr_id: WrId(0),
            opcode: Opcode::CompareSwap,
            local,
            remote_offset,
            flags,
            compare,
            swap,
        }
    }

    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.flags & send_flags::SIGNALED != 0
    }
}

/// Completion status, a subset of `ibv_wc_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WcStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    RemoteAccessError,
    RetryExceeded,
    /// Flushed because the queue pair went to the error state.
    WrFlushError,
    Other(u32),
}

impl WcStatus {
    #[inline]
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WcStatus::Success => write!(f, "success"),
            WcStatus::LocalLengthError => write!(f, "local length error"),
            WcStatus::LocalProtectionError => write!(f, "local protection error"),
            WcStatus::RemoteAccessError => write!(f, "remote access error"),
            WcStatus::RetryExceeded => write!(f, "transport retry counter exceeded"),
            WcStatus::WrFlushError => write!(f, "work request flushed"),
            WcStatus::Other(code) => write!(f, "status {}", code),
        }
    }
}

/// A polled work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    /// The `wr_id` of the signaled request.
    pub wr_id: WrId,
    pub status: WcStatus,
    pub opcode: Opcode,
    /// Bytes transferred (reads and CAS).
    pub byte_len: u32,
}

impl WorkCompletion {
    /// Placeholder used to size poll buffers.
    pub const EMPTY: Self = Self {
        wr_id: WrId(0),
        status: WcStatus::Success,
        opcode: Opcode::Read,
        byte_len: 0,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let buf = LocalBuf::new(64, 8);
        let r = WorkRequest::read(buf, 128, send_flags::SIGNALED);
        assert_eq!(r.opcode, Opcode::Read);
        assert!(r.is_signaled());

        let w = WorkRequest::write(buf, 128, 0);
        assert_eq!(w.opcode, Opcode::Write);
        assert_eq!(w.local, buf);
        assert!(!w.is_signaled());

        let c = WorkRequest::compare_swap(buf, 0, 1, 2, send_flags::FENCE);
        assert_eq!((c.compare, c.swap), (1, 2));
        assert!(!c.is_signaled());
    }

    #[test]
    fn test_status_display() {
        assert!(WcStatus::Success.is_success());
        assert!(!WcStatus::WrFlushError.is_success());
        assert_eq!(format!("{}", WcStatus::Other(21)), "status 21");
        assert_eq!(format!("{}", Opcode::CompareSwap), "CAS");
    }
}
