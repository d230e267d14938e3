//! Coroutine and connection identifiers

use core::fmt;

/// Identifier of a coroutine hosted by a worker thread.
///
/// Coroutine ids are dense indices starting at zero. They index the
/// scheduler's pending table and occupy the low bits of every `WrId`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct CoroutineId(u32);

impl CoroutineId {
    /// Create a new CoroutineId from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        CoroutineId(id)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get as usize for indexing
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for CoroutineId {
    #[inline]
    fn from(id: u32) -> Self {
        CoroutineId(id)
    }
}

impl From<CoroutineId> for u32 {
    #[inline]
    fn from(id: CoroutineId) -> Self {
        id.0
    }
}

impl fmt::Debug for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoroutineId({})", self.0)
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cor{}", self.0)
    }
}

/// Handle of a connection registered with a scheduler.
///
/// Only meaningful for the scheduler that issued it. It is never encoded
/// into a completion identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnId(u32);

impl ConnId {
    #[inline]
    pub const fn new(id: u32) -> Self {
        ConnId(id)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnId({})", self.0)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qp{}", self.0)
    }
}
