//! Coroutine runtime callbacks.
//!
//! The drain loop reports back to whatever schedules coroutines on the
//! worker thread. Two events matter: a coroutine has no RDMA work left in
//! flight, and an operation finished with a failure status.

use crate::entry::WcStatus;
use crate::id::{ConnId, CoroutineId};
use crate::wrid::Watermark;
use crate::kwarn;

/// An operation that completed unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpFailure {
    /// Coroutine decoded from the failed completion.
    pub cor: CoroutineId,
    pub conn: ConnId,
    pub watermark: Watermark,
    pub status: WcStatus,
}

/// Receives drain-loop events.
///
/// **Contract:** callbacks run on the worker thread, inside `poll_comps`.
/// They must not block; they may mark coroutines runnable.
pub trait CoroutineRuntime {
    /// `cor` has no outstanding RDMA operations left.
    fn resume(&mut self, cor: CoroutineId);

    /// An operation resolved with a failure status. Called exactly once per
    /// failed completion, after the owning run has been retired and before
    /// any coroutine it frees is resumed.
    fn failed(&mut self, failure: &OpFailure) {
        kwarn!(
            "rsched: {} on {} failed at watermark {}: {}",
            failure.cor,
            failure.conn,
            failure.watermark,
            failure.status
        );
    }
}

/// No runtime attached: wake-ups are dropped, failures are logged.
impl CoroutineRuntime for () {
    #[inline]
    fn resume(&mut self, _cor: CoroutineId) {}
}

impl<R: CoroutineRuntime + ?Sized> CoroutineRuntime for &mut R {
    #[inline]
    fn resume(&mut self, cor: CoroutineId) {
        (**self).resume(cor)
    }

    #[inline]
    fn failed(&mut self, failure: &OpFailure) {
        (**self).failed(failure)
    }
}
