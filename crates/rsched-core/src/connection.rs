//! Queue-pair abstraction.
//!
//! A `Connection` is one reliable-connected RDMA endpoint. The scheduler
//! never looks inside it: it stamps identifiers, asks whether a
//! notification is mandatory, posts, and polls.
//!
//! # Implementors
//!
//! - `LoopbackQp` (in `rsched`): in-memory connection with a bounded send
//!   queue, an unsignaled-run threshold and failure injection. Used by the
//!   tests and the smoke binary.
//!
//! - A verbs-backed queue pair: translates `WorkRequest` into
//!   `ibv_send_wr` and polls its send CQ with `ibv_poll_cq`.

use crate::entry::{WorkCompletion, WorkRequest};
use crate::error::PostResult;
use crate::wrid::Watermark;

/// Posting, flow control and completion polling for one connection.
///
/// **Contract:**
/// - No method may block.
/// - A signaled completion confirms every request posted before it on the
///   same connection (reliable-connected ordering).
/// - A failed post leaves the send queue unchanged.
pub trait Connection {
    /// Post one RDMA read or write.
    fn post_single(&mut self, wr: &WorkRequest) -> PostResult<()>;

    /// Post one atomic compare-and-swap.
    fn post_cas(&mut self, wr: &WorkRequest) -> PostResult<()>;

    /// Post a chain of requests with a single doorbell.
    ///
    /// On failure, `PostError::Rejected { bad_index, .. }` names the first
    /// request that was not accepted; nothing from the chain is posted.
    fn post_chain(&mut self, chain: &[WorkRequest]) -> PostResult<()>;

    /// Whether the next post must carry a notification.
    ///
    /// True once the run of unsignaled requests has reached the
    /// connection's threshold; the send queue cannot be reclaimed until a
    /// signaled completion is polled.
    fn notification_required(&self) -> bool;

    /// Current value of the connection's sequence counter.
    fn high_watermark(&self) -> Watermark;

    /// Advance the sequence counter by `span` and return the new value.
    fn advance_watermark(&mut self, span: u64) -> Watermark;

    /// Undo an advance whose post failed.
    fn rewind_watermark(&mut self, span: u64);

    /// Poll for completions (non-blocking).
    ///
    /// Fills at most `buf.len()` entries and returns how many were written.
    /// Returns 0 when nothing is ready.
    fn poll_completions(&mut self, buf: &mut [WorkCompletion]) -> usize;
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn post_single(&mut self, wr: &WorkRequest) -> PostResult<()> {
        (**self).post_single(wr)
    }

    fn post_cas(&mut self, wr: &WorkRequest) -> PostResult<()> {
        (**self).post_cas(wr)
    }

    fn post_chain(&mut self, chain: &[WorkRequest]) -> PostResult<()> {
        (**self).post_chain(chain)
    }

    fn notification_required(&self) -> bool {
        (**self).notification_required()
    }

    fn high_watermark(&self) -> Watermark {
        (**self).high_watermark()
    }

    fn advance_watermark(&mut self, span: u64) -> Watermark {
        (**self).advance_watermark(span)
    }

    fn rewind_watermark(&mut self, span: u64) {
        (**self).rewind_watermark(span)
    }

    fn poll_completions(&mut self, buf: &mut [WorkCompletion]) -> usize {
        (**self).poll_completions(buf)
    }
}
