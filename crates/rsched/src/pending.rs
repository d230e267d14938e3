//! Pending-operation accounting.
//!
//! Three pieces of state, all owned by one worker thread:
//!
//! - `counts[cor]`: issuances by `cor` not yet resolved. Zero means the
//!   coroutine has no RDMA work in flight.
//! - `runs[conn]`: every unresolved issuance on `conn`, in watermark order.
//!   A signaled completion at watermark `w` resolves the whole prefix up to
//!   `w`, including unsignaled issuances of other coroutines.
//! - `signals`: one `ConnId` per signaled issuance whose completion has not
//!   been consumed yet (duplicates allowed). This is the drain loop's
//!   work list.

use rsched_core::id::{ConnId, CoroutineId};
use rsched_core::wrid::Watermark;

use std::collections::VecDeque;

/// One unresolved issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InflightOp {
    pub watermark: Watermark,
    pub cor: CoroutineId,
    pub signaled: bool,
}

#[derive(Debug, Default)]
struct ConnRun {
    ops: VecDeque<InflightOp>,
    /// Entries of this connection in `signals`.
    owed: u32,
    /// Signals consumed in the current drain pass, not yet compacted.
    consumed: u32,
}

/// Per-worker pending table.
#[derive(Debug)]
pub struct PendingTable {
    counts: Box<[u32]>,
    total: u64,
    runs: Vec<ConnRun>,
    signals: VecDeque<ConnId>,
}

impl PendingTable {
    /// Zeroed table for `max_coroutines` coroutines.
    pub fn new(max_coroutines: usize) -> Self {
        Self {
            counts: vec![0u32; max_coroutines].into_boxed_slice(),
            total: 0,
            runs: Vec::new(),
            signals: VecDeque::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.counts.len()
    }

    /// Start accounting for `conn`. Ids are handed out densely.
    pub(crate) fn track_connection(&mut self, conn: ConnId) {
        if self.runs.len() <= conn.as_usize() {
            self.runs.resize_with(conn.as_usize() + 1, ConnRun::default);
        }
    }

    /// Account one issuance by `cor` on `conn`, stamped with `watermark`.
    ///
    /// Every issuance counts once against `cor`. Only signaled issuances
    /// put `conn` on the drain work list.
    pub(crate) fn record_pending(
        &mut self,
        cor: CoroutineId,
        conn: ConnId,
        watermark: Watermark,
        signaled: bool,
    ) {
        let run = &mut self.runs[conn.as_usize()];
        debug_assert!(
            run.ops.back().map_or(true, |op| op.watermark < watermark),
            "watermark {} is not beyond the tail of {}",
            watermark,
            conn
        );
        run.ops.push_back(InflightOp { watermark, cor, signaled });
        if signaled {
            run.owed += 1;
            self.signals.push_back(conn);
        }
        self.counts[cor.as_usize()] += 1;
        self.total += 1;
    }

    /// Outstanding issuances of `cor`.
    #[inline]
    pub fn pending(&self, cor: CoroutineId) -> u32 {
        self.counts[cor.as_usize()]
    }

    #[inline]
    pub fn total_pending(&self) -> u64 {
        self.total
    }

    /// Drain work list, in issuance order.
    pub fn pending_connections(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.signals.iter().copied()
    }

    #[inline]
    pub fn pending_connection_entries(&self) -> usize {
        self.signals.len()
    }

    /// Signaled completions `conn` still owes.
    #[inline]
    pub fn owed(&self, conn: ConnId) -> u32 {
        self.runs[conn.as_usize()].owed
    }

    /// Unresolved issuances on `conn`.
    #[inline]
    pub fn inflight(&self, conn: ConnId) -> usize {
        self.runs[conn.as_usize()].ops.len()
    }

    /// The signaled issuance on `conn` stamped with exactly `watermark`.
    pub(crate) fn signaled_at(&self, conn: ConnId, watermark: Watermark) -> Option<InflightOp> {
        let ops = &self.runs[conn.as_usize()].ops;
        ops.binary_search_by_key(&watermark, |op| op.watermark)
            .ok()
            .map(|i| ops[i])
            .filter(|op| op.signaled)
    }

    /// Resolve every issuance on `conn` up to and including `watermark`.
    ///
    /// `on_idle` sees each coroutine whose count drops to zero. Returns the
    /// number of issuances resolved.
    pub(crate) fn retire_through<F>(
        &mut self,
        conn: ConnId,
        watermark: Watermark,
        mut on_idle: F,
    ) -> usize
    where
        F: FnMut(CoroutineId),
    {
        let run = &mut self.runs[conn.as_usize()];
        let mut retired = 0;
        while let Some(op) = run.ops.front().copied() {
            if op.watermark > watermark {
                break;
            }
            run.ops.pop_front();
            if op.signaled && op.watermark != watermark {
                // An earlier signal absorbed by this one; its own completion
                // is no longer awaited.
                run.owed -= 1;
                run.consumed += 1;
            }
            let count = &mut self.counts[op.cor.as_usize()];
            *count -= 1;
            self.total -= 1;
            retired += 1;
            if *count == 0 {
                on_idle(op.cor);
            }
        }
        retired
    }

    /// Mark one of `conn`'s signal entries as consumed by a completion.
    pub(crate) fn consume_signal(&mut self, conn: ConnId) {
        let run = &mut self.runs[conn.as_usize()];
        debug_assert!(run.owed > 0, "{} owes no completion", conn);
        run.owed -= 1;
        run.consumed += 1;
    }

    /// Drop consumed entries from the work list, oldest first per
    /// connection. Entries of other connections keep their order.
    pub(crate) fn compact_signals(&mut self) {
        let runs = &mut self.runs;
        if runs.iter().all(|r| r.consumed == 0) {
            return;
        }
        self.signals.retain(|conn| {
            let run = &mut runs[conn.as_usize()];
            if run.consumed > 0 {
                run.consumed -= 1;
                false
            } else {
                true
            }
        });
    }

    /// Coroutines with outstanding work, ascending by id.
    pub fn busy_coroutines(&self) -> impl Iterator<Item = (CoroutineId, u32)> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, n)| **n > 0)
            .map(|(i, &n)| (CoroutineId::new(i as u32), n))
    }
}
