//! Per-worker RDMA operation scheduler
//!
//! One `RdmaScheduler` per worker thread. Coroutines on that thread issue
//! reads, writes, CAS and doorbell batches through it; the worker loop calls
//! `poll_comps()` once per tick to turn hardware completions back into
//! runnable coroutines.
//!
//! ```text
//!  coroutine ──read/write/cas/batch──▶ RdmaScheduler ──post──▶ Connection
//!                                          │ record_pending        │
//!                                          ▼                       │ CQE
//!                                     PendingTable ◀──poll_comps───┘
//!                                          │ count hits 0
//!                                          ▼
//!                                   CoroutineRuntime::resume
//! ```
//!
//! ## Signal coalescing
//!
//! A notification per operation is expensive, so by default only the
//! operations a caller marks `SIGNALED` ask for one. A connection can only
//! reclaim send-queue slots when a signaled completion is polled, so once
//! its unsignaled run reaches the connection's threshold
//! (`notification_required()`), the scheduler adds `SIGNALED` to the next
//! submission itself. Caller-owned requests are never modified: the
//! scheduler builds its own copy and adjusts that.
//!
//! ## Accounting
//!
//! Every issuance counts once against its coroutine. A signaled completion
//! at watermark `w` on a connection resolves every issuance on that
//! connection up to `w`, because a reliable connection completes its send
//! queue in order.

use crate::config::SchedConfig;
use crate::pending::PendingTable;
use crate::stats::{Counters, SchedStats};

use rsched_core::connection::Connection;
use rsched_core::entry::{send_flags, LocalBuf, Opcode, WorkCompletion, WorkRequest};
use rsched_core::error::{PostResult, SchedError, SchedResult};
use rsched_core::id::{ConnId, CoroutineId};
use rsched_core::runtime::{CoroutineRuntime, OpFailure};
use rsched_core::wrid::{Watermark, WrId, WrIdLayout};
use rsched_core::{kdebug, kinfo, kwarn};

/// Outcome of an accepted issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posted {
    /// Identifier stamped on the (doorbell) request.
    pub wr_id: WrId,
    pub watermark: Watermark,
    /// The submission will produce a completion; a drain is needed.
    pub signaled: bool,
    /// `signaled` was added by the scheduler, not requested.
    pub forced: bool,
}

struct ConnSlot<C> {
    conn: C,
    /// Last drain pass that visited this connection.
    pass: u64,
}

/// Per-worker scheduler over connections of type `C`.
///
/// Use `Box<dyn Connection>` for `C` to mix connection types.
pub struct RdmaScheduler<C: Connection> {
    config: SchedConfig,
    layout: WrIdLayout,
    conns: Vec<ConnSlot<C>>,
    pending: PendingTable,
    counters: Counters,
    /// Drain pass number.
    pass: u64,
    // Scratch buffers reused across calls.
    comp_buf: Vec<WorkCompletion>,
    chain_buf: Vec<WorkRequest>,
    visit: Vec<ConnId>,
    woken: Vec<CoroutineId>,
}

impl<C: Connection> RdmaScheduler<C> {
    /// Create a scheduler sized for `config.max_coroutines`.
    pub fn new(config: SchedConfig) -> SchedResult<Self> {
        config.validate()?;
        let layout = config.layout()?;
        kdebug!(
            "rsched: init {} coroutines, {}-bit coroutine ids, poll batch {}",
            config.max_coroutines,
            layout.cor_id_bits(),
            config.poll_batch
        );
        Ok(Self {
            layout,
            conns: Vec::new(),
            pending: PendingTable::new(config.max_coroutines),
            counters: Counters::default(),
            pass: 0,
            comp_buf: vec![WorkCompletion::EMPTY; config.poll_batch],
            chain_buf: Vec::new(),
            visit: Vec::new(),
            woken: Vec::new(),
            config,
        })
    }

    /// Scheduler for a worker hosting `coroutines` coroutines, everything
    /// else from `SchedConfig::from_env()`.
    pub fn thread_local_init(coroutines: usize) -> SchedResult<Self> {
        Self::new(SchedConfig::from_env().max_coroutines(coroutines))
    }

    /// Hand `conn` to the scheduler.
    pub fn register(&mut self, conn: C) -> ConnId {
        let id = ConnId::new(self.conns.len() as u32);
        self.conns.push(ConnSlot { conn, pass: 0 });
        self.pending.track_connection(id);
        kdebug!("rsched: registered {}", id);
        id
    }

    pub fn connection(&self, id: ConnId) -> &C {
        &self.slot(id).conn
    }

    pub fn connection_mut(&mut self, id: ConnId) -> &mut C {
        &mut self.slot_mut(id).conn
    }

    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn layout(&self) -> WrIdLayout {
        self.layout
    }

    pub fn pending_table(&self) -> &PendingTable {
        &self.pending
    }

    /// Outstanding operations of `cor`. Zero means schedulable.
    #[inline]
    pub fn pending(&self, cor: CoroutineId) -> u32 {
        self.pending.pending(cor)
    }

    #[inline]
    pub fn is_idle(&self, cor: CoroutineId) -> bool {
        self.pending(cor) == 0
    }

    #[inline]
    pub fn total_pending(&self) -> u64 {
        self.pending.total_pending()
    }

    fn slot(&self, id: ConnId) -> &ConnSlot<C> {
        self.conns
            .get(id.as_usize())
            .unwrap_or_else(|| panic!("{} is not registered with this scheduler", id))
    }

    fn slot_mut(&mut self, id: ConnId) -> &mut ConnSlot<C> {
        self.conns
            .get_mut(id.as_usize())
            .unwrap_or_else(|| panic!("{} is not registered with this scheduler", id))
    }

    #[inline]
    fn check_coroutine(&self, cor: CoroutineId) {
        assert!(
            cor.as_usize() < self.pending.capacity(),
            "{} is outside the {}-coroutine pending table",
            cor,
            self.pending.capacity()
        );
    }

    // ── Issuance ─────────────────────────────────────────────────────

    /// One-sided read of `local.len` bytes at `remote_offset` into `local`.
    ///
    /// # Panics
    ///
    /// If `cor` is outside the pending table or `conn` is not registered.
    pub fn read(
        &mut self,
        conn: ConnId,
        cor: CoroutineId,
        local: LocalBuf,
        remote_offset: u64,
        flags: u32,
    ) -> PostResult<Posted> {
        self.post_one(conn, cor, WorkRequest::read(local, remote_offset, flags))
    }

    /// One-sided write of `local` to `remote_offset`.
    ///
    /// # Panics
    ///
    /// If `cor` is outside the pending table or `conn` is not registered.
    pub fn write(
        &mut self,
        conn: ConnId,
        cor: CoroutineId,
        local: LocalBuf,
        remote_offset: u64,
        flags: u32,
    ) -> PostResult<Posted> {
        self.post_one(conn, cor, WorkRequest::write(local, remote_offset, flags))
    }

    /// Signaled `read`.
    pub fn one_read(
        &mut self,
        conn: ConnId,
        cor: CoroutineId,
        local: LocalBuf,
        remote_offset: u64,
    ) -> PostResult<Posted> {
        self.read(conn, cor, local, remote_offset, send_flags::SIGNALED)
    }

    /// Signaled `write`.
    pub fn one_write(
        &mut self,
        conn: ConnId,
        cor: CoroutineId,
        local: LocalBuf,
        remote_offset: u64,
    ) -> PostResult<Posted> {
        self.write(conn, cor, local, remote_offset, send_flags::SIGNALED)
    }

    /// Atomic compare-and-swap on the 8 bytes at `remote_offset`. The prior
    /// remote value lands in `local`.
    ///
    /// # Panics
    ///
    /// If `cor` is outside the pending table or `conn` is not registered.
    #[allow(clippy::too_many_arguments)]
    pub fn compare_and_swap(
        &mut self,
        conn: ConnId,
        cor: CoroutineId,
        local: LocalBuf,
        remote_offset: u64,
        expected: u64,
        new_value: u64,
        flags: u32,
    ) -> PostResult<Posted> {
        let wr = WorkRequest::compare_swap(local, remote_offset, expected, new_value, flags);
        self.post_one(conn, cor, wr)
    }

    fn post_one(&mut self, conn: ConnId, cor: CoroutineId, mut wr: WorkRequest) -> PostResult<Posted> {
        self.check_coroutine(cor);
        let layout = self.layout;
        let coalesce = self.config.coalesce_singles;
        let slot = self.slot_mut(conn);

        let forced = coalesce && !wr.is_signaled() && slot.conn.notification_required();
        if forced {
            wr.flags |= send_flags::SIGNALED;
        }
        let watermark = slot.conn.advance_watermark(1);
        wr.wr_id = layout.encode(cor, watermark);

        let res = match wr.opcode {
            Opcode::CompareSwap => slot.conn.post_cas(&wr),
            Opcode::Read | Opcode::Write => slot.conn.post_single(&wr),
        };
        if let Err(e) = res {
            slot.conn.rewind_watermark(1);
            self.counters.post_failures += 1;
            kdebug!("rsched: {} {} on {} refused: {}", cor, wr.opcode, conn, e);
            return Err(e);
        }

        let posted = Posted {
            wr_id: wr.wr_id,
            watermark,
            signaled: wr.is_signaled(),
            forced,
        };
        self.account(conn, cor, &posted, 1);
        Ok(posted)
    }

    /// Submit `chain[..=doorbell_index]` with one doorbell.
    ///
    /// Only the request at `doorbell_index` is stamped with the scheduler's
    /// identifier; the watermark advances by `1 + doorbell_index`, once per
    /// item. A `SIGNALED` flag on any submitted item moves to the doorbell
    /// request. The caller's chain is not modified.
    ///
    /// # Panics
    ///
    /// If `doorbell_index >= chain.len()`, `cor` is outside the pending
    /// table, or `conn` is not registered.
    pub fn post_batch(
        &mut self,
        conn: ConnId,
        cor: CoroutineId,
        chain: &[WorkRequest],
        doorbell_index: usize,
    ) -> PostResult<Posted> {
        self.post_chain(conn, cor, chain, doorbell_index, false)
    }

    /// `post_batch`, adding a notification to the doorbell request when the
    /// connection requires one.
    ///
    /// Returns whether the submission carries a notification, i.e. whether
    /// this connection now needs draining.
    ///
    /// # Panics
    ///
    /// As `post_batch`.
    pub fn post_batch_coalesced(
        &mut self,
        conn: ConnId,
        cor: CoroutineId,
        chain: &[WorkRequest],
        doorbell_index: usize,
    ) -> PostResult<bool> {
        self.post_chain(conn, cor, chain, doorbell_index, true)
            .map(|posted| posted.signaled)
    }

    fn post_chain(
        &mut self,
        conn: ConnId,
        cor: CoroutineId,
        chain: &[WorkRequest],
        doorbell_index: usize,
        coalesce: bool,
    ) -> PostResult<Posted> {
        assert!(
            doorbell_index < chain.len(),
            "doorbell index {} outside a {}-request chain",
            doorbell_index,
            chain.len()
        );
        self.check_coroutine(cor);
        let layout = self.layout;
        let span = doorbell_index as u64 + 1;

        let Self { conns, chain_buf, counters, .. } = &mut *self;
        let slot = conns
            .get_mut(conn.as_usize())
            .unwrap_or_else(|| panic!("{} is not registered with this scheduler", conn));

        chain_buf.clear();
        chain_buf.extend_from_slice(&chain[..=doorbell_index]);
        // Only the doorbell completion carries our identifier.
        let mut requested = false;
        for wr in chain_buf.iter_mut() {
            requested |= wr.is_signaled();
            wr.flags &= !send_flags::SIGNALED;
        }
        let forced = coalesce && !requested && slot.conn.notification_required();
        let watermark = slot.conn.advance_watermark(span);

        let doorbell = &mut chain_buf[doorbell_index];
        if requested || forced {
            doorbell.flags |= send_flags::SIGNALED;
        }
        doorbell.wr_id = layout.encode(cor, watermark);
        let posted = Posted {
            wr_id: doorbell.wr_id,
            watermark,
            signaled: doorbell.is_signaled(),
            forced,
        };

        if let Err(e) = slot.conn.post_chain(chain_buf) {
            slot.conn.rewind_watermark(span);
            counters.post_failures += 1;
            kdebug!("rsched: {} batch of {} on {} refused: {}", cor, span, conn, e);
            return Err(e);
        }

        self.account(conn, cor, &posted, span);
        Ok(posted)
    }

    fn account(&mut self, conn: ConnId, cor: CoroutineId, posted: &Posted, items: u64) {
        self.pending.record_pending(cor, conn, posted.watermark, posted.signaled);
        let c = &mut self.counters;
        c.posted += 1;
        c.posted_items += items;
        c.signaled += posted.signaled as u64;
        c.forced += posted.forced as u64;
        if self.config.debug_logging {
            kdebug!(
                "rsched: {} posted {} item(s) on {} wm={} signaled={} forced={}",
                cor,
                items,
                conn,
                posted.watermark,
                posted.signaled,
                posted.forced
            );
        }
    }

    // ── Completion drain ─────────────────────────────────────────────

    /// Drain completions from every connection that owes one.
    ///
    /// Each connection on the drain list is polled at most once per call,
    /// for at most as many completions as it owes. Every matched completion
    /// resolves the connection's issuances up to its watermark; coroutines
    /// left with nothing in flight are handed to `rt.resume`. A failed
    /// completion is reported through `rt.failed` before the wake-ups it
    /// causes. Completions that match no outstanding signal are logged and
    /// ignored.
    ///
    /// Never blocks. Returns the number of completions applied.
    pub fn poll_comps<R: CoroutineRuntime + ?Sized>(&mut self, rt: &mut R) -> usize {
        if self.pending.pending_connection_entries() == 0 {
            return 0;
        }
        self.pass += 1;

        let Self {
            conns,
            pending,
            counters,
            pass,
            comp_buf,
            visit,
            woken,
            layout,
            config,
            ..
        } = self;

        visit.clear();
        for conn in pending.pending_connections() {
            let slot = &mut conns[conn.as_usize()];
            if slot.pass != *pass {
                slot.pass = *pass;
                visit.push(conn);
            }
        }

        let mut applied = 0;
        for &conn in visit.iter() {
            let want = (pending.owed(conn) as usize).min(comp_buf.len());
            if want == 0 {
                continue;
            }
            let n = conns[conn.as_usize()].conn.poll_completions(&mut comp_buf[..want]);

            for wc in &comp_buf[..n] {
                let cor = layout.decode_coroutine(wc.wr_id);
                let watermark = layout.decode_watermark(wc.wr_id);
                if pending.signaled_at(conn, watermark).map(|op| op.cor) != Some(cor) {
                    counters.unknown += 1;
                    kwarn!(
                        "rsched: {}",
                        SchedError::UnknownCompletion { conn, wr_id: wc.wr_id }
                    );
                    continue;
                }

                pending.consume_signal(conn);
                woken.clear();
                let retired = pending.retire_through(conn, watermark, |c| woken.push(c));
                counters.completions += 1;
                counters.retired += retired as u64;
                applied += 1;

                if config.debug_logging {
                    kdebug!(
                        "rsched: {} completion wm={} for {} resolved {} op(s): {}",
                        conn,
                        watermark,
                        cor,
                        retired,
                        wc.status
                    );
                }
                if !wc.status.is_success() {
                    counters.failures += 1;
                    rt.failed(&OpFailure { cor, conn, watermark, status: wc.status });
                }
                for &c in woken.iter() {
                    rt.resume(c);
                }
            }
        }

        pending.compact_signals();
        applied
    }

    // ── Diagnostics ──────────────────────────────────────────────────

    pub fn stats(&self) -> SchedStats {
        SchedStats {
            connections: self.conns.len(),
            pending_ops: self.pending.total_pending(),
            pending_connection_entries: self.pending.pending_connection_entries(),
            busy_coroutines: self.pending.busy_coroutines().collect(),
            ..SchedStats::from_counters(&self.counters)
        }
    }

    /// Log a one-line summary at info level.
    pub fn report(&self) {
        kinfo!("rsched: {}", self.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{Delivery, LoopbackConfig, LoopbackQp};
    use rsched_core::entry::WcStatus;
    use rsched_core::error::PostError;

    /// Records wake-ups and failures in order.
    #[derive(Default)]
    struct Recorder {
        resumed: Vec<CoroutineId>,
        failed: Vec<OpFailure>,
    }

    impl CoroutineRuntime for Recorder {
        fn resume(&mut self, cor: CoroutineId) {
            self.resumed.push(cor);
        }

        fn failed(&mut self, failure: &OpFailure) {
            self.failed.push(*failure);
        }
    }

    fn cor(n: u32) -> CoroutineId {
        CoroutineId::new(n)
    }

    fn sched() -> RdmaScheduler<LoopbackQp> {
        RdmaScheduler::new(SchedConfig::new().max_coroutines(8)).unwrap()
    }

    fn loopback(threshold: u32) -> LoopbackQp {
        LoopbackQp::new(LoopbackConfig::default().unsignaled_threshold(threshold)).unwrap()
    }

    const BUF: LocalBuf = LocalBuf::new(0, 8);

    #[test]
    fn test_init_rejects_bad_config() {
        let err = RdmaScheduler::<LoopbackQp>::new(SchedConfig::new().max_coroutines(300));
        assert!(matches!(err, Err(SchedError::TooManyCoroutines { requested: 300, limit: 256 })));

        let ok = RdmaScheduler::<LoopbackQp>::new(
            SchedConfig::new().cor_id_bits(10).max_coroutines(300),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_thread_local_init_sizes_table() {
        let _env = crate::config::tests::env_lock();
        let s = RdmaScheduler::<LoopbackQp>::thread_local_init(16).unwrap();
        assert_eq!(s.pending_table().capacity(), 16);
        assert_eq!(s.config().poll_batch, crate::config::defaults::POLL_BATCH);
        assert_eq!(s.total_pending(), 0);
    }

    #[test]
    fn test_single_op_stamps_identifier() {
        let mut s = sched();
        let qp = s.register(loopback(32));

        let posted = s.one_write(qp, cor(3), BUF, 0).unwrap();
        assert_eq!(posted.watermark, Watermark(1));
        assert_eq!(posted.wr_id, WrId((1 << 8) | 3));
        assert!(posted.signaled && !posted.forced);
        assert_eq!(s.connection(qp).submitted()[0].wr_id, posted.wr_id);
        assert_eq!(s.pending(cor(3)), 1);
    }

    #[test]
    fn test_coalescing_scenario() {
        let mut s = sched();
        let x = s.register(loopback(5));

        for _ in 0..5 {
            let p = s.write(x, cor(3), BUF, 0, 0).unwrap();
            assert!(!p.signaled);
        }
        assert_eq!(s.pending(cor(3)), 5);
        assert_eq!(s.pending_table().pending_connection_entries(), 0);

        // X crossed its threshold: the sixth write is signaled for us.
        let p = s.write(x, cor(3), BUF, 0, 0).unwrap();
        assert!(p.signaled && p.forced);
        assert_eq!(p.watermark, Watermark(6));
        assert_eq!(s.pending(cor(3)), 6);
        assert_eq!(s.pending_table().pending_connections().collect::<Vec<_>>(), vec![x]);

        let mut rt = Recorder::default();
        assert_eq!(s.poll_comps(&mut rt), 1);
        assert_eq!(s.pending(cor(3)), 0);
        assert_eq!(rt.resumed, vec![cor(3)]);
        assert_eq!(s.connection(x).outstanding(), 0);

        let stats = s.stats();
        assert_eq!((stats.completions, stats.retired, stats.forced), (1, 6, 1));
    }

    #[test]
    fn test_coalesce_singles_disabled() {
        let mut s = RdmaScheduler::new(SchedConfig::new().max_coroutines(8).coalesce_singles(false))
            .unwrap();
        let x = s.register(loopback(2));
        for _ in 0..3 {
            assert!(!s.write(x, cor(0), BUF, 0, 0).unwrap().signaled);
        }
        assert!(s.connection(x).notification_required());
    }

    #[test]
    fn test_pending_conservation_across_coroutines() {
        let mut s = sched();
        let a = s.register(loopback(4));
        let b = s.register(loopback(4));

        for i in 0..20u32 {
            let conn = if i % 2 == 0 { a } else { b };
            s.read(conn, cor(i % 3), BUF, 64, 0).unwrap();
        }
        // Close every run with a signaled op.
        s.one_read(a, cor(5), BUF, 0).unwrap();
        s.one_read(b, cor(5), BUF, 0).unwrap();
        assert_eq!(s.total_pending(), 22);

        let mut rt = Recorder::default();
        while s.total_pending() > 0 {
            assert!(s.poll_comps(&mut rt) > 0);
        }
        for c in 0..8 {
            assert_eq!(s.pending(cor(c)), 0);
        }
        assert_eq!(s.pending_table().pending_connection_entries(), 0);
        rt.resumed.sort();
        rt.resumed.dedup();
        assert_eq!(rt.resumed, vec![cor(0), cor(1), cor(2), cor(5)]);
    }

    #[test]
    fn test_batch_watermark_and_stamp() {
        let mut s = sched();
        let qp = s.register(loopback(32));
        s.write(qp, cor(1), BUF, 0, 0).unwrap();

        let chain = [
            WorkRequest::write(BUF, 0, 0),
            WorkRequest::write(BUF, 8, 0),
            WorkRequest::read(BUF, 16, send_flags::SIGNALED),
            WorkRequest::write(BUF, 24, 0),
        ];
        let posted = s.post_batch(qp, cor(2), &chain, 2).unwrap();

        assert_eq!(posted.watermark, Watermark(4));
        assert_eq!(s.connection(qp).high_watermark(), Watermark(4));
        let submitted = &s.connection(qp).submitted()[1..];
        assert_eq!(submitted.len(), 3);
        assert_eq!(submitted[2].wr_id, s.layout().encode(cor(2), Watermark(4)));
        assert_eq!(submitted[0].wr_id, WrId(0));
        assert_eq!(s.pending(cor(2)), 1);
        assert_eq!(chain[2].wr_id, WrId(0));
    }

    #[test]
    fn test_coalesced_batch_forces_copy_only() {
        let mut s = sched();
        let qp = s.register(loopback(3));
        let chain = [WorkRequest::write(BUF, 0, 0), WorkRequest::write(BUF, 8, 0)];

        // Two unsignaled items, threshold 3: not required yet.
        assert!(!s.post_batch_coalesced(qp, cor(0), &chain, 1).unwrap());
        assert!(!s.post_batch_coalesced(qp, cor(0), &chain, 0).unwrap());
        assert!(s.connection(qp).notification_required());

        assert!(s.post_batch_coalesced(qp, cor(0), &chain, 1).unwrap());
        let last = *s.connection(qp).submitted().last().unwrap();
        assert!(last.is_signaled());
        assert_eq!(last.flags, send_flags::SIGNALED);
        assert!(chain.iter().all(|wr| !wr.is_signaled() && wr.wr_id == WrId(0)));

        let mut rt = Recorder::default();
        assert_eq!(s.poll_comps(&mut rt), 1);
        assert_eq!(s.pending(cor(0)), 0);
    }

    #[test]
    fn test_coalesced_batch_keeps_caller_signal() {
        let mut s = sched();
        let qp = s.register(loopback(32));
        let chain = [WorkRequest::read(BUF, 0, send_flags::SIGNALED | send_flags::FENCE)];
        assert!(s.post_batch_coalesced(qp, cor(1), &chain, 0).unwrap());
        assert_eq!(s.stats().forced, 0);
        assert_eq!(
            s.connection(qp).submitted()[0].flags,
            send_flags::SIGNALED | send_flags::FENCE
        );
    }

    #[test]
    fn test_signal_before_doorbell_moves_to_doorbell() {
        let mut s = sched();
        let qp = s.register(loopback(32));
        let chain = [
            WorkRequest::write(BUF, 0, send_flags::SIGNALED),
            WorkRequest::write(BUF, 8, 0),
        ];
        let posted = s.post_batch(qp, cor(1), &chain, 1).unwrap();
        assert!(posted.signaled);
        assert!(!posted.forced);
        assert!(s.post_batch_coalesced(qp, cor(2), &chain, 1).unwrap());
        assert_eq!(chain[0].flags, send_flags::SIGNALED);
        assert_eq!(chain[1].flags, 0);

        let submitted = s.connection(qp).submitted();
        assert_eq!(submitted.len(), 4);
        for pair in submitted.chunks(2) {
            assert!(!pair[0].is_signaled());
            assert!(pair[1].is_signaled());
        }
        assert_eq!(submitted[3].wr_id, s.layout().encode(cor(2), Watermark(4)));
        s.one_write(qp, cor(3), BUF, 0).unwrap();

        let mut rt = Recorder::default();
        assert_eq!(s.poll_comps(&mut rt), 3);
        assert_eq!(rt.resumed, vec![cor(1), cor(2), cor(3)]);
        assert_eq!(s.total_pending(), 0);
        let stats = s.stats();
        assert_eq!(stats.unknown, 0);
        assert_eq!(stats.forced, 0);
        assert_eq!(stats.signaled, 3);
    }

    #[test]
    fn test_idempotent_drain() {
        let mut s = sched();
        let qp = s.register(
            LoopbackQp::new(LoopbackConfig::default().delivery(Delivery::Deferred)).unwrap(),
        );
        let mut rt = Recorder::default();
        assert_eq!(s.poll_comps(&mut rt), 0);

        s.one_read(qp, cor(4), BUF, 0).unwrap();
        s.one_read(qp, cor(4), BUF, 0).unwrap();
        let before = s.stats();
        let list: Vec<_> = s.pending_table().pending_connections().collect();

        assert_eq!(s.poll_comps(&mut rt), 0);
        assert_eq!(s.stats(), before);
        assert_eq!(s.pending_table().pending_connections().collect::<Vec<_>>(), list);
        assert!(rt.resumed.is_empty());

        s.connection_mut(qp).deliver(1);
        assert_eq!(s.poll_comps(&mut rt), 1);
        assert_eq!(s.pending(cor(4)), 1);
        assert_eq!(s.pending_table().pending_connection_entries(), 1);

        s.connection_mut(qp).deliver_all();
        assert_eq!(s.poll_comps(&mut rt), 1);
        assert_eq!(rt.resumed, vec![cor(4)]);
    }

    #[test]
    fn test_failed_completion_still_resolves() {
        let mut s = sched();
        let qp = s.register(loopback(32));
        s.write(qp, cor(1), BUF, 0, 0).unwrap();
        s.connection_mut(qp).fail_next_completion(WcStatus::RemoteAccessError);
        let posted = s.one_write(qp, cor(2), BUF, 0).unwrap();

        let mut rt = Recorder::default();
        assert_eq!(s.poll_comps(&mut rt), 1);
        assert_eq!(s.total_pending(), 0);
        assert_eq!(
            rt.failed,
            vec![OpFailure {
                cor: cor(2),
                conn: qp,
                watermark: posted.watermark,
                status: WcStatus::RemoteAccessError,
            }]
        );
        assert_eq!(rt.resumed, vec![cor(1), cor(2)]);
        assert_eq!(s.stats().failures, 1);
    }

    #[test]
    fn test_post_failure_leaves_state() {
        let mut s = sched();
        let qp = s.register(loopback(32));
        s.one_read(qp, cor(0), BUF, 0).unwrap();

        s.connection_mut(qp).fail_next_post(PostError::Os(libc::ENETDOWN));
        let err = s.write(qp, cor(0), BUF, 0, send_flags::SIGNALED);
        assert_eq!(err, Err(PostError::Os(libc::ENETDOWN)));

        let bad_chain = [WorkRequest::write(BUF, 0, 0), WorkRequest::write(BUF, 1 << 30, 0)];
        assert!(matches!(
            s.post_batch(qp, cor(0), &bad_chain, 1),
            Err(PostError::Rejected { bad_index: 1, .. })
        ));

        assert_eq!(s.pending(cor(0)), 1);
        assert_eq!(s.connection(qp).high_watermark(), Watermark(1));
        assert_eq!(s.pending_table().pending_connection_entries(), 1);
        assert_eq!(s.stats().post_failures, 2);

        // The next accepted op continues the sequence.
        assert_eq!(s.one_read(qp, cor(0), BUF, 0).unwrap().watermark, Watermark(2));
    }

    #[test]
    fn test_connection_without_signals_is_not_polled() {
        let mut s = sched();
        let qp = s.register(loopback(32));
        s.write(qp, cor(1), BUF, 0, 0).unwrap();

        // A completion nobody on the scheduler asked for.
        let mut foreign = WorkRequest::read(BUF, 0, send_flags::SIGNALED);
        foreign.wr_id = s.layout().encode(cor(1), Watermark(99));
        s.connection_mut(qp).post_single(&foreign).unwrap();

        let mut rt = Recorder::default();
        assert_eq!(s.poll_comps(&mut rt), 0);
        assert_eq!(s.stats().unknown, 0);
        assert_eq!(s.connection(qp).ready(), 1);
        assert_eq!(s.pending(cor(1)), 1);
    }

    #[test]
    fn test_unknown_completion_on_owed_connection() {
        let mut s = sched();
        let qp = s.register(loopback(32));
        s.one_read(qp, cor(1), BUF, 0).unwrap();
        let mut foreign = WorkRequest::read(BUF, 0, send_flags::SIGNALED);
        foreign.wr_id = s.layout().encode(cor(6), Watermark(1));

        // Replace the genuine completion with one decoding to a different
        // coroutine at the same watermark.
        let mut buf = [WorkCompletion::EMPTY; 1];
        assert_eq!(s.connection_mut(qp).poll_completions(&mut buf), 1);
        s.connection_mut(qp).post_single(&foreign).unwrap();

        let mut rt = Recorder::default();
        assert_eq!(s.poll_comps(&mut rt), 0);
        assert_eq!(s.pending(cor(1)), 1);
        assert_eq!(s.pending(cor(6)), 0);
        assert_eq!(s.stats().unknown, 1);
        assert!(rt.resumed.is_empty());
    }

    #[test]
    fn test_poll_batch_caps_each_pass() {
        let mut s = RdmaScheduler::new(SchedConfig::new().max_coroutines(8).poll_batch(2)).unwrap();
        let qp = s.register(loopback(32));
        for c in 0..3 {
            s.one_write(qp, cor(c), BUF, 0).unwrap();
        }
        assert_eq!(s.pending_table().pending_connection_entries(), 3);

        let mut rt = Recorder::default();
        assert_eq!(s.poll_comps(&mut rt), 2);
        assert_eq!(s.pending_table().pending_connection_entries(), 1);
        assert_eq!(s.poll_comps(&mut rt), 1);
        assert_eq!(rt.resumed, vec![cor(0), cor(1), cor(2)]);
    }

    #[test]
    fn test_compare_and_swap_through_scheduler() {
        let mut s = sched();
        let qp = s.register(loopback(32));
        s.connection_mut(qp).remote_mut()[0..8].copy_from_slice(&10u64.to_le_bytes());

        s.compare_and_swap(qp, cor(2), BUF, 0, 10, 11, send_flags::SIGNALED).unwrap();
        assert_eq!(&s.connection(qp).remote()[0..8], &11u64.to_le_bytes());
        assert_eq!(s.poll_comps(&mut ()), 1);
        assert!(s.is_idle(cor(2)));
    }

    #[test]
    fn test_boxed_dyn_connections() {
        let mut s: RdmaScheduler<Box<dyn Connection>> =
            RdmaScheduler::new(SchedConfig::new().max_coroutines(4)).unwrap();
        let qp = s.register(Box::new(loopback(32)));
        s.one_read(qp, cor(3), BUF, 0).unwrap();
        assert_eq!(s.poll_comps(&mut ()), 1);
        assert!(s.is_idle(cor(3)));
    }

    #[test]
    #[should_panic(expected = "outside the 8-coroutine pending table")]
    fn test_coroutine_out_of_range_panics() {
        let mut s = sched();
        let qp = s.register(loopback(32));
        let _ = s.one_read(qp, cor(8), BUF, 0);
    }

    #[test]
    #[should_panic(expected = "doorbell index 2 outside a 2-request chain")]
    fn test_doorbell_out_of_range_panics() {
        let mut s = sched();
        let qp = s.register(loopback(32));
        let chain = [WorkRequest::write(BUF, 0, 0); 2];
        let _ = s.post_batch(qp, cor(0), &chain, 2);
    }

    #[test]
    #[should_panic(expected = "is not registered")]
    fn test_unregistered_connection_panics() {
        let mut s = sched();
        let _ = s.one_read(ConnId::new(5), cor(0), BUF, 0);
    }

    #[test]
    fn test_stats_snapshot() {
        let mut s = sched();
        let qp = s.register(loopback(32));
        s.write(qp, cor(7), BUF, 0, 0).unwrap();
        let stats = s.stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.pending_ops, 1);
        assert_eq!(stats.busy_coroutines, vec![(cor(7), 1)]);
        s.report();
    }
}
