//! rsched End-to-End Smoke Test
//!
//! Drives the scheduler the way a transaction worker does:
//!   Part A: Identifier codec (layouts, round trips)
//!   Part B: Single ops (write/read back, compare-and-swap)
//!   Part C: Signal coalescing (forced notifications, batch copies)
//!   Part D: Worker loop (coroutines racing CAS increments over QPs)
//!   Part E: Failures (refused posts, error completions)
//!
//! Run: ./target/release/rsched-smoke
//! Env: RSCHED_SMOKE_CPU (pin to CPU, default 0), RSCHED_SMOKE_COROUTINES,
//!      RSCHED_SMOKE_INCREMENTS, plus every RSCHED_* scheduler variable.

use rsched_core::entry::{send_flags, LocalBuf, WcStatus, WorkRequest};
use rsched_core::env::env_get;
use rsched_core::error::PostError;
use rsched_core::id::{ConnId, CoroutineId};
use rsched_core::kprint;
use rsched_core::runtime::{CoroutineRuntime, OpFailure};
use rsched_core::wrid::{Watermark, WrIdLayout};
use rsched_core::Connection;

use rsched::{Delivery, LoopbackConfig, LoopbackQp, RdmaScheduler, SchedConfig};

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use std::collections::VecDeque;
use std::time::Instant;

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

/// Run queue standing in for the coroutine runtime.
#[derive(Default)]
struct RunQueue {
    ready: VecDeque<CoroutineId>,
    failures: Vec<OpFailure>,
}

impl CoroutineRuntime for RunQueue {
    fn resume(&mut self, cor: CoroutineId) {
        self.ready.push_back(cor);
    }

    fn failed(&mut self, failure: &OpFailure) {
        self.failures.push(*failure);
    }
}

fn new_sched(coroutines: usize) -> Option<RdmaScheduler<LoopbackQp>> {
    match RdmaScheduler::thread_local_init(coroutines) {
        Ok(s) => Some(s),
        Err(e) => {
            println!("  scheduler init failed: {}", e);
            None
        }
    }
}

fn qp(threshold: u32) -> LoopbackQp {
    match LoopbackQp::new(LoopbackConfig::default().unsignaled_threshold(threshold)) {
        Ok(qp) => qp,
        Err(e) => {
            println!("\nFATAL: loopback config rejected: {}", e);
            std::process::exit(1);
        }
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(word)
}

// ════════════════════════════════════════════════════════════
// Part A: Identifier codec
// ════════════════════════════════════════════════════════════

fn test_codec(t: &mut TestRunner) {
    t.section("Part A: Identifier codec");

    let layout = WrIdLayout::default();
    let id = layout.encode(CoroutineId::new(7), Watermark(1000));
    t.check(
        "default layout packs (wm << 8) | cor",
        id.0 == (1000 << 8) | 7,
        &format!("{:?}", id),
    );

    let all = (0..layout.max_coroutines() as u32).all(|c| {
        let id = layout.encode(CoroutineId::new(c), Watermark(u32::MAX as u64 + c as u64));
        layout.decode_coroutine(id) == CoroutineId::new(c)
            && layout.decode_watermark(id) == Watermark(u32::MAX as u64 + c as u64)
    });
    t.check("round trip every coroutine id", all, "mismatch");

    match WrIdLayout::new(12) {
        Ok(wide) => {
            let id = wide.encode(CoroutineId::new(4000), wide.max_watermark());
            t.check(
                "12-bit layout at max watermark",
                wide.decode_coroutine(id) == CoroutineId::new(4000)
                    && wide.decode_watermark(id) == wide.max_watermark(),
                &format!("{:?}", id),
            );
        }
        Err(e) => t.fail("12-bit layout", &e.to_string()),
    }
    t.check("0-bit layout rejected", WrIdLayout::new(0).is_err(), "accepted");
}

// ════════════════════════════════════════════════════════════
// Part B: Single ops
// ════════════════════════════════════════════════════════════

fn test_single_ops(t: &mut TestRunner) {
    t.section("Part B: Single ops");
    let Some(mut s) = new_sched(8) else {
        t.fail("scheduler init", "see above");
        return;
    };
    let x = s.register(qp(32));
    let cor = CoroutineId::new(1);
    let mut rq = RunQueue::default();

    s.connection_mut(x).local_mut()[0..5].copy_from_slice(b"hello");
    let w = s.one_write(x, cor, LocalBuf::new(0, 5), 256);
    t.check("one_write accepted", w.is_ok(), &format!("{:?}", w));
    t.check("pending == 1 after write", s.pending(cor) == 1, &s.pending(cor).to_string());

    let n = s.poll_comps(&mut rq);
    t.check(
        "drain resumes the writer",
        n == 1 && rq.ready.pop_front() == Some(cor) && s.is_idle(cor),
        &format!("applied={}", n),
    );
    t.check("remote holds the bytes", &s.connection(x).remote()[256..261] == b"hello", "");

    let r = s.one_read(x, cor, LocalBuf::new(64, 5), 256);
    s.poll_comps(&mut rq);
    t.check(
        "one_read copies them back",
        r.is_ok() && &s.connection(x).local()[64..69] == b"hello",
        &format!("{:?}", r),
    );

    s.connection_mut(x).remote_mut()[512..520].copy_from_slice(&41u64.to_le_bytes());
    let cas = s.compare_and_swap(x, cor, LocalBuf::new(128, 8), 512, 41, 42, send_flags::SIGNALED);
    s.poll_comps(&mut rq);
    t.check(
        "compare_and_swap swaps and returns old",
        cas.is_ok()
            && read_u64(s.connection(x).remote(), 512) == 42
            && read_u64(s.connection(x).local(), 128) == 41,
        &format!("{:?}", cas),
    );
    t.check("no work left in flight", s.total_pending() == 0, &s.stats().to_string());
}

// ════════════════════════════════════════════════════════════
// Part C: Signal coalescing
// ════════════════════════════════════════════════════════════

fn test_coalescing(t: &mut TestRunner) {
    t.section("Part C: Signal coalescing");
    let Some(mut s) = new_sched(8) else {
        t.fail("scheduler init", "see above");
        return;
    };
    let x = s.register(qp(5));
    let cor = CoroutineId::new(3);
    let buf = LocalBuf::new(0, 8);

    let quiet = (0..5).all(|_| matches!(s.write(x, cor, buf, 0, 0), Ok(p) if !p.signaled));
    t.check("5 unsignaled writes stay unsignaled", quiet, "");
    t.check(
        "pending 5, drain list empty",
        s.pending(cor) == 5 && s.pending_table().pending_connection_entries() == 0,
        &s.stats().to_string(),
    );

    let sixth = s.write(x, cor, buf, 0, 0);
    t.check(
        "6th write is forced signaled",
        matches!(sixth, Ok(p) if p.signaled && p.forced),
        &format!("{:?}", sixth),
    );

    let mut rq = RunQueue::default();
    let n = s.poll_comps(&mut rq);
    t.check(
        "one completion retires all 6",
        n == 1 && s.pending(cor) == 0 && rq.ready == [cor],
        &s.stats().to_string(),
    );

    let chain = [
        WorkRequest::write(buf, 0, 0),
        WorkRequest::write(buf, 8, 0),
        WorkRequest::write(buf, 16, 0),
    ];
    let mut signaled = false;
    for _ in 0..3 {
        match s.post_batch_coalesced(x, cor, &chain, 2) {
            Ok(sig) => signaled |= sig,
            Err(e) => t.fail("post_batch_coalesced", &e.to_string()),
        }
    }
    t.check("coalesced batch eventually signaled", signaled, "");
    t.check(
        "caller chain left untouched",
        chain.iter().all(|wr| wr.flags == 0 && wr.wr_id.0 == 0),
        "",
    );
    while s.total_pending() > 0 && s.poll_comps(&mut rq) > 0 {}
    t.check("batches drained", s.total_pending() == 0, &s.stats().to_string());
}

// ════════════════════════════════════════════════════════════
// Part D: Worker loop
// ════════════════════════════════════════════════════════════

/// A coroutine incrementing a shared remote counter with CAS retries.
#[derive(Debug, Clone, Copy)]
struct Incrementer {
    conn: ConnId,
    /// Value we expect to find at the counter.
    guess: u64,
    done: u32,
    in_flight: bool,
}

const COUNTER: u64 = 0;

fn test_worker_loop(t: &mut TestRunner) {
    t.section("Part D: Worker loop");
    let coroutines: usize = env_get("RSCHED_SMOKE_COROUTINES", 64);
    let increments: u32 = env_get("RSCHED_SMOKE_INCREMENTS", 200);
    let Some(mut s) = new_sched(coroutines) else {
        t.fail("scheduler init", "see above");
        return;
    };
    let conns: Vec<ConnId> = (0..4).map(|_| s.register(qp(16))).collect();

    let mut cors: Vec<Incrementer> = (0..coroutines)
        .map(|i| Incrementer { conn: conns[i % conns.len()], guess: 0, done: 0, in_flight: false })
        .collect();
    let start = Instant::now();
    let (ticks, post_errors) = run_incrementers(&mut s, &mut cors, increments);
    let elapsed = start.elapsed();

    let total: u64 = conns.iter().map(|&c| read_u64(s.connection(c).remote(), 0)).sum();
    let expected = coroutines as u64 * increments as u64;
    t.check(
        "counters sum to coroutines x increments",
        total == expected,
        &format!("{} vs {}", total, expected),
    );
    t.check(
        "every coroutine finished",
        cors.iter().all(|c| c.done == increments && !c.in_flight),
        "",
    );
    let stats = s.stats();
    t.check(
        "accounting conserved",
        stats.pending_ops == 0 && stats.posted == stats.retired && stats.unknown == 0,
        &stats.to_string(),
    );
    t.check("no refused posts", post_errors == 0, &post_errors.to_string());
    println!(
        "       {} ticks, {} ops in {:?} ({:.0} ops/s, {:.1} ops/completion)",
        ticks,
        stats.posted,
        elapsed,
        stats.posted as f64 / elapsed.as_secs_f64().max(1e-9),
        stats.ops_per_completion()
    );
    s.report();
}

/// Run the incrementers until every one is finished or nothing can make
/// progress. Returns the drain ticks and the number of refused posts.
fn run_incrementers(
    s: &mut RdmaScheduler<LoopbackQp>,
    cors: &mut [Incrementer],
    increments: u32,
) -> (u64, u64) {
    let mut rq = RunQueue::default();
    rq.ready.extend((0..cors.len() as u32).map(CoroutineId::new));

    let mut ticks = 0u64;
    let mut post_errors = 0u64;
    loop {
        while let Some(cor) = rq.ready.pop_front() {
            let slot = cor.as_usize() * 8 + 8;
            let me = &mut cors[cor.as_usize()];
            if me.in_flight {
                me.in_flight = false;
                let old = read_u64(s.connection(me.conn).local(), slot);
                if old == me.guess {
                    me.done += 1;
                    me.guess = old + 1;
                } else {
                    me.guess = old;
                }
            }
            if me.done == increments {
                continue;
            }
            // Touch the record first; the CAS closes the coroutine's run.
            let conn = me.conn;
            let guess = me.guess;
            let local = LocalBuf::new(slot as u64, 8);
            let res = match s.read(conn, cor, local, 8, 0) {
                Ok(_) => s.compare_and_swap(
                    conn, cor, local, COUNTER, guess, guess + 1, send_flags::SIGNALED,
                ),
                Err(e) => Err(e),
            };
            // A refused coroutine is abandoned; the caller's checks report it.
            match res {
                Ok(_) => cors[cor.as_usize()].in_flight = true,
                Err(_) => post_errors += 1,
            }
        }
        if s.total_pending() == 0 {
            break;
        }
        s.poll_comps(&mut rq);
        ticks += 1;
        // Only unsignaled work left: nothing will ever complete it.
        if rq.ready.is_empty() && s.pending_table().pending_connection_entries() == 0 {
            break;
        }
    }
    (ticks, post_errors)
}

// ════════════════════════════════════════════════════════════
// Part E: Failures
// ════════════════════════════════════════════════════════════

fn test_failures(t: &mut TestRunner) {
    t.section("Part E: Failures");
    let Some(mut s) = new_sched(8) else {
        t.fail("scheduler init", "see above");
        return;
    };
    let x = s.register(qp(32));
    let cor = CoroutineId::new(2);
    let buf = LocalBuf::new(0, 8);

    s.connection_mut(x).fail_next_post(PostError::QueueFull);
    let refused = s.one_write(x, cor, buf, 0);
    t.check(
        "refused post surfaces the error",
        refused == Err(PostError::QueueFull),
        &format!("{:?}", refused),
    );
    t.check(
        "refused post leaves no trace",
        s.pending(cor) == 0 && s.connection(x).high_watermark() == Watermark::ZERO,
        &s.stats().to_string(),
    );

    let oob = s.one_read(x, cor, LocalBuf::new(0, 8), 1 << 40);
    t.check("out-of-bounds read refused", oob == Err(PostError::OutOfBounds), &format!("{:?}", oob));

    s.connection_mut(x).fail_next_completion(WcStatus::RemoteAccessError);
    let _ = s.write(x, CoroutineId::new(1), buf, 0, 0);
    let _ = s.one_write(x, cor, buf, 0);
    let mut rq = RunQueue::default();
    s.poll_comps(&mut rq);
    t.check(
        "error completion reported once",
        rq.failures.len() == 1 && rq.failures[0].status == WcStatus::RemoteAccessError,
        &format!("{:?}", rq.failures),
    );
    t.check(
        "error completion still resolves the run",
        s.total_pending() == 0 && rq.ready.len() == 2,
        &s.stats().to_string(),
    );

    let mut d = qp(32);
    d.set_delivery(Delivery::Deferred);
    let y = s.register(d);
    let _ = s.one_read(y, cor, buf, 0);
    let before = s.stats();
    s.poll_comps(&mut rq);
    t.check("drain with nothing ready changes nothing", s.stats() == before, "");
    s.connection_mut(y).deliver_all();
    s.poll_comps(&mut rq);
    t.check("late completion resumes", s.is_idle(cor), &s.stats().to_string());
}

fn pin_to_cpu(cpu: usize) {
    let mut set = CpuSet::new();
    let res = set.set(cpu).and_then(|_| sched_setaffinity(Pid::from_raw(0), &set));
    match res {
        Ok(()) => println!("    pinned to cpu {}", cpu),
        Err(e) => println!("    cpu pinning unavailable: {}", e),
    }
}

fn main() {
    kprint::init();
    println!("=== rsched End-to-End Smoke Test ===");
    pin_to_cpu(env_get("RSCHED_SMOKE_CPU", 0));
    SchedConfig::from_env().print();

    let mut t = TestRunner::new();

    test_codec(&mut t);
    test_single_ops(&mut t);
    test_coalescing(&mut t);
    test_worker_loop(&mut t);
    test_failures(&mut t);

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refused_cas_does_not_stall_worker_loop() {
        let mut s = RdmaScheduler::new(
            SchedConfig::new().max_coroutines(2).coalesce_singles(false),
        )
        .unwrap();
        let conn = s.register(
            LoopbackQp::new(
                LoopbackConfig::default().sq_depth(2).unsignaled_threshold(1).cq_depth(2),
            )
            .unwrap(),
        );
        // Leaves room for the incrementer's read but not its CAS.
        s.write(conn, CoroutineId::new(1), LocalBuf::new(0, 8), 64, 0).unwrap();

        let mut cors = [Incrementer { conn, guess: 0, done: 0, in_flight: false }];
        let (_, post_errors) = run_incrementers(&mut s, &mut cors, 1);

        assert_eq!(post_errors, 1);
        assert_eq!(cors[0].done, 0);
        assert!(!cors[0].in_flight);
        assert_eq!(s.total_pending(), 2);
        assert_eq!(s.pending_table().pending_connection_entries(), 0);
    }

    #[test]
    fn test_incrementers_finish() {
        let mut s = RdmaScheduler::new(SchedConfig::new().max_coroutines(4)).unwrap();
        let conns = [s.register(qp(16)), s.register(qp(16))];
        let mut cors: Vec<Incrementer> = (0..4)
            .map(|i| Incrementer { conn: conns[i % 2], guess: 0, done: 0, in_flight: false })
            .collect();

        let (_, post_errors) = run_incrementers(&mut s, &mut cors, 10);

        assert_eq!(post_errors, 0);
        assert!(cors.iter().all(|c| c.done == 10 && !c.in_flight));
        let total: u64 = conns.iter().map(|&c| read_u64(s.connection(c).remote(), 0)).sum();
        assert_eq!(total, 40);
        assert_eq!(s.total_pending(), 0);
    }
}
