//! Diagnostic counters.

use rsched_core::id::CoroutineId;

use std::fmt;

/// Running totals kept by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    pub posted: u64,
    pub posted_items: u64,
    pub signaled: u64,
    pub forced: u64,
    pub post_failures: u64,
    pub completions: u64,
    pub retired: u64,
    pub failures: u64,
    pub unknown: u64,
}

/// Snapshot returned by `RdmaScheduler::stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Registered connections
    pub connections: usize,
    /// Issuance calls accepted by a connection
    pub posted: u64,
    /// Work items in those calls (chains count every item)
    pub posted_items: u64,
    /// Issuances whose doorbell item carried a notification
    pub signaled: u64,
    /// Notifications added because the connection required one
    pub forced: u64,
    /// Issuance calls refused by a connection
    pub post_failures: u64,
    /// Completions consumed by the drain loop
    pub completions: u64,
    /// Issuances resolved by those completions
    pub retired: u64,
    /// Completions with a non-success status
    pub failures: u64,
    /// Completions that matched no outstanding signal
    pub unknown: u64,
    /// Issuances not yet resolved
    pub pending_ops: u64,
    /// Entries on the drain work list
    pub pending_connection_entries: usize,
    /// Coroutines with work in flight and their counts
    pub busy_coroutines: Vec<(CoroutineId, u32)>,
}

impl SchedStats {
    pub(crate) fn from_counters(c: &Counters) -> Self {
        Self {
            posted: c.posted,
            posted_items: c.posted_items,
            signaled: c.signaled,
            forced: c.forced,
            post_failures: c.post_failures,
            completions: c.completions,
            retired: c.retired,
            failures: c.failures,
            unknown: c.unknown,
            ..Self::default()
        }
    }

    /// Issuances per consumed completion; the coalescing ratio.
    pub fn ops_per_completion(&self) -> f64 {
        if self.completions == 0 {
            return 0.0;
        }
        self.retired as f64 / self.completions as f64
    }
}

impl fmt::Display for SchedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conns={} posted={} items={} signaled={} forced={} post_err={} | \
             comps={} retired={} ({:.1}/comp) failed={} unknown={} | \
             pending={} drain_list={}",
            self.connections,
            self.posted,
            self.posted_items,
            self.signaled,
            self.forced,
            self.post_failures,
            self.completions,
            self.retired,
            self.ops_per_completion(),
            self.failures,
            self.unknown,
            self.pending_ops,
            self.pending_connection_entries,
        )?;
        if !self.busy_coroutines.is_empty() {
            write!(f, " | busy:")?;
            for (cor, n) in &self.busy_coroutines {
                write!(f, " {}={}", cor, n)?;
            }
        }
        Ok(())
    }
}
