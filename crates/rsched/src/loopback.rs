//! `LoopbackQp`: in-memory `Connection`.
//!
//! Executes one-sided operations immediately against two byte regions it
//! owns (a local buffer and the "remote" peer memory) and reproduces the
//! parts of a reliable-connected queue pair the scheduler depends on:
//!
//! - a send queue of `sq_depth` slots; a slot is reclaimed only when a
//!   signaled completion covering it is polled, so unsignaled posts
//!   eventually fail with `QueueFull`
//! - `notification_required()` once `unsignaled_threshold` unsignaled
//!   items are queued back to back
//! - a bounded completion queue (`crossbeam_queue::ArrayQueue`) that only
//!   signaled items write to
//! - deferred delivery, to hold completions back until the test releases
//!   them
//! - one-shot fault injection for posts and completion statuses

use rsched_core::connection::Connection;
use rsched_core::entry::{Opcode, WcStatus, WorkCompletion, WorkRequest};
use rsched_core::error::{PostError, PostResult, SchedError, SchedResult};
use rsched_core::wrid::Watermark;
use rsched_core::ktrace;

use crossbeam_queue::ArrayQueue;

use std::collections::VecDeque;

/// When completions become visible to `poll_completions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// At post time.
    Immediate,
    /// After `deliver` / `deliver_all`.
    Deferred,
}

/// Loopback connection parameters.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub sq_depth: u32,
    pub unsignaled_threshold: u32,
    pub cq_depth: usize,
    pub local_len: usize,
    pub remote_len: usize,
    pub delivery: Delivery,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            sq_depth: 128,
            unsignaled_threshold: 32,
            cq_depth: 128,
            local_len: 4096,
            remote_len: 4096,
            delivery: Delivery::Immediate,
        }
    }
}

impl LoopbackConfig {
    pub fn sq_depth(mut self, n: u32) -> Self {
        self.sq_depth = n;
        self
    }

    pub fn unsignaled_threshold(mut self, n: u32) -> Self {
        self.unsignaled_threshold = n;
        self
    }

    pub fn cq_depth(mut self, n: usize) -> Self {
        self.cq_depth = n;
        self
    }

    pub fn local_len(mut self, n: usize) -> Self {
        self.local_len = n;
        self
    }

    pub fn remote_len(mut self, n: usize) -> Self {
        self.remote_len = n;
        self
    }

    pub fn delivery(mut self, d: Delivery) -> Self {
        self.delivery = d;
        self
    }

    pub fn validate(&self) -> SchedResult<()> {
        if self.sq_depth == 0 {
            return Err(SchedError::InvalidConfig("sq_depth must be > 0"));
        }
        if self.unsignaled_threshold == 0 || self.unsignaled_threshold >= self.sq_depth {
            return Err(SchedError::InvalidConfig(
                "unsignaled_threshold must be in 1..sq_depth",
            ));
        }
        if self.cq_depth < self.sq_depth as usize {
            return Err(SchedError::InvalidConfig("cq_depth must be >= sq_depth"));
        }
        Ok(())
    }
}

/// A signaled completion and the send-queue slots it frees.
#[derive(Debug, Clone, Copy)]
struct Signal {
    wc: WorkCompletion,
    covers: u32,
}

pub struct LoopbackQp {
    config: LoopbackConfig,
    local: Vec<u8>,
    remote: Vec<u8>,
    watermark: Watermark,
    /// Posted items whose slots are not reclaimed yet.
    outstanding: u32,
    /// Unsignaled items since the last signaled one.
    unsignaled_run: u32,
    cq: ArrayQueue<Signal>,
    staged: VecDeque<Signal>,
    post_fault: Option<PostError>,
    status_faults: VecDeque<WcStatus>,
    submitted: Vec<WorkRequest>,
}

impl LoopbackQp {
    pub fn new(config: LoopbackConfig) -> SchedResult<Self> {
        config.validate()?;
        Ok(Self {
            local: vec![0; config.local_len],
            remote: vec![0; config.remote_len],
            watermark: Watermark::ZERO,
            outstanding: 0,
            unsignaled_run: 0,
            cq: ArrayQueue::new(config.cq_depth),
            staged: VecDeque::new(),
            post_fault: None,
            status_faults: VecDeque::new(),
            submitted: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    pub fn local(&self) -> &[u8] {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut [u8] {
        &mut self.local
    }

    pub fn remote(&self) -> &[u8] {
        &self.remote
    }

    pub fn remote_mut(&mut self) -> &mut [u8] {
        &mut self.remote
    }

    /// Send-queue slots in use.
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn unsignaled_run(&self) -> u32 {
        self.unsignaled_run
    }

    /// Every request accepted so far, as submitted.
    pub fn submitted(&self) -> &[WorkRequest] {
        &self.submitted
    }

    pub fn clear_submitted(&mut self) {
        self.submitted.clear();
    }

    /// Completions waiting for `deliver`.
    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    /// Completions ready to poll.
    pub fn ready(&self) -> usize {
        self.cq.len()
    }

    pub fn set_delivery(&mut self, delivery: Delivery) {
        self.config.delivery = delivery;
    }

    /// Make the next post fail with `err`, leaving the queue untouched.
    pub fn fail_next_post(&mut self, err: PostError) {
        self.post_fault = Some(err);
    }

    /// Report `status` on the next signaled completion generated.
    pub fn fail_next_completion(&mut self, status: WcStatus) {
        self.status_faults.push_back(status);
    }

    /// Release up to `max` deferred completions. Returns how many moved.
    pub fn deliver(&mut self, max: usize) -> usize {
        let mut moved = 0;
        while moved < max {
            let Some(sig) = self.staged.pop_front() else { break };
            if let Err(sig) = self.cq.push(sig) {
                self.staged.push_front(sig);
                break;
            }
            moved += 1;
        }
        moved
    }

    pub fn deliver_all(&mut self) -> usize {
        self.deliver(usize::MAX)
    }

    fn check(&self, wr: &WorkRequest) -> PostResult<()> {
        let len = wr.local.len as u64;
        let local_end = wr.local.addr.checked_add(len);
        let remote_end = wr.remote_offset.checked_add(len);
        if local_end.map_or(true, |end| end > self.local.len() as u64)
            || remote_end.map_or(true, |end| end > self.remote.len() as u64)
        {
            return Err(PostError::OutOfBounds);
        }
        if wr.opcode == Opcode::CompareSwap && (wr.local.len != 8 || wr.remote_offset % 8 != 0) {
            return Err(PostError::Os(libc::EINVAL));
        }
        Ok(())
    }

    fn execute(&mut self, wr: &WorkRequest) -> u32 {
        let l = wr.local.addr as usize;
        let r = wr.remote_offset as usize;
        let len = wr.local.len as usize;
        match wr.opcode {
            Opcode::Read => self.local[l..l + len].copy_from_slice(&self.remote[r..r + len]),
            Opcode::Write => self.remote[r..r + len].copy_from_slice(&self.local[l..l + len]),
            Opcode::CompareSwap => {
                let mut word = [0u8; 8];
                word.copy_from_slice(&self.remote[r..r + 8]);
                let old = u64::from_le_bytes(word);
                if old == wr.compare {
                    self.remote[r..r + 8].copy_from_slice(&wr.swap.to_le_bytes());
                }
                self.local[l..l + 8].copy_from_slice(&word);
            }
        }
        wr.local.len
    }

    fn emit(&mut self, sig: Signal) {
        match self.config.delivery {
            Delivery::Deferred => self.staged.push_back(sig),
            Delivery::Immediate => {
                // Cannot overflow while cq_depth >= sq_depth; park it anyway.
                if let Err(sig) = self.cq.push(sig) {
                    self.staged.push_back(sig);
                }
            }
        }
    }

    /// Validate, reserve and execute `items` as one submission.
    fn submit(&mut self, items: &[WorkRequest], chained: bool) -> PostResult<()> {
        if let Some(err) = self.post_fault.take() {
            return Err(err);
        }
        if items.is_empty() {
            return Err(PostError::Os(libc::EINVAL));
        }
        for (i, wr) in items.iter().enumerate() {
            if let Err(e) = self.check(wr) {
                return Err(if chained {
                    PostError::Rejected { bad_index: i, errno: e.errno() }
                } else {
                    e
                });
            }
        }
        let n = items.len() as u32;
        if self.outstanding + n > self.config.sq_depth {
            return Err(PostError::QueueFull);
        }

        for wr in items {
            let byte_len = self.execute(wr);
            if wr.is_signaled() {
                let status = self.status_faults.pop_front().unwrap_or(WcStatus::Success);
                let sig = Signal {
                    wc: WorkCompletion { wr_id: wr.wr_id, status, opcode: wr.opcode, byte_len },
                    covers: self.unsignaled_run + 1,
                };
                self.unsignaled_run = 0;
                self.emit(sig);
            } else {
                self.unsignaled_run += 1;
            }
        }
        self.outstanding += n;
        self.submitted.extend_from_slice(items);
        ktrace!("loopback: posted {} item(s), {} outstanding", n, self.outstanding);
        Ok(())
    }
}

impl Connection for LoopbackQp {
    fn post_single(&mut self, wr: &WorkRequest) -> PostResult<()> {
        if wr.opcode == Opcode::CompareSwap {
            return Err(PostError::Os(libc::EINVAL));
        }
        self.submit(std::slice::from_ref(wr), false)
    }

    fn post_cas(&mut self, wr: &WorkRequest) -> PostResult<()> {
        if wr.opcode != Opcode::CompareSwap {
            return Err(PostError::Os(libc::EINVAL));
        }
        self.submit(std::slice::from_ref(wr), false)
    }

    fn post_chain(&mut self, chain: &[WorkRequest]) -> PostResult<()> {
        self.submit(chain, true)
    }

    fn notification_required(&self) -> bool {
        self.unsignaled_run >= self.config.unsignaled_threshold
    }

    fn high_watermark(&self) -> Watermark {
        self.watermark
    }

    fn advance_watermark(&mut self, span: u64) -> Watermark {
        self.watermark = self.watermark.advanced(span);
        self.watermark
    }

    fn rewind_watermark(&mut self, span: u64) {
        self.watermark = Watermark(self.watermark.get() - span);
    }

    fn poll_completions(&mut self, buf: &mut [WorkCompletion]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            let Some(sig) = self.cq.pop() else { break };
            self.outstanding -= sig.covers;
            buf[n] = sig.wc;
            n += 1;
        }
        n
    }
}
