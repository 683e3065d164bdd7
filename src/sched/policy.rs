// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The three scheduling policies (§4.F): classic, choreography, capacity-aware.
//!
//! Grounded in the teacher's `transport::lowbw::scheduler::Scheduler`
//! priority-queue texture (fixed tiers, explicit stats, VecDeque-backed
//! queues), generalized from three fixed priority tiers to a pluggable
//! `Policy` trait so the scheduler core stays policy-agnostic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::coroutine::{Coroutine, Shared};

/// A worker's current queue depth, as seen by a policy making a placement
/// or steal decision.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerLoad {
    pub queue_len: usize,
}

/// Picks homes for new coroutines, decides whether an idle worker may
/// steal, and orders each worker's local queue.
pub trait Policy: Send + Sync {
    /// Choose which worker a freshly spawned coroutine is assigned to.
    fn home_worker(&self, coro: &Shared, loads: &[WorkerLoad]) -> usize;

    /// Whether a worker observing `idle` load may steal from a peer
    /// observing `candidate` load.
    fn may_steal(&self, idle: WorkerLoad, candidate: WorkerLoad) -> bool;

    /// Record how long a coroutine ran for on `worker`, for policies that
    /// track service-time history (capacity-aware). No-op by default.
    fn record_service(&self, _worker: usize, _elapsed: Duration) {}

    /// Pop the next coroutine to run from a worker's local queue. Default
    /// is FIFO with aging: a coroutine waiting longer than `starvation_ns`
    /// is bumped to the front (§4.F Classic policy).
    fn select_from_local(&self, local: &mut VecDeque<Coroutine>, starvation_ns: u64) -> Option<Coroutine> {
        if starvation_ns > 0 {
            if let Some(pos) = local
                .iter()
                .position(|c| c.shared().waiting_since().elapsed().as_nanos() as u64 > starvation_ns)
            {
                return local.remove(pos);
            }
        }
        local.pop_front()
    }
}

/// Fixed worker affinity assigned round-robin at creation; FIFO with
/// aging within a worker; never steals from peers (only drains the
/// global queue when idle).
pub struct ClassicPolicy {
    next: AtomicUsize,
}

impl ClassicPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self { next: AtomicUsize::new(0) }
    }
}

impl Default for ClassicPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy for ClassicPolicy {
    fn home_worker(&self, _coro: &Shared, loads: &[WorkerLoad]) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % loads.len().max(1)
    }

    fn may_steal(&self, _idle: WorkerLoad, _candidate: WorkerLoad) -> bool {
        false
    }
}

/// Coroutines sharing a `group_id` are pinned to the same worker; strict
/// FIFO within a worker to preserve intra-group ordering; may only steal
/// from a worker that has more than one READY coroutine, and only when
/// the stealing worker is otherwise empty.
pub struct ChoreographyPolicy;

impl Policy for ChoreographyPolicy {
    fn home_worker(&self, coro: &Shared, loads: &[WorkerLoad]) -> usize {
        (coro.group_id() as usize) % loads.len().max(1)
    }

    fn may_steal(&self, idle: WorkerLoad, candidate: WorkerLoad) -> bool {
        idle.queue_len == 0 && candidate.queue_len > 1
    }

    fn select_from_local(&self, local: &mut VecDeque<Coroutine>, _starvation_ns: u64) -> Option<Coroutine> {
        // Strict FIFO: no aging bump, so intra-group observational order
        // is never disturbed.
        local.pop_front()
    }
}

/// Each worker tracks an EWMA of recent service times; placement goes to
/// the worker with the lowest projected load (`weight + ewma * queue_len`);
/// local ordering is priority-major, FIFO-minor; stealing is always
/// allowed from a more loaded peer.
pub struct CapacityPolicy {
    ewma_ns_bits: Vec<AtomicU64>,
}

impl CapacityPolicy {
    #[must_use]
    pub fn new(num_workers: usize) -> Self {
        Self {
            ewma_ns_bits: (0..num_workers.max(1)).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn ewma_ns(&self, worker: usize) -> f64 {
        f64::from_bits(self.ewma_ns_bits[worker].load(Ordering::Relaxed))
    }
}

impl Policy for CapacityPolicy {
    fn home_worker(&self, coro: &Shared, loads: &[WorkerLoad]) -> usize {
        let weight = f64::from(coro.weight());
        loads
            .iter()
            .enumerate()
            .map(|(i, load)| (i, weight + self.ewma_ns(i) * load.queue_len as f64))
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    fn may_steal(&self, idle: WorkerLoad, candidate: WorkerLoad) -> bool {
        candidate.queue_len > idle.queue_len
    }

    fn record_service(&self, worker: usize, elapsed: Duration) {
        const ALPHA: f64 = 0.2;
        let sample = elapsed.as_nanos() as f64;
        let prev = self.ewma_ns(worker);
        let next = if prev == 0.0 { sample } else { ALPHA * sample + (1.0 - ALPHA) * prev };
        self.ewma_ns_bits[worker].store(next.to_bits(), Ordering::Relaxed);
    }

    fn select_from_local(&self, local: &mut VecDeque<Coroutine>, _starvation_ns: u64) -> Option<Coroutine> {
        if local.is_empty() {
            return None;
        }
        let mut best_idx = 0;
        let mut best_priority = local[0].shared().priority();
        for (i, c) in local.iter().enumerate().skip(1) {
            let p = c.shared().priority();
            if p > best_priority {
                best_priority = p;
                best_idx = i;
            }
        }
        local.remove(best_idx)
    }
}

/// Build the policy named by [`crate::config::SchedPolicy`].
#[must_use]
pub fn from_config(kind: crate::config::SchedPolicy, num_workers: usize) -> Box<dyn Policy> {
    match kind {
        crate::config::SchedPolicy::Classic => Box::new(ClassicPolicy::new()),
        crate::config::SchedPolicy::Choreography => Box::new(ChoreographyPolicy),
        crate::config::SchedPolicy::Capacity => Box::new(CapacityPolicy::new(num_workers)),
    }
}
