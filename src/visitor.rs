// SPDX-License-Identifier: Apache-2.0 OR MIT

//! N-way data visitor fan-in (§4.D): bounded per-channel queues plus a
//! "became complete" notify, feeding a coroutine's `try_fetch`.
//!
//! Grounded in the teacher's history-depth queue handling in
//! `core::writer::history` (drop-oldest-on-overflow over a `VecDeque`)
//! generalized here from one queue to `N` independent input lanes.

use std::collections::VecDeque;

use crate::shm::MessageRef;
use crate::signal::{Connection, Signal};

/// A single message slot as buffered by the visitor: the sequence id (for
/// ordering/skew checks) and the timestamp recorded at publish time.
#[derive(Clone, Copy, Debug)]
pub struct QueuedRef {
    pub sequence_id: u64,
    pub timestamp_ns: u64,
}

/// How `try_fetch` treats timestamp skew across lanes (§4.D "Fan-in ordering").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignByTimestamp {
    #[default]
    Off,
    DropStale,
    Wait,
}

struct Lane {
    queue: VecDeque<QueuedRef>,
    depth: usize,
    dropped: u64,
}

impl Lane {
    fn new(depth: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(depth),
            depth,
            dropped: 0,
        }
    }

    /// Push with drop-oldest on overflow; returns true if an item was
    /// dropped to make room.
    fn offer(&mut self, item: QueuedRef) -> bool {
        let dropped = if self.queue.len() >= self.depth {
            self.queue.pop_front();
            self.dropped += 1;
            true
        } else {
            false
        };
        self.queue.push_back(item);
        dropped
    }
}

/// Joins `N` input channels (`N` in 1..=4) for one reader coroutine (§4.D).
///
/// `offer` is called once per channel index as messages arrive; `try_fetch`
/// pops the oldest queued reference from every lane atomically (all-or-
/// nothing) once every lane is non-empty.
pub struct DataVisitor {
    lanes: Vec<Lane>,
    align: AlignByTimestamp,
    max_skew_ns: u64,
    closed: bool,
    /// Notify signal emitted exactly once per "became complete"
    /// transition (§4.D), i.e. the edge where the last-empty lane fills.
    /// A [`Signal`] rather than a single boxed closure so the fan-in layer
    /// wakes its waiter the same way the channel registry does (§4.G
    /// "Used by ... D ... to wake waiters").
    on_complete: Signal<()>,
}

impl DataVisitor {
    /// Build a visitor over `n` lanes (1..=4), each bounded to `depth`.
    ///
    /// # Panics
    /// Panics if `n` is 0 or greater than 4 — this is a programming error
    /// at node-construction time, not a runtime condition (§3 "N∈{1,2,3,4}").
    #[must_use]
    pub fn new(n: usize, depth: usize) -> Self {
        assert!((1..=4).contains(&n), "DataVisitor supports 1..=4 input lanes, got {n}");
        Self {
            lanes: (0..n).map(|_| Lane::new(depth.max(1))).collect(),
            align: AlignByTimestamp::default(),
            max_skew_ns: 0,
            closed: false,
            on_complete: Signal::new(),
        }
    }

    #[must_use]
    pub fn with_alignment(mut self, align: AlignByTimestamp, max_skew_ns: u64) -> Self {
        self.align = align;
        self.max_skew_ns = max_skew_ns;
        self
    }

    /// Connect a callback to the "became complete" signal, returning a
    /// handle that could later disconnect it via [`Signal::disconnect`].
    pub fn set_on_complete<F>(&mut self, callback: F) -> Connection
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_complete.connect(move |()| callback())
    }

    #[must_use]
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    fn all_non_empty(&self) -> bool {
        self.lanes.iter().all(|l| !l.queue.is_empty())
    }

    /// Enqueue a reference for `channel_index`. Returns `true` if this
    /// offer was dropped (caller bumps its own loss counter via
    /// [`Lane::dropped`] through [`DataVisitor::dropped_count`]).
    ///
    /// # Panics
    /// Panics if `channel_index >= lane_count()`.
    pub fn offer(&mut self, channel_index: usize, item: QueuedRef) -> bool {
        if self.closed {
            return true;
        }
        let was_complete = self.all_non_empty();
        let dropped = self.lanes[channel_index].offer(item);

        if !was_complete && self.all_non_empty() {
            self.on_complete.emit(());
        }
        dropped
    }

    /// Pop the oldest reference from every lane iff all lanes are
    /// non-empty (and, under `align_by_timestamp`, within skew).
    /// Returns `None` (leaving all lanes unchanged) otherwise.
    pub fn try_fetch(&mut self) -> Option<Vec<QueuedRef>> {
        if !self.all_non_empty() {
            return None;
        }

        match self.align {
            AlignByTimestamp::Off => {}
            AlignByTimestamp::DropStale => self.drop_stale_heads(),
            AlignByTimestamp::Wait => {
                if !self.heads_within_skew() {
                    return None;
                }
            }
        }

        if !self.all_non_empty() {
            return None;
        }

        Some(self.lanes.iter_mut().map(|lane| lane.queue.pop_front().unwrap()).collect())
    }

    fn newest_head_timestamp(&self) -> Option<u64> {
        self.lanes.iter().filter_map(|l| l.queue.front().map(|r| r.timestamp_ns)).max()
    }

    fn heads_within_skew(&self) -> bool {
        let Some(newest) = self.newest_head_timestamp() else {
            return false;
        };
        self.lanes.iter().all(|l| {
            l.queue
                .front()
                .is_some_and(|r| newest.saturating_sub(r.timestamp_ns) <= self.max_skew_ns)
        })
    }

    /// Drop heads older than `newest - max_skew_ns` until all remaining
    /// heads are within skew or a lane empties.
    fn drop_stale_heads(&mut self) {
        loop {
            let Some(newest) = self.newest_head_timestamp() else {
                return;
            };
            let mut dropped_any = false;
            for lane in &mut self.lanes {
                while let Some(front) = lane.queue.front() {
                    if newest.saturating_sub(front.timestamp_ns) > self.max_skew_ns {
                        lane.queue.pop_front();
                        lane.dropped += 1;
                        dropped_any = true;
                    } else {
                        break;
                    }
                }
            }
            if !dropped_any || !self.all_non_empty() {
                return;
            }
        }
    }

    #[must_use]
    pub fn dropped_count(&self, channel_index: usize) -> u64 {
        self.lanes[channel_index].dropped
    }

    /// Drain all lanes and reject further offers (§4.D `close`).
    pub fn close(&mut self) {
        self.closed = true;
        for lane in &mut self.lanes {
            lane.queue.clear();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Build a [`QueuedRef`] from a pinned [`MessageRef`], the shape the
/// transport layer pushes into a visitor lane.
#[must_use]
pub fn queued_ref_from(msg: &MessageRef<'_>, timestamp_ns: u64) -> QueuedRef {
    QueuedRef {
        sequence_id: msg.sequence_id(),
        timestamp_ns,
    }
}
