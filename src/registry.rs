// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Channel registry (§4.C): process-wide `channel_id -> {writers, receivers}`.
//!
//! Grounded on the teacher's `core::writer::matched_readers::MatchedReadersRegistry`:
//! a `DashMap` keyed by identity, entries looked up and updated without a
//! single coarse lock, fan-out iterating the map and invoking callbacks
//! without holding any entry's internal shard lock across user code — which
//! is exactly what [`crate::signal::Signal::emit`] already does, so a
//! channel's receiver-notify list is one (§4.G "Used by B ... to wake
//! waiters").

use dashmap::DashMap;

use crate::signal::{Connection, Signal};

/// One registered writer's bookkeeping handle (opaque to callers beyond
/// `unregister`).
#[derive(Clone)]
pub struct WriterHandle {
    id: u64,
}

#[derive(Default)]
struct ChannelEntry {
    writers: Vec<WriterHandle>,
    receivers: Signal<u64>,
    /// Per-channel count of messages never delivered to some receiver —
    /// visitor-overflow drops and reliability give-ups alike (§7
    /// "Loss is always accounted in a per-channel `ChannelMetrics` counter").
    dropped: std::sync::atomic::AtomicU64,
}

/// Thread-safe `channel_id -> {writers[], receivers[]}` table (§4.C).
///
/// Lookup and mutation are O(1) amortized via `DashMap`'s sharded locking;
/// `fanout` only holds a shard's read guard long enough to clone the
/// notify callbacks, then invokes them unlocked.
pub struct Registry {
    channels: DashMap<u64, ChannelEntry>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Register a writer for `channel_id`, returning a handle usable with
    /// [`Registry::unregister_writer`].
    pub fn register_writer(&self, channel_id: u64) -> WriterHandle {
        let id = self.fresh_id();
        self.channels
            .entry(channel_id)
            .or_default()
            .writers
            .push(WriterHandle { id });
        WriterHandle { id }
    }

    pub fn unregister_writer(&self, channel_id: u64, handle: &WriterHandle) {
        if let Some(mut entry) = self.channels.get_mut(&channel_id) {
            entry.writers.retain(|w| w.id != handle.id);
        }
    }

    /// Register a receiver's notify callback for `channel_id` by
    /// connecting it to that channel's [`Signal`]. The returned
    /// [`Connection`] is used to unregister later.
    pub fn register_receiver<F>(&self, channel_id: u64, notify: F) -> Connection
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.channels.entry(channel_id).or_default().receivers.connect(notify)
    }

    pub fn unregister_receiver(&self, channel_id: u64, connection: &Connection) {
        if let Some(entry) = self.channels.get(&channel_id) {
            entry.receivers.disconnect(connection);
        }
    }

    /// Drop a channel's entry entirely once it has no writers or receivers.
    pub fn prune_if_empty(&self, channel_id: u64) {
        if let Some(entry) = self.channels.get(&channel_id) {
            if entry.writers.is_empty() && entry.receivers.slot_count() == 0 {
                drop(entry);
                self.channels.remove(&channel_id);
            }
        }
    }

    /// Dispatch a newly published `sequence_id` to every receiver
    /// registered on `channel_id`, via that channel's [`Signal::emit`]
    /// (§4.C "without holding the lock across user code").
    pub fn fanout(&self, channel_id: u64, sequence_id: u64) {
        if let Some(entry) = self.channels.get(&channel_id) {
            entry.receivers.emit(sequence_id);
        }
    }

    #[must_use]
    pub fn writer_count(&self, channel_id: u64) -> usize {
        self.channels.get(&channel_id).map_or(0, |e| e.writers.len())
    }

    #[must_use]
    pub fn receiver_count(&self, channel_id: u64) -> usize {
        self.channels.get(&channel_id).map_or(0, |e| e.receivers.slot_count())
    }

    /// Record one lost message for `channel_id` (§7 channel metrics).
    pub fn record_drop(&self, channel_id: u64) {
        self.channels
            .entry(channel_id)
            .or_default()
            .dropped
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    #[must_use]
    pub fn dropped_count(&self, channel_id: u64) -> u64 {
        self.channels
            .get(&channel_id)
            .map_or(0, |e| e.dropped.load(std::sync::atomic::Ordering::Relaxed))
    }
}
