// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Receiver endpoint (§4.B): subscribes to a channel's notify list and
//! enqueues pinned message references into its owning [`DataVisitor`] lane.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::registry::Registry;
use crate::shm::Segment;
use crate::signal::Connection;
use crate::visitor::{queued_ref_from, DataVisitor};

use super::qos::{Qos, Reliability};

/// Bounded retries for `ReliableLocal` before giving up on a notify whose
/// block is still held for write.
const RELIABLE_SPIN_ATTEMPTS: u32 = 64;

struct Inner {
    segment: Arc<Segment>,
    registry: Arc<Registry>,
    channel_id: u64,
    visitor: Arc<Mutex<DataVisitor>>,
    lane_index: usize,
    qos: Qos,
}

impl Inner {
    fn on_notify(&self, seq: u64) {
        let msg = match self.qos.reliability {
            Reliability::BestEffort => self.segment.acquire(seq).ok(),
            Reliability::ReliableLocal => {
                let mut attempt = 0;
                loop {
                    match self.segment.acquire(seq) {
                        Ok(msg) => break Some(msg),
                        Err(_) if attempt < RELIABLE_SPIN_ATTEMPTS => {
                            attempt += 1;
                            std::hint::spin_loop();
                        }
                        Err(err) => {
                            #[cfg(feature = "logging")]
                            log::debug!("[transport] reliable-local receiver gave up on seq={seq}: {err}");
                            #[cfg(not(feature = "logging"))]
                            let _ = err;
                            break None;
                        }
                    }
                }
            }
        };

        let Some(msg) = msg else {
            self.registry.record_drop(self.channel_id);
            return;
        };
        let item = queued_ref_from(&msg, crate::shm::ring::now_ns());
        let dropped = self.visitor.lock().offer(self.lane_index, item);
        if dropped {
            #[cfg(feature = "logging")]
            log::debug!("[transport] receiver lane {} dropped oldest on overflow", self.lane_index);
            self.registry.record_drop(self.channel_id);
        }
    }
}

/// Subscribes one lane of a [`DataVisitor`] to a channel (§4.B).
///
/// Construction registers the notify callback immediately; dropping a
/// `Receiver` unsubscribes and prunes the channel's registry entry if it
/// is now empty.
pub struct Receiver {
    channel: Channel,
    registry: Arc<Registry>,
    connection: Connection,
}

impl Receiver {
    /// Subscribe `lane_index` of `visitor` to `channel`'s notify list.
    ///
    /// Public (unlike most of `Node`'s internals) so a caller can wire a
    /// [`DataVisitor`] by hand without going through [`crate::node::Node`],
    /// the same way [`crate::transport::Writer::new`] is usable standalone.
    #[must_use]
    pub fn new(channel: Channel, segment: Arc<Segment>, registry: Arc<Registry>, visitor: Arc<Mutex<DataVisitor>>, lane_index: usize, qos: Qos) -> Self {
        let inner = Arc::new(Inner {
            segment,
            registry: registry.clone(),
            channel_id: channel.id(),
            visitor,
            lane_index,
            qos,
        });
        let callback_inner = inner.clone();
        let connection = registry.register_receiver(channel.id(), move |seq| callback_inner.on_notify(seq));
        #[cfg(feature = "logging")]
        log::debug!("[transport] receiver subscribed channel={channel} lane={lane_index}");
        Self {
            channel,
            registry,
            connection,
        }
    }

    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.registry.unregister_receiver(self.channel.id(), &self.connection);
        self.registry.prune_if_empty(self.channel.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{RawBytes, TypeDescriptor};
    use crate::transport::writer::Writer;

    #[test]
    fn publish_reaches_subscribed_lane() {
        let channel = Channel::new("/corobus_test_receiver_basic");
        let segment = Arc::new(Segment::open_or_create(&channel.segment_name(), 64, 4).unwrap());
        let registry = Arc::new(Registry::new());
        let visitor = Arc::new(Mutex::new(DataVisitor::new(1, 4)));

        let _receiver = Receiver::new(channel.clone(), segment.clone(), registry.clone(), visitor.clone(), 0, Qos::default());
        let writer = Writer::new(channel, segment, registry, Qos::default());

        let payload = RawBytes(vec![9, 9, 9]);
        writer.publish(&payload).unwrap();

        let tuple = visitor.lock().try_fetch().expect("lane should have received the publish");
        assert_eq!(tuple.len(), 1);
    }

    #[test]
    fn best_effort_drops_when_block_not_pinnable() {
        let channel = Channel::new("/corobus_test_receiver_best_effort");
        let segment = Arc::new(Segment::open_or_create(&channel.segment_name(), 64, 4).unwrap());
        let registry = Arc::new(Registry::new());
        let visitor = Arc::new(Mutex::new(DataVisitor::new(1, 4)));
        let _receiver = Receiver::new(channel.clone(), segment.clone(), registry.clone(), visitor.clone(), 0, Qos::default());

        // Notifying about a sequence id that was never published can never
        // be pinned; best-effort must not panic, just skip the offer.
        registry.fanout(channel.id(), 9999);
        assert!(visitor.lock().try_fetch().is_none());
        assert_eq!(registry.dropped_count(channel.id()), 1);
    }

    #[test]
    fn visitor_overflow_is_counted_in_channel_metrics() {
        let channel = Channel::new("/corobus_test_receiver_overflow_metrics");
        let segment = Arc::new(Segment::open_or_create(&channel.segment_name(), 64, 8).unwrap());
        let registry = Arc::new(Registry::new());
        let visitor = Arc::new(Mutex::new(DataVisitor::new(1, 1)));
        let _receiver = Receiver::new(channel.clone(), segment.clone(), registry.clone(), visitor.clone(), 0, Qos::default());
        let writer = Writer::new(channel.clone(), segment, registry.clone(), Qos::default());

        writer.publish(&RawBytes(vec![1])).unwrap();
        writer.publish(&RawBytes(vec![2])).unwrap();

        assert_eq!(registry.dropped_count(channel.id()), 1);
    }
}
