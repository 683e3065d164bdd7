// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Writer endpoint (§4.B): serialize into a staging buffer, reserve a
//! slot, copy in, fan out the sequence id.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::registry::{Registry, WriterHandle};
use crate::serialize::TypeDescriptor;
use crate::shm::Segment;

use super::qos::Qos;

/// Publishes `T` values onto one channel (§4.B).
///
/// `publish` never blocks on slow readers: a full ring drops the oldest
/// held-for-read block only in the sense that a new write simply fails
/// with [`Error::NoFreeSlot`] rather than waiting — readers that have not
/// yet drained lose nothing they already observed, but a reader that
/// never catches up will eventually see gaps via [`Error::StaleReference`].
pub struct Writer<T: TypeDescriptor> {
    channel: Channel,
    segment: Arc<Segment>,
    registry: Arc<Registry>,
    handle: WriterHandle,
    qos: Qos,
    staging: Mutex<Vec<u8>>,
    _marker: PhantomData<fn(&T)>,
}

impl<T: TypeDescriptor> Writer<T> {
    /// Build a writer directly on top of an already-open [`Segment`],
    /// without going through [`crate::node::Node`].
    #[must_use]
    pub fn new(channel: Channel, segment: Arc<Segment>, registry: Arc<Registry>, qos: Qos) -> Self {
        let handle = registry.register_writer(channel.id());
        let ceiling = segment.block_buf_size() as usize;
        Self {
            channel,
            segment,
            registry,
            handle,
            qos,
            staging: Mutex::new(vec![0u8; ceiling]),
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    #[must_use]
    pub fn qos(&self) -> Qos {
        self.qos
    }

    /// Serialize `msg`, reserve a block, copy the payload in, and notify
    /// every local receiver on this channel (§4.B steps 1-4).
    pub fn publish(&self, msg: &T) -> Result<u64> {
        let ceiling = self.segment.block_buf_size() as usize;
        if msg.max_size() > ceiling {
            return Err(Error::CapacityExceeded {
                size: msg.max_size(),
                ceiling,
            });
        }

        let mut staging = self.staging.lock();
        let len = msg.serialize(&mut staging)?;

        let seq = self.segment.publish(&staging[..len])?;
        #[cfg(feature = "logging")]
        log::debug!("[transport] writer published channel={} seq={seq} len={len}", self.channel);
        self.registry.fanout(self.channel.id(), seq);
        Ok(seq)
    }
}

impl<T: TypeDescriptor> Drop for Writer<T> {
    fn drop(&mut self) {
        self.registry.unregister_writer(self.channel.id(), &self.handle);
        self.registry.prune_if_empty(self.channel.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::RawBytes;

    fn new_writer(name: &str) -> Writer<RawBytes> {
        let channel = Channel::new(name);
        let segment = Arc::new(Segment::open_or_create(&channel.segment_name(), 64, 4).unwrap());
        let registry = Arc::new(Registry::new());
        Writer::new(channel, segment, registry, Qos::default())
    }

    #[test]
    fn publish_assigns_increasing_sequence_ids() {
        let writer = new_writer("/corobus_test_writer_seq");
        let a = writer.publish(&RawBytes(vec![1, 2, 3])).unwrap();
        let b = writer.publish(&RawBytes(vec![4, 5, 6])).unwrap();
        assert!(b > a);
    }

    #[test]
    fn publish_rejects_payload_larger_than_ceiling() {
        let writer = new_writer("/corobus_test_writer_oversize");
        let err = writer.publish(&RawBytes(vec![0u8; 4096])).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
    }

    #[test]
    fn drop_unregisters_and_prunes_empty_channel() {
        let channel = Channel::new("/corobus_test_writer_drop");
        let segment = Arc::new(Segment::open_or_create(&channel.segment_name(), 64, 4).unwrap());
        let registry = Arc::new(Registry::new());
        let channel_id = channel.id();
        {
            let _writer = Writer::new(channel, segment, registry.clone(), Qos::default());
            assert_eq!(registry.writer_count(channel_id), 1);
        }
        assert_eq!(registry.writer_count(channel_id), 0);
    }
}
