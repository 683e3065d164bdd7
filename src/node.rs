// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Node facade (§4.H): groups endpoints under a logical name, owns them,
//! and shuts them down in the required order.
//!
//! Grounded on the teacher's `engine::router::Router` ownership shape (a
//! handle type that owns worker state and tears it down on `stop`/`Drop`)
//! generalized from one worker to a set of writers/readers plus the
//! scheduler and registry they share.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::config::RuntimeConfig;
use crate::coroutine::{self, CoroutineId};
use crate::registry::Registry;
use crate::sched::Scheduler;
use crate::serialize::TypeDescriptor;
use crate::shm::Segment;
use crate::transport::{Qos, Receiver, Writer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriterId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderId(u64);

struct WriterSlot {
    id: WriterId,
    any: Box<dyn Any + Send + Sync>,
}

struct ReaderSlot {
    id: ReaderId,
    coroutine_id: CoroutineId,
}

/// Placement and capacity knobs for a reader's N-way fan-in (1..=4 channels).
pub struct ReaderSpec<'a, T, F> {
    pub channel_names: &'a [&'a str],
    pub qos: Qos,
    pub ceiling_msg_size: u32,
    pub block_num: u32,
    pub priority: u32,
    pub group_id: u64,
    pub weight: u32,
    pub callback: F,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T, F> ReaderSpec<'a, T, F>
where
    T: TypeDescriptor + Send + Sync + 'static,
    F: Fn(Vec<T>) + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(channel_names: &'a [&'a str], ceiling_msg_size: u32, block_num: u32, callback: F) -> Self {
        Self {
            channel_names,
            qos: Qos::default(),
            ceiling_msg_size,
            block_num,
            priority: 0,
            group_id: 0,
            weight: 1,
            callback,
            _marker: std::marker::PhantomData,
        }
    }
}

/// Groups writers and readers under one logical identity (§4.H).
///
/// Construction is side-effect free: no segment is opened, no coroutine
/// spawned, until `create_writer`/`create_reader` is called. Shutdown
/// destroys readers first (stopping their coroutines), then writers,
/// then prunes the registry — each group in reverse creation order.
pub struct Node {
    name: String,
    scheduler: Arc<Scheduler>,
    registry: Arc<Registry>,
    segments: DashMap<u64, Arc<Segment>>,
    next_id: AtomicU64,
    writers: Mutex<Vec<WriterSlot>>,
    readers: Mutex<Vec<ReaderSlot>>,
    shutdown_done: std::sync::atomic::AtomicBool,
}

impl Node {
    #[must_use]
    pub fn new(name: impl Into<String>, config: &RuntimeConfig) -> Self {
        Self {
            name: name.into(),
            scheduler: Arc::new(Scheduler::start(config)),
            registry: Arc::new(Registry::new()),
            segments: DashMap::new(),
            next_id: AtomicU64::new(0),
            writers: Mutex::new(Vec::new()),
            readers: Mutex::new(Vec::new()),
            shutdown_done: std::sync::atomic::AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_running(&self) -> crate::error::Result<()> {
        if self.shutdown_done.load(Ordering::Acquire) {
            return Err(crate::error::Error::SchedulerStopped);
        }
        Ok(())
    }

    fn segment_for(&self, channel: &Channel, ceiling_msg_size: u32, block_num: u32) -> crate::error::Result<Arc<Segment>> {
        if let Some(existing) = self.segments.get(&channel.id()) {
            return Ok(existing.clone());
        }
        let segment = Arc::new(Segment::open_or_create(&channel.segment_name(), ceiling_msg_size, block_num)?);
        self.segments.insert(channel.id(), segment.clone());
        Ok(segment)
    }

    /// Create a writer for `channel_name` (§4.B, §4.H factory method).
    pub fn create_writer<T>(&self, channel_name: &str, qos: Qos, ceiling_msg_size: u32, block_num: u32) -> crate::error::Result<WriterId>
    where
        T: TypeDescriptor + Send + Sync + 'static,
    {
        self.check_running()?;
        let channel = Channel::new(channel_name);
        let segment = self.segment_for(&channel, ceiling_msg_size, block_num)?;
        let writer = Writer::<T>::new(channel, segment, self.registry.clone(), qos);
        let id = WriterId(self.fresh_id());
        self.writers.lock().push(WriterSlot { id, any: Box::new(writer) });
        Ok(id)
    }

    /// Publish through a writer created by [`Node::create_writer`].
    ///
    /// # Panics
    /// Panics if `id` is unknown to this node or `T` does not match the
    /// type the writer was created with — both are programming errors at
    /// the call site, not runtime conditions.
    pub fn publish<T>(&self, id: WriterId, msg: &T) -> crate::error::Result<u64>
    where
        T: TypeDescriptor + Send + Sync + 'static,
    {
        self.check_running()?;
        let writers = self.writers.lock();
        let slot = writers.iter().find(|s| s.id == id).expect("unknown writer id");
        let writer = slot.any.downcast_ref::<Writer<T>>().expect("writer type mismatch");
        writer.publish(msg)
    }

    /// Create an N-way (1..=4) reader: one [`Receiver`] per channel
    /// feeding a shared [`crate::visitor::DataVisitor`], driven by one
    /// coroutine that deserializes complete tuples and invokes `callback`.
    pub fn create_reader<T, F>(&self, spec: ReaderSpec<'_, T, F>) -> crate::error::Result<ReaderId>
    where
        T: TypeDescriptor + Send + Sync + 'static,
        F: Fn(Vec<T>) + Send + Sync + 'static,
    {
        self.check_running()?;
        let n = spec.channel_names.len();
        assert!((1..=4).contains(&n), "reader fan-in supports 1..=4 channels, got {n}");

        let channels: Vec<Channel> = spec.channel_names.iter().map(|name| Channel::new(*name)).collect();
        let segments: Vec<Arc<Segment>> = channels
            .iter()
            .map(|c| self.segment_for(c, spec.ceiling_msg_size, spec.block_num))
            .collect::<crate::error::Result<Vec<_>>>()?;

        let visitor = Arc::new(Mutex::new(crate::visitor::DataVisitor::new(n, spec.qos.history_depth)));
        let receivers: Vec<Receiver> = (0..n)
            .map(|i| Receiver::new(channels[i].clone(), segments[i].clone(), self.registry.clone(), visitor.clone(), i, spec.qos))
            .collect();

        // Filled in with the real id right after `spawn` returns; the
        // on_complete callback only fires once data has actually arrived,
        // by which point the scheduler has already registered the id.
        let pending_notify: Arc<Mutex<Option<CoroutineId>>> = Arc::new(Mutex::new(None));
        {
            let pending = pending_notify.clone();
            let scheduler = self.scheduler.clone();
            visitor.lock().set_on_complete(move || {
                if let Some(id) = *pending.lock() {
                    scheduler.notify(id);
                }
            });
        }

        let callback = spec.callback;
        let body_visitor = visitor.clone();
        let body_segments = segments.clone();
        let coroutine_id = self.scheduler.spawn(spec.priority, spec.group_id, spec.weight, crate::config::DEFAULT_STACK_SIZE_KB, move |ctx| {
            let _receivers = receivers;
            coroutine::data_visitor_body(
                ctx,
                || body_visitor.lock().try_fetch(),
                move |tuple| {
                    let mut values = Vec::with_capacity(tuple.len());
                    for (lane, qref) in tuple.iter().enumerate() {
                        match body_segments[lane].acquire(qref.sequence_id).and_then(|msg| msg.payload().and_then(T::deserialize)) {
                            Ok(value) => values.push(value),
                            Err(err) => {
                                #[cfg(feature = "logging")]
                                log::debug!("[node] lane {lane} seq={} dropped from tuple: {err}", qref.sequence_id);
                                #[cfg(not(feature = "logging"))]
                                let _ = err;
                            }
                        }
                    }
                    if values.len() == tuple.len() {
                        callback(values);
                    }
                },
            );
        });
        *pending_notify.lock() = Some(coroutine_id);

        let id = ReaderId(self.fresh_id());
        self.readers.lock().push(ReaderSlot { id, coroutine_id });
        Ok(id)
    }

    /// Stop a single reader's coroutine without tearing down the node.
    pub fn stop_reader(&self, id: ReaderId) {
        let mut readers = self.readers.lock();
        if let Some(pos) = readers.iter().position(|r| r.id == id) {
            let slot = readers.remove(pos);
            self.scheduler.stop(slot.coroutine_id);
        }
    }

    /// Tear down every endpoint this node owns: readers first (in
    /// reverse-creation order), then writers (same), then the scheduler's
    /// own worker threads, then the registry entries they leave behind.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut readers = self.readers.lock();
        while let Some(slot) = readers.pop() {
            self.scheduler.stop(slot.coroutine_id);
        }
        drop(readers);

        let mut writers = self.writers.lock();
        writers.clear();
        drop(writers);

        self.scheduler.shutdown();
        self.segments.clear();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
