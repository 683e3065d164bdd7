// SPDX-License-Identifier: Apache-2.0 OR MIT

//! # corobus - coroutine-scheduled shared-memory pub/sub
//!
//! A single-host pub/sub middleware for real-time robotics: processes
//! publish and subscribe to named channels backed by shared-memory ring
//! buffers, and subscriber callbacks run on a cooperative scheduler of
//! stackful coroutines rather than a thread per reader.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use corobus::{Node, Qos, RawBytes, ReaderSpec, RuntimeConfig};
//!
//! let node = Node::new("example-node", &RuntimeConfig::default());
//!
//! let writer = node
//!     .create_writer::<RawBytes>("/lidar/scan", Qos::default(), 4096, 64)
//!     .expect("create writer");
//!
//! let spec = ReaderSpec::new(&["/lidar/scan"], 4096, 64, |values: Vec<RawBytes>| {
//!     println!("got {} message(s)", values.len());
//! });
//! node.create_reader(spec).expect("create reader");
//!
//! node.publish(writer, &RawBytes(vec![1, 2, 3])).expect("publish");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                              Node                                │
//! │   owns writers, readers, the scheduler, and the registry         │
//! └───────────┬─────────────────────────────────────────┬───────────┘
//!             │                                         │
//!     ┌───────▼────────┐                       ┌────────▼────────┐
//!     │     Writer      │                       │    Receiver     │
//!     │  (publish path) │                       │ (notify path)   │
//!     └───────┬─────────┘                       └────────┬────────┘
//!             │  publish                      fanout      │ offer
//!     ┌───────▼─────────────────────────────────┐  ┌──────▼───────┐
//!     │         Segment (shm ring, §4.A)         │  │ DataVisitor  │
//!     │   blocks, refcounts, sequence ids         │  │  (N-way      │
//!     └────────────────┬──────────────────────────┘  │  fan-in)     │
//!                       │ register/fanout             └──────┬───────┘
//!               ┌───────▼────────┐                   try_fetch│
//!               │    Registry     │                   ┌───────▼───────┐
//!               │ channel_id ->   │                   │   Coroutine    │
//!               │ {writers,       │                   │ (state machine)│
//!               │  receivers}     │                   └───────┬───────┘
//!               └─────────────────┘                           │ spawn/notify/stop
//!                                                      ┌───────▼───────┐
//!                                                      │   Scheduler    │
//!                                                      │ (worker pool,  │
//!                                                      │  Policy trait) │
//!                                                      └────────────────┘
//! ```
//!
//! ## Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`Node`] | Owns a node's writers, readers, scheduler, and registry; the main entry point. |
//! | [`Writer`] | Publishes serialized messages into a channel's shared-memory segment. |
//! | [`Receiver`] | Subscribes one lane of a [`DataVisitor`] to a channel's notifications. |
//! | [`Segment`] | Shared-memory ring of refcounted blocks backing one channel. |
//! | [`Registry`] | Process-wide `channel_id -> {writers, receivers}` table. |
//! | [`DataVisitor`] | Bounded N-way fan-in queue feeding a coroutine's `try_fetch`. |
//! | [`Coroutine`] | Stackful coroutine state machine (Ready/Running/DataWait/IoWait/Sleep/Finished). |
//! | [`Scheduler`] | Cooperative multi-policy worker pool that runs coroutines. |
//! | [`Signal`] | Thread-safe one-to-many event primitive. |
//! | [`TypeDescriptor`] | Serialization boundary between user types and the wire. |
//!
//! ## Features
//!
//! - Shared-memory transport with refcounted blocks and crash-resilient
//!   open-or-create segment setup (§4.A).
//! - Best-effort and reliable-local QoS on the receive path (§4.B).
//! - N-way data-visitor fan-in across up to four channels per reader (§4.D).
//! - A stackful-coroutine state machine driven by a cooperative scheduler
//!   with pluggable scheduling policies: classic round-robin, choreography
//!   (group affinity), and capacity-aware (EWMA load balancing) (§4.F).
//! - A thread-safe signal/slot primitive for non-data control events (§4.G).
//!
//! ## Modules Overview
//!
//! - [`shm`] - shared-memory segments, block descriptors, and the ring (§4.A).
//! - [`channel`] - named channel identity and segment-name derivation.
//! - [`transport`] - writer/receiver endpoints and QoS (§4.B).
//! - [`registry`] - the process-wide channel registry (§4.C).
//! - [`visitor`] - the N-way data-visitor fan-in (§4.D).
//! - [`coroutine`] - the coroutine state machine (§4.E).
//! - [`sched`] - the cooperative scheduler and its policies (§4.F).
//! - [`signal`] - the thread-safe signal/slot primitive (§4.G).
//! - [`node`] - the [`Node`] facade (§4.H).
//! - [`serialize`] - the [`TypeDescriptor`] serialization boundary (§4.I).
//! - [`config`] - static defaults and [`RuntimeConfig`].
//! - [`error`] - the crate-wide [`Error`] and [`Result`] types.

/// Named channel identity and segment-name derivation (§3).
pub mod channel;
/// Global configuration: static defaults and [`config::RuntimeConfig`].
pub mod config;
/// The coroutine state machine (§4.E).
pub mod coroutine;
/// Crate-wide error type.
pub mod error;
/// Process-wide channel registry (§4.C).
pub mod registry;
/// The cooperative scheduler and its policies (§4.F).
pub mod sched;
/// The [`serialize::TypeDescriptor`] serialization boundary (§4.I).
pub mod serialize;
/// Shared-memory segments, block descriptors, and the ring (§4.A).
pub mod shm;
/// Thread-safe signal/slot primitive (§4.G).
pub mod signal;
/// Writer/receiver transport endpoints and QoS (§4.B).
pub mod transport;
/// N-way data-visitor fan-in (§4.D).
pub mod visitor;

/// The [`Node`] facade grouping writers, readers, the scheduler, and the
/// registry under one logical identity (§4.H).
pub mod node;

pub use channel::Channel;
pub use config::{RuntimeConfig, SchedPolicy};
pub use coroutine::{Context, Coroutine, CoroutineId, State};
pub use error::{Error, Result};
pub use node::{Node, ReaderId, ReaderSpec, WriterId};
pub use registry::Registry;
pub use sched::Scheduler;
pub use serialize::{RawBytes, TypeDescriptor};
pub use shm::{MessageRef, Segment};
pub use signal::{Connection, Signal};
pub use transport::{Qos, Receiver, Reliability, Writer};
pub use visitor::{AlignByTimestamp, DataVisitor, QueuedRef};
