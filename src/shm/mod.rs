// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared-memory transport (§4.A): POSIX segments, cache-aligned block
//! descriptors, and the per-channel block ring built on top of them.

pub mod block;
pub mod ring;
pub mod segment;

pub use block::{Block, SegmentHeader};
pub use ring::{MessageRef, Segment};
pub use segment::{CreateOutcome, ShmSegment};
