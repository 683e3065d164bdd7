// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Crate-wide error type.
//!
//! Mirrors the teacher's hand-rolled `enum Error` + manual `Display`
//! convention (see `transport::shm::ShmError` in the grounding corpus) rather
//! than pulling in `thiserror`: every error kind named in the specification's
//! error-handling section gets exactly one variant here.

use std::fmt;
use std::io;

/// All failure modes surfaced by this crate's public API.
#[derive(Debug)]
pub enum Error {
    /// Message larger than the channel's ceiling size.
    CapacityExceeded { size: usize, ceiling: usize },
    /// All blocks in the segment are currently held.
    NoFreeSlot,
    /// The type descriptor's `serialize` call reported failure.
    SerializationFailed(String),
    /// The type descriptor's `deserialize` call reported failure.
    DeserializationFailed(String),
    /// A message reference targeted a block that was already recycled.
    StaleReference,
    /// The segment could not be created nor attached.
    SegmentUnavailable(io::Error),
    /// Operation attempted after scheduler shutdown.
    SchedulerStopped,
    /// Shared memory segment name failed POSIX validation.
    InvalidSegmentName(String),
    /// Ring capacity must be a power of two.
    InvalidCapacity(usize),
    /// Segment control block failed magic/version validation.
    Corruption,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CapacityExceeded { size, ceiling } => write!(
                f,
                "message of {size} bytes exceeds channel ceiling of {ceiling} bytes"
            ),
            Error::NoFreeSlot => write!(f, "no free slot: all blocks are held"),
            Error::SerializationFailed(reason) => write!(f, "serialization failed: {reason}"),
            Error::DeserializationFailed(reason) => write!(f, "deserialization failed: {reason}"),
            Error::StaleReference => write!(f, "message reference targets a recycled block"),
            Error::SegmentUnavailable(err) => write!(f, "segment unavailable: {err}"),
            Error::SchedulerStopped => write!(f, "scheduler is shut down"),
            Error::InvalidSegmentName(name) => write!(f, "invalid segment name: {name}"),
            Error::InvalidCapacity(cap) => write!(f, "invalid ring capacity (not power of 2): {cap}"),
            Error::Corruption => write!(f, "segment control block failed validation"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::SegmentUnavailable(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::SegmentUnavailable(err)
    }
}

/// Convenience alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, Error>;
