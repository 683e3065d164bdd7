// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Serialization boundary (§4.I): the transport only ever sees bytes plus
//! a type name used to reject mismatched peers; everything else is the
//! user's concern.
//!
//! Grounded on the teacher's `xtypes::cdr2::traits::{Cdr2Encode, Cdr2Decode}`
//! contract (`encode_cdr2(&self, buf) -> Result<usize>` /
//! `decode_cdr2(buf) -> Result<(Self, usize)>`), merged into one trait per
//! message type the way the spec's boundary is shaped, with `max_size`
//! added so a writer can reject a payload before touching the segment.

use crate::error::{Error, Result};

/// A user-supplied codec for one message type (§4.I).
///
/// The transport never inspects `T`; it only calls `serialize` into its
/// staging buffer and `deserialize` out of a pinned block, and compares
/// `NAME` between peers at discovery time to reject a type mismatch.
pub trait TypeDescriptor: Sized {
    /// Stable name used to detect a writer/reader type mismatch. Not a
    /// wire format version — version negotiation is external (§4.I).
    const NAME: &'static str;

    /// Upper bound on `serialize`'s output, in bytes. Used to size the
    /// channel's ceiling message size and to reject an over-large value
    /// before it ever reaches the segment.
    fn max_size(&self) -> usize;

    /// Encode `self` into `buf`, returning the number of bytes written.
    /// `buf` is at least `max_size()` bytes; writers bound their staging
    /// buffer to the channel's ceiling, not to this value, so an
    /// implementation must still bounds-check and return
    /// [`Error::SerializationFailed`] rather than panic.
    fn serialize(&self, buf: &mut [u8]) -> Result<usize>;

    /// Decode a value from `buf` (exactly the bytes a writer committed).
    fn deserialize(buf: &[u8]) -> Result<Self>;
}

/// A `TypeDescriptor` for raw, pre-serialized byte payloads — the
/// identity codec used by callers who perform their own framing upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBytes(pub Vec<u8>);

impl TypeDescriptor for RawBytes {
    const NAME: &'static str = "corobus.raw_bytes";

    fn max_size(&self) -> usize {
        self.0.len()
    }

    fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.0.len() {
            return Err(Error::SerializationFailed(format!(
                "buffer too small: need {} have {}",
                self.0.len(),
                buf.len()
            )));
        }
        buf[..self.0.len()].copy_from_slice(&self.0);
        Ok(self.0.len())
    }

    fn deserialize(buf: &[u8]) -> Result<Self> {
        Ok(Self(buf.to_vec()))
    }
}
