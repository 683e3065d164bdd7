// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cache-aligned `Block` descriptor and `SegmentHeader` control block (§3, §6).
//!
//! Adapted from the teacher's `transport::shm::slot::{ShmSlot, ShmControl}`:
//! same cache-line alignment and Acquire/Release discipline, but the
//! reservation protocol here is a refcounted writer-lock/reader-count pair
//! rather than a single-sequence SPMC cursor, per spec §3/§4.A.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Block descriptor: one fixed-size slot within a [`crate::shm::ring::Segment`].
///
/// # Memory Ordering Strategy
///
/// - `try_acquire_writer` CAS's `writer_lock` 0->1 (Acquire on success: the
///   writer must not start copying the payload until it has observed any
///   prior reader's release).
/// - `release_writer` stores the commit fields with Release ordering so
///   that a reader's Acquire load of `seq` is guaranteed to see the
///   completed payload write (§3 Block invariants).
/// - `reader_count` uses fetch_add/fetch_sub with Acquire/Release so the
///   block cannot be considered free (writable) until every pinning
///   reference has been dropped.
#[repr(C, align(64))]
pub struct Block {
    /// 0 = no writer holds this block, 1 = writer is writing.
    pub writer_lock: AtomicU32,
    /// Number of live `MessageRef`s pinning this block for reading.
    pub reader_count: AtomicU32,
    /// Valid payload length in bytes (0 until first commit).
    pub len: AtomicU32,
    /// PID of the process that currently (or most recently) holds the
    /// writer lock, used for crash-recovery liveness checks (§4.A).
    pub writer_pid: AtomicU32,
    /// Monotonically increasing sequence id, strictly increasing across
    /// publishes on this segment; never wraps in practice (§3).
    pub seq: AtomicU64,
    /// Write-completion timestamp, nanoseconds since `UNIX_EPOCH`.
    pub timestamp_ns: AtomicU64,
}

impl Block {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            writer_lock: AtomicU32::new(0),
            reader_count: AtomicU32::new(0),
            len: AtomicU32::new(0),
            writer_pid: AtomicU32::new(0),
            seq: AtomicU64::new(0),
            timestamp_ns: AtomicU64::new(0),
        }
    }

    /// Attempt to transition WRITABLE -> writer-held. A block is WRITABLE
    /// iff `writer_lock == 0 AND reader_count == 0` (§3 invariant).
    #[inline]
    pub fn try_acquire_writer(&self, pid: u32) -> bool {
        if self.reader_count.load(Ordering::Acquire) != 0 {
            return false;
        }
        let acquired = self
            .writer_lock
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if acquired {
            // Re-check reader_count: a reader may have pinned the block
            // between our first check and the CAS. Roll back if so —
            // readers only pin WRITABLE==false blocks, so this should not
            // happen in practice, but the check keeps the invariant airtight.
            if self.reader_count.load(Ordering::Acquire) != 0 {
                self.writer_lock.store(0, Ordering::Release);
                return false;
            }
            self.writer_pid.store(pid, Ordering::Relaxed);
        }
        acquired
    }

    /// Commit payload metadata and release the writer lock. Must only be
    /// called by the holder of a successful `try_acquire_writer`.
    #[inline]
    pub fn commit_and_release(&self, len: u32, seq: u64, timestamp_ns: u64) {
        self.len.store(len, Ordering::Relaxed);
        self.seq.store(seq, Ordering::Relaxed);
        self.timestamp_ns.store(timestamp_ns, Ordering::Relaxed);
        // Release: everything above (len/seq/timestamp, and the payload
        // bytes the caller copied before calling this) must be visible to
        // any reader that observes writer_lock == 0 afterwards.
        self.writer_lock.store(0, Ordering::Release);
    }

    /// A block is READABLE iff `writer_lock == 0 AND length > 0 AND
    /// reader_count > 0` is the post-condition once pinned; before pinning
    /// we only require `writer_lock == 0` and a matching `seq`.
    #[inline]
    pub fn is_writer_free(&self) -> bool {
        self.writer_lock.load(Ordering::Acquire) == 0
    }

    /// Pin this block for reading iff it is not currently writer-held and
    /// its sequence id matches `expected_seq` (ABA guard). Returns `true`
    /// on success, having incremented `reader_count`.
    #[inline]
    pub fn try_pin_reader(&self, expected_seq: u64) -> bool {
        if self.writer_lock.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.reader_count.fetch_add(1, Ordering::Acquire);
        // Double-check under the pin: if the writer raced in after our
        // first check but before the fetch_add, or the sequence no longer
        // matches (block was recycled), back out.
        if self.writer_lock.load(Ordering::Acquire) != 0 || self.seq.load(Ordering::Acquire) != expected_seq {
            self.reader_count.fetch_sub(1, Ordering::Release);
            return false;
        }
        true
    }

    /// Release a previously acquired reader pin.
    #[inline]
    pub fn release_reader(&self) {
        self.reader_count.fetch_sub(1, Ordering::Release);
    }

    #[inline]
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    #[inline]
    pub fn current_len(&self) -> u32 {
        self.len.load(Ordering::Relaxed)
    }

    /// Forcibly clear a writer lock left behind by a dead process (§4.A
    /// crash resilience). Callers must already have established that
    /// `writer_pid` is no longer alive.
    pub fn reclaim_from_dead_writer(&self) {
        self.len.store(0, Ordering::Relaxed);
        self.writer_lock.store(0, Ordering::Release);
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

/// Header placed at offset 0 of a channel's segment (§6 segment layout).
#[repr(C, align(64))]
pub struct SegmentHeader {
    pub magic: u64,
    pub version: u32,
    pub ceiling_msg_size: u32,
    pub block_num: u32,
    pub block_buf_size: u32,
    pub seq_counter: AtomicU64,
    pub ref_count: AtomicU32,
    pub liveness_epoch: AtomicU32,
}

impl SegmentHeader {
    pub const MAGIC: u64 = 0x434f_524f_4255_5300; // "COROBUS\0"
    pub const VERSION: u32 = 1;

    #[must_use]
    pub fn new(ceiling_msg_size: u32, block_num: u32, block_buf_size: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            ceiling_msg_size,
            block_num,
            block_buf_size,
            seq_counter: AtomicU64::new(0),
            ref_count: AtomicU32::new(0),
            liveness_epoch: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn validate(&self) -> bool {
        self.magic == Self::MAGIC && self.version == Self::VERSION
    }

    #[inline]
    pub fn next_seq(&self) -> u64 {
        self.seq_counter.fetch_add(1, Ordering::AcqRel)
    }

    #[inline]
    pub fn acquire_ref(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Release a reference, returning the count after release.
    #[inline]
    pub fn release_ref(&self) -> u32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_alignment_is_one_cache_line() {
        assert_eq!(std::mem::align_of::<Block>(), 64);
        assert_eq!(std::mem::align_of::<SegmentHeader>(), 64);
    }

    #[test]
    fn writer_then_reader_lifecycle() {
        let block = Block::new();
        assert!(block.try_acquire_writer(123));
        assert!(!block.try_acquire_writer(123), "second writer must fail");

        block.commit_and_release(16, 7, 1_000);
        assert!(block.is_writer_free());

        assert!(block.try_pin_reader(7));
        assert!(!block.try_acquire_writer(456), "reader pin blocks writer");
        block.release_reader();
        assert!(block.try_acquire_writer(456));
    }

    #[test]
    fn reader_pin_rejects_stale_sequence() {
        let block = Block::new();
        block.try_acquire_writer(1);
        block.commit_and_release(8, 5, 1);

        assert!(!block.try_pin_reader(4), "wrong seq must not pin");
        assert!(block.try_pin_reader(5));
    }

    #[test]
    fn header_ref_counting() {
        let header = SegmentHeader::new(4096, 64, 4096);
        assert_eq!(header.ref_count(), 0);
        assert_eq!(header.acquire_ref(), 1);
        assert_eq!(header.acquire_ref(), 2);
        assert_eq!(header.release_ref(), 1);
        assert_eq!(header.ref_count(), 1);
    }

    #[test]
    fn header_validates_magic_and_version() {
        let header = SegmentHeader::new(1, 1, 1);
        assert!(header.validate());
    }
}
