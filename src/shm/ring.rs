// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-channel ring of reusable [`Block`]s inside a shared-memory [`ShmSegment`] (§4.A).
//!
//! Layout mirrors §6:
//! ```text
//! offset 0:              SegmentHeader
//! offset = sizeof(SegmentHeader): Block[block_num]
//! offset = sizeof(SegmentHeader) + block_num*sizeof(Block): buf[block_num][block_buf_size]
//! ```
//!
//! Structurally this is the teacher's `transport::shm::ring::{ShmRingWriter,
//! ShmRingReader}` collapsed into one type, because here both writers and
//! readers in the same process attach to the same segment and reservation
//! is refcounted rather than single-sequence SPMC (§3 Block invariants).

use super::block::{Block, SegmentHeader};
use super::segment::{CreateOutcome, ShmSegment};
use crate::error::{Error, Result};
use std::mem::size_of;
use std::time::{SystemTime, UNIX_EPOCH};

/// Bounded retries for the destroy-and-recreate path in §4.A, matching the
/// original implementation's ambiguous "up to 2 times" resolved in DESIGN.md.
const RECREATE_ATTEMPTS: u32 = 2;

#[must_use]
fn segment_size(block_num: u32, block_buf_size: u32) -> usize {
    size_of::<SegmentHeader>() + block_num as usize * size_of::<Block>() + block_num as usize * block_buf_size as usize
}

pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn current_pid() -> u32 {
    // SAFETY: getpid has no preconditions and always succeeds.
    unsafe { libc::getpid() as u32 }
}

/// A pinned, process-local handle to a readable [`Block`] (§3 "Message reference").
///
/// Holding a `MessageRef` keeps the block's reader count incremented; on
/// drop the pin is released. The sequence id is recorded at construction
/// and re-validated by [`MessageRef::payload`] to detect a block recycled
/// out from under a long-lived handle.
pub struct MessageRef<'a> {
    segment: &'a Segment,
    block_index: usize,
    seq: u64,
}

impl<'a> MessageRef<'a> {
    #[must_use]
    pub fn sequence_id(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn block_index(&self) -> usize {
        self.block_index
    }

    /// Borrow the payload bytes, re-checking the sequence id to guard
    /// against the block having been recycled since the reference was
    /// constructed (§3 "checked on every dereference").
    pub fn payload(&self) -> Result<&[u8]> {
        let block = self.segment.block(self.block_index);
        if block.current_seq() != self.seq {
            return Err(Error::StaleReference);
        }
        let len = block.current_len() as usize;
        // SAFETY: buf_ptr(block_index) points at block_buf_size bytes
        // reserved for this block in the segment; len was set by the
        // writer and is <= block_buf_size by construction in `publish`.
        let bytes = unsafe { std::slice::from_raw_parts(self.segment.buf_ptr(self.block_index), len) };
        Ok(bytes)
    }
}

impl Drop for MessageRef<'_> {
    fn drop(&mut self) {
        self.segment.block(self.block_index).release_reader();
    }
}

/// A channel's shared-memory block ring: header, block descriptors, and
/// the payload buffers that follow them, all within one [`ShmSegment`].
pub struct Segment {
    shm: ShmSegment,
    block_num: u32,
    block_buf_size: u32,
}

impl Segment {
    /// Open-or-create protocol (§4.A). `ceiling_msg_size` is the caller's
    /// required per-message ceiling; `block_num` is this channel's ring
    /// depth (ignored if attaching to an existing, larger segment).
    pub fn open_or_create(name: &str, ceiling_msg_size: u32, block_num: u32) -> Result<Self> {
        let mut attempts = 0;
        loop {
            let size = segment_size(block_num, ceiling_msg_size);
            match ShmSegment::create_exclusive(name, size)? {
                CreateOutcome::Created(shm) => {
                    let header = Self::header_ptr(&shm);
                    // SAFETY: shm was just created and zero-initialized;
                    // we have exclusive access until other processes attach.
                    unsafe {
                        header.write(SegmentHeader::new(ceiling_msg_size, block_num, ceiling_msg_size));
                    }
                    let segment = Self {
                        shm,
                        block_num,
                        block_buf_size: ceiling_msg_size,
                    };
                    segment.header().acquire_ref();
                    #[cfg(feature = "logging")]
                    log::debug!("[shm] created segment {name} (block_num={block_num}, block_buf_size={ceiling_msg_size})");
                    return Ok(segment);
                }
                CreateOutcome::AlreadyExists => {
                    // Peek the header first; we don't yet know the real
                    // full segment size to map.
                    let peek = ShmSegment::open(name, size_of::<SegmentHeader>())?;
                    // SAFETY: any existing segment created by this crate
                    // has a SegmentHeader at offset 0.
                    let header = unsafe { &*(peek.as_ptr() as *const SegmentHeader) };
                    if !header.validate() {
                        return Err(Error::Corruption);
                    }
                    let existing_block_num = header.block_num;
                    let existing_buf_size = header.block_buf_size;
                    let existing_ref_count = header.ref_count();
                    drop(peek);

                    if existing_buf_size >= ceiling_msg_size {
                        // Existing segment satisfies our ceiling; attach to it.
                        let full_size = segment_size(existing_block_num, existing_buf_size);
                        let shm = ShmSegment::open(name, full_size)?;
                        let segment = Self {
                            shm,
                            block_num: existing_block_num,
                            block_buf_size: existing_buf_size,
                        };
                        segment.header().acquire_ref();
                        return Ok(segment);
                    }

                    // Recreation rule: the prior creator chose too small a
                    // ceiling. Only safe to recreate if nobody else is
                    // attached (§4.A "Recreation rule").
                    if existing_ref_count > 0 {
                        return Err(Error::CapacityExceeded {
                            size: ceiling_msg_size as usize,
                            ceiling: existing_buf_size as usize,
                        });
                    }
                    if attempts >= RECREATE_ATTEMPTS {
                        return Err(Error::CapacityExceeded {
                            size: ceiling_msg_size as usize,
                            ceiling: existing_buf_size as usize,
                        });
                    }
                    ShmSegment::unlink(name)?;
                    attempts += 1;
                }
            }
        }
    }

    fn header_ptr(shm: &ShmSegment) -> *mut SegmentHeader {
        shm.as_ptr().cast::<SegmentHeader>()
    }

    #[inline]
    fn header(&self) -> &SegmentHeader {
        // SAFETY: offset 0 always holds a SegmentHeader for segments this
        // crate creates or attaches to (validated on attach).
        unsafe { &*(self.shm.as_ptr() as *const SegmentHeader) }
    }

    #[inline]
    fn block(&self, index: usize) -> &Block {
        debug_assert!(index < self.block_num as usize);
        // SAFETY: the block array starts immediately after the header and
        // has exactly `block_num` entries; index is bounds-checked above.
        unsafe {
            let blocks = self.shm.as_ptr().add(size_of::<SegmentHeader>()).cast::<Block>();
            &*blocks.add(index)
        }
    }

    #[inline]
    fn buf_ptr(&self, index: usize) -> *const u8 {
        debug_assert!(index < self.block_num as usize);
        let bufs_offset = size_of::<SegmentHeader>() + self.block_num as usize * size_of::<Block>();
        // SAFETY: the buffer array starts right after the block
        // descriptors and has `block_num` fixed-size slots.
        unsafe { self.shm.as_ptr().add(bufs_offset + index * self.block_buf_size as usize) }
    }

    #[inline]
    fn buf_mut_ptr(&self, index: usize) -> *mut u8 {
        self.buf_ptr(index) as *mut u8
    }

    #[must_use]
    pub fn block_num(&self) -> u32 {
        self.block_num
    }

    #[must_use]
    pub fn block_buf_size(&self) -> u32 {
        self.block_buf_size
    }

    #[must_use]
    pub fn segment_name(&self) -> &str {
        self.shm.name()
    }

    /// Reserve a writable block, copy `data` in, and commit it (§4.A
    /// "Slot reservation (writer)"). Returns the assigned sequence id.
    ///
    /// The target block is `seq % block_num`, never an independently
    /// chosen slot: `acquire` relies on that exact mapping to find a
    /// sequence id's block, so the two can never be allowed to diverge.
    /// A target block that is still busy (reader-pinned or another
    /// writer mid-commit) is back-pressure, not a reason to write
    /// elsewhere under a mismatched seq.
    pub fn publish(&self, data: &[u8]) -> Result<u64> {
        if data.len() > self.block_buf_size as usize {
            return Err(Error::CapacityExceeded {
                size: data.len(),
                ceiling: self.block_buf_size as usize,
            });
        }

        let pid = current_pid();
        let seq = self.header().next_seq();
        let idx = (seq % self.block_num as u64) as usize;
        if !self.block(idx).try_acquire_writer(pid) {
            return Err(Error::NoFreeSlot);
        }

        // SAFETY: we hold the writer lock for block `idx` (try_acquire_writer
        // succeeded), so no reader can be pinned and no other writer can
        // be copying into this buffer concurrently.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.buf_mut_ptr(idx), data.len());
        }

        self.block(idx).commit_and_release(data.len() as u32, seq, now_ns());
        Ok(seq)
    }

    /// Acquire a reference to the block holding `seq`, per §4.A "Reader
    /// acquisition": locate by `seq mod block_num`, verify the stored
    /// sequence id, and pin it.
    pub fn acquire(&self, seq: u64) -> Result<MessageRef<'_>> {
        let idx = (seq % self.block_num as u64) as usize;
        if !self.block(idx).try_pin_reader(seq) {
            return Err(Error::StaleReference);
        }
        Ok(MessageRef {
            segment: self,
            block_index: idx,
            seq,
        })
    }

    /// Reclaim a writer lock left behind by a process that is no longer
    /// alive (§4.A crash resilience). Scans all blocks; returns the
    /// number reclaimed.
    pub fn reclaim_dead_writers(&self) -> usize {
        let mut reclaimed = 0;
        for idx in 0..self.block_num as usize {
            let block = self.block(idx);
            if block.writer_lock.load(std::sync::atomic::Ordering::Acquire) == 0 {
                continue;
            }
            let pid = block.writer_pid.load(std::sync::atomic::Ordering::Relaxed);
            if pid != 0 && !process_is_alive(pid) {
                block.reclaim_from_dead_writer();
                reclaimed += 1;
                #[cfg(feature = "logging")]
                log::warn!("[shm] reclaimed block {idx} held by dead writer pid={pid}");
            }
        }
        if reclaimed > 0 {
            self.header().liveness_epoch.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        }
        reclaimed
    }

    /// Drop this handle's reference; the final releaser unlinks.
    pub fn release(&self) -> Result<()> {
        if self.header().release_ref() == 0 {
            ShmSegment::unlink(self.segment_name())?;
        }
        Ok(())
    }
}

fn process_is_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 performs no action besides existence/
    // permission checks; pid is a plausible process id from a Block.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
