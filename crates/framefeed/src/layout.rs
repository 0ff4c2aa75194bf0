// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 framefeed contributors

//! In-segment data structures and size arithmetic.
//!
//! # Memory layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | SegmentHeader (64 bytes, cache-aligned)                      |
//! |   magic/version, dimensions, owner_pid, is_alive,            |
//! |   active_readers, frame_cnt, master mutex + condvar          |
//! +--------------------------------------------------------------+
//! | SlotRecord[0] (64 bytes: frame_uid, acquisition_time, rwlock)|
//! | SlotRecord[1]                                                |
//! | SlotRecord[RING_DEPTH-1]                                     |
//! +--------------------------------------------------------------+
//! | pixel area: RING_DEPTH images of width*height*depth bytes    |
//! +--------------------------------------------------------------+
//! ```
//!
//! The layout is `repr(C)` and deterministic from `(width, height, depth)`
//! and [`RING_DEPTH`], so two processes mapping the same file at the same
//! length agree on every field address.
//!
//! Every mutable field is an atomic or a futex word: the header is only
//! ever accessed through a shared reference once the segment is published,
//! from any number of address spaces at once.

use crate::sync::{ShmCondvar, ShmMutex, ShmRwLock};
use crate::RING_DEPTH;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Identifies a mapped file as a frame-feed segment ("FFED").
pub(crate) const MAGIC: u32 = 0x4646_4544;

/// Bumped on any layout change; `open` refuses other versions.
pub(crate) const VERSION: u32 = 1;

/// Per-slot descriptor: publication metadata plus the slot's own
/// reader/writer lock.
///
/// `frame_uid == 0` means the slot has never been written. The writer
/// updates both fields under the write lock; readers copy them out under a
/// read lock, so the loads never observe a half-published slot.
#[repr(C, align(64))]
pub(crate) struct SlotRecord {
    pub frame_uid: AtomicU64,
    pub acquisition_time: AtomicU64,
    pub lock: ShmRwLock,
    _pad: [u8; 44],
}

/// Segment header at offset 0 of the mapping.
#[repr(C, align(64))]
pub(crate) struct SegmentHeader {
    /// Written last during creation (release); `open` validates it first
    /// (acquire), which is what publishes the plain fields below to other
    /// processes.
    pub magic: AtomicU32,
    pub version: u32,

    // Immutable after creation.
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub owner_pid: i32,

    pub is_alive: AtomicU32,
    /// Readers currently holding a slot read lock; teardown drains this
    /// before unmapping.
    pub active_readers: AtomicU32,
    /// Count of successful publications; slot uids are drawn from it.
    pub frame_cnt: AtomicU64,

    pub lock: ShmMutex,
    pub cond: ShmCondvar,
    _pad: [u8; 16],

    pub slots: [SlotRecord; RING_DEPTH],
}

impl SegmentHeader {
    /// True if the mapping carries a current-version feed header.
    pub(crate) fn validate(&self) -> bool {
        self.magic.load(Ordering::Acquire) == MAGIC && self.version == VERSION
    }

    /// Bytes of one image in this segment.
    pub(crate) fn image_size(&self) -> usize {
        image_size(self.width, self.height, self.depth)
    }

    /// Total mapping length implied by this header's dimensions.
    pub(crate) fn segment_size(&self) -> usize {
        segment_size(self.width, self.height, self.depth)
    }

    pub(crate) fn alive(&self) -> bool {
        self.is_alive.load(Ordering::Acquire) != 0
    }
}

/// Bytes of one `width` x `height` image at `depth` bytes per pixel.
pub(crate) fn image_size(width: u32, height: u32, depth: u32) -> usize {
    width as usize * height as usize * depth as usize
}

/// Total segment length for the given frame dimensions.
pub(crate) fn segment_size(width: u32, height: u32, depth: u32) -> usize {
    std::mem::size_of::<SegmentHeader>() + RING_DEPTH * image_size(width, height, depth)
}

/// Byte offset of slot `index`'s image within the segment.
pub(crate) fn pixels_offset(width: u32, height: u32, depth: u32, index: usize) -> usize {
    debug_assert!(index < RING_DEPTH);
    std::mem::size_of::<SegmentHeader>() + index * image_size(width, height, depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn test_header_is_cache_aligned() {
        assert_eq!(align_of::<SegmentHeader>(), 64);
        assert_eq!(align_of::<SlotRecord>(), 64);
    }

    #[test]
    fn test_slot_record_is_one_cache_line() {
        assert_eq!(size_of::<SlotRecord>(), 64);
    }

    #[test]
    fn test_header_size() {
        // One cache line of scalars plus the slot array.
        assert_eq!(size_of::<SegmentHeader>(), 64 + RING_DEPTH * 64);
        assert_eq!(offset_of!(SegmentHeader, slots), 64);
    }

    #[test]
    fn test_segment_size_arithmetic() {
        let w = 640;
        let h = 480;
        let d = 3;
        assert_eq!(image_size(w, h, d), 640 * 480 * 3);
        assert_eq!(
            segment_size(w, h, d),
            size_of::<SegmentHeader>() + RING_DEPTH * 640 * 480 * 3
        );
    }

    #[test]
    fn test_pixels_offsets_are_disjoint() {
        let w = 2;
        let h = 2;
        let d = 1;
        let image = image_size(w, h, d);
        for i in 1..RING_DEPTH {
            assert_eq!(
                pixels_offset(w, h, d, i),
                pixels_offset(w, h, d, i - 1) + image
            );
        }
        assert_eq!(
            pixels_offset(w, h, d, RING_DEPTH - 1) + image,
            segment_size(w, h, d)
        );
    }
}
