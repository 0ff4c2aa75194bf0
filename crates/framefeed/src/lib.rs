// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 framefeed contributors

//! # framefeed - shared-memory frame feeds
//!
//! Single-producer, multi-consumer ring buffer for fixed-size image frames,
//! shared between processes on one host through a memory-mapped file under
//! `/dev/shm`. One writer process publishes raw pixel buffers; any number of
//! reader processes map the same segment and copy frames out without going
//! through a kernel pipe.
//!
//! # Architecture
//!
//! ```text
//! +------------------+                      +------------------+
//! |  Producer        |    /dev/shm/         |  Consumer(s)     |
//! |  FrameFeed::     |    buffer-<name>     |  FrameFeed::     |
//! |  create+publish -+--------(mmap)--------+-> open+read      |
//! +------------------+                      +------------------+
//!                       futex mutex/condvar
//!                       per-slot rwlocks
//! ```
//!
//! The segment holds a small ring of [`RING_DEPTH`] slots. Each slot carries
//! its own process-shared reader/writer lock so readers of older frames run
//! in parallel with the writer publishing a newer one. A master mutex and
//! condition variable (also living inside the segment) wake blocked readers
//! on every publish and on teardown.
//!
//! # Ownership and poisoning
//!
//! Exactly one process, recorded by PID at creation time, owns a feed. Only
//! the owner publishes and only the owner tears the feed down gracefully
//! ([`FrameFeed::destroy`]). If the owner dies without destroying the feed,
//! the segment is *poisoned*: [`FrameFeed::is_poisoned`] reports it and any
//! other process may then destroy the segment.
//!
//! # Quick start
//!
//! ```no_run
//! use framefeed::{Frame, FrameFeed};
//!
//! # fn main() -> framefeed::Result<()> {
//! // Producer process
//! let feed = FrameFeed::create("forward", 640, 480, 3)?;
//! let pixels = vec![0u8; feed.image_size()];
//! feed.publish(640, 480, 3, 100, &pixels)?;
//!
//! // Consumer process
//! let feed = FrameFeed::open("forward")?;
//! let mut frame = Frame::new();
//! feed.read(&mut frame, true)?;
//! println!("frame {} at t={}", frame.frame_uid(), frame.acquisition_time());
//! # Ok(())
//! # }
//! ```
//!
//! Linux only: the implementation relies on `/dev/shm` and the futex
//! syscall for its process-shared locks.

mod feed;
mod frame;
mod futex;
mod layout;
mod segment;
mod sync;

pub use feed::{feed_exists, feed_is_alive, feed_is_poisoned, FrameFeed};
pub use frame::Frame;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Number of frame slots in a feed's ring.
///
/// The writer publishes into slot `(frame_cnt + 1) % RING_DEPTH`, so a depth
/// of at least 2 is required for the next write to land in a slot distinct
/// from the newest published frame.
pub const RING_DEPTH: usize = 3;

const _: () = assert!(RING_DEPTH >= 2, "ring depth must be at least 2");

/// Directory holding feed anchor files. RAM-backed tmpfs, so segment I/O
/// never touches persistent storage.
pub const FEED_DIR: &str = "/dev/shm";

/// Prefix of every anchor filename under [`FEED_DIR`].
pub const FEED_PREFIX: &str = "buffer-";

/// Suffix appended to the anchor filename while a feed is being torn down.
///
/// The rename happens before the segment is unmapped so that no new `open`
/// can race with teardown. Feed names ending in this suffix are rejected by
/// validation, which is what makes the archived path unreachable through
/// the public API.
pub const ARCHIVE_SUFFIX: &str = "-archived";

/// Errors reported by feed operations.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Feed name is empty, contains `/`, or ends with [`ARCHIVE_SUFFIX`].
    #[error("invalid feed name {0:?}")]
    InvalidName(String),

    /// `create` found an anchor file already present for this name.
    #[error("feed {0:?} already exists; destroy it before reusing the name")]
    AlreadyExists(String),

    /// `open` found no anchor file for this name.
    #[error("feed {0:?} does not exist")]
    NotFound(String),

    /// Creating or sizing the anchor file failed.
    #[error("segment creation failed: {0}")]
    SegmentCreate(#[source] io::Error),

    /// Opening an existing anchor file failed.
    #[error("segment open failed: {0}")]
    SegmentOpen(#[source] io::Error),

    /// `mmap` failed.
    #[error("memory mapping failed: {0}")]
    Mmap(#[source] io::Error),

    /// The mapped file is not a valid feed segment (bad magic, unsupported
    /// version, or a length that does not match its own header).
    #[error("segment is truncated or not a frame feed")]
    Corruption,

    /// Frame dimensions passed to `publish` differ from the segment's.
    #[error("frame is {got_width}x{got_height}x{got_depth} but the feed holds {want_width}x{want_height}x{want_depth} frames")]
    SizeMismatch {
        got_width: u32,
        got_height: u32,
        got_depth: u32,
        want_width: u32,
        want_height: u32,
        want_depth: u32,
    },

    /// The feed has been (or is being) torn down.
    #[error("feed is no longer active")]
    NotActive,

    /// Non-blocking read found nothing newer than the caller's frame record.
    #[error("no new frame available")]
    NoNewFrame,

    /// The calling process may not destroy this feed: it is not the owner
    /// and the feed is not poisoned.
    #[error("process {pid} does not own this feed and the feed is not poisoned")]
    NotOwner { pid: i32 },
}

impl FeedError {
    /// Stable numeric status code for the frame access operations.
    ///
    /// `0` is the success path and never appears here. Failures outside the
    /// access protocol (lifecycle and OS errors) share code `4`.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::SizeMismatch { .. } => 1,
            Self::NotActive => 2,
            Self::NoNewFrame => 3,
            _ => 4,
        }
    }
}

/// Result type for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;

/// Resolve the anchor path for a feed name, rejecting names the filesystem
/// or the teardown protocol cannot represent.
///
/// `/` is the only byte a Linux filename component forbids; the archive
/// suffix is reserved so teardown renames can never collide with a live
/// feed.
pub(crate) fn anchor_path(name: &str) -> Result<PathBuf> {
    if name.is_empty() || name.contains('/') || name.ends_with(ARCHIVE_SUFFIX) {
        log::warn!("feed name {name:?} is empty, contains '/', or ends with the reserved {ARCHIVE_SUFFIX:?} suffix");
        return Err(FeedError::InvalidName(name.to_string()));
    }
    Ok(PathBuf::from(format!("{FEED_DIR}/{FEED_PREFIX}{name}")))
}
