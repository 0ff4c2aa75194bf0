// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 framefeed contributors

//! The feed handle: lifecycle, publication, and the reader wait/wake core.
//!
//! # Publication
//!
//! The owner writes into slot `(frame_cnt + 1) % RING_DEPTH` under that
//! slot's write lock, bumps `frame_cnt`, stamps the slot descriptor, and
//! broadcasts on the master condvar. The broadcast happens under the master
//! mutex so a reader deciding to sleep can never miss it.
//!
//! # Reading
//!
//! A reader targets the oldest still-live publication newer than what its
//! frame record last saw:
//!
//! ```text
//! target_uid = last + 1                          before the ring wraps
//! target_uid = max(last + 1, newest - N + 1)     after it wraps
//! ```
//!
//! The second form is the catch-up rule: a consumer that fell more than
//! `N - 1` publications behind jumps forward to the oldest slot that cannot
//! have been recycled, dropping the frames in between instead of chasing
//! them. Slot read locks are only ever *tried*; on contention the reader
//! parks on the master condvar, which both publish and teardown broadcast.

use crate::frame::Frame;
use crate::layout::{self, SegmentHeader, MAGIC, VERSION};
use crate::segment::{self, SegmentMap};
use crate::{anchor_path, FeedError, Result, ARCHIVE_SUFFIX, RING_DEPTH};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// How long teardown waits for in-flight slot copies to finish before
/// unmapping anyway.
const DRAIN_PATIENCE: Duration = Duration::from_secs(1);
const DRAIN_POLL: Duration = Duration::from_millis(1);

/// Per-process handle to a shared frame feed.
///
/// Handles are not unique: any number of them, in one process or many, may
/// reference the same segment. The process that called [`create`] is the
/// feed's owner; only it publishes, and only it (or anyone, once the feed
/// is poisoned) may [`destroy`].
///
/// Dropping a handle releases the mapping, nothing more - equivalent to
/// [`close`] without the owner guard.
///
/// [`create`]: FrameFeed::create
/// [`close`]: FrameFeed::close
/// [`destroy`]: FrameFeed::destroy
pub struct FrameFeed {
    path: PathBuf,
    map: SegmentMap,
}

impl FrameFeed {
    /// Create a new feed of `width` x `height` frames at `depth` bytes per
    /// pixel, owned by the calling process.
    ///
    /// Fails if a feed of the same name already exists.
    pub fn create(name: &str, width: u32, height: u32, depth: u32) -> Result<Self> {
        let path = anchor_path(name)?;
        let len = layout::segment_size(width, height, depth);

        let map = match SegmentMap::create(&path, len) {
            Ok(map) => map,
            Err(FeedError::SegmentCreate(e))
                if e.raw_os_error() == Some(libc::EEXIST) =>
            {
                log::warn!(
                    "feed {name:?} already exists at {}; destroy it before reusing the name",
                    path.display()
                );
                return Err(FeedError::AlreadyExists(name.to_string()));
            }
            Err(e) => return Err(e),
        };

        let header = map.as_ptr() as *mut SegmentHeader;
        // SAFETY: the mapping is at least segment_size() long and zero
        // filled; nobody else has validated the magic yet, so we are the
        // only accessor. The plain fields are written before the magic
        // release-store that publishes them.
        unsafe {
            ptr::addr_of_mut!((*header).version).write(VERSION);
            ptr::addr_of_mut!((*header).width).write(width);
            ptr::addr_of_mut!((*header).height).write(height);
            ptr::addr_of_mut!((*header).depth).write(depth);
            ptr::addr_of_mut!((*header).owner_pid).write(libc::getpid());
        }
        let feed = Self { path, map };
        feed.header().is_alive.store(1, Ordering::Release);
        feed.header().magic.store(MAGIC, Ordering::Release);

        log::debug!(
            "created feed {name:?} ({width}x{height}x{depth}, {len} bytes) at {}",
            feed.path.display()
        );
        Ok(feed)
    }

    /// Open an existing feed by name.
    ///
    /// The mapping is read/write even for consumers: taking the in-segment
    /// locks mutates their futex words.
    pub fn open(name: &str) -> Result<Self> {
        let path = anchor_path(name)?;
        let map = match SegmentMap::open(&path) {
            Ok(map) => map,
            Err(FeedError::NotFound(_)) => {
                return Err(FeedError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e),
        };

        if map.len() < std::mem::size_of::<SegmentHeader>() {
            return Err(FeedError::Corruption);
        }
        let feed = Self { path, map };
        if !feed.header().validate() || feed.map.len() != feed.header().segment_size() {
            return Err(FeedError::Corruption);
        }
        Ok(feed)
    }

    #[inline]
    fn header(&self) -> &SegmentHeader {
        // SAFETY: create/open established that the mapping holds a valid
        // SegmentHeader at offset 0 for at least the mapping's lifetime;
        // all mutable fields are atomics or futex words.
        unsafe { &*(self.map.as_ptr() as *const SegmentHeader) }
    }

    /// Base address of slot `index`'s image.
    #[inline]
    fn slot_pixels(&self, index: usize) -> *mut u8 {
        let header = self.header();
        let offset = layout::pixels_offset(header.width, header.height, header.depth, index);
        // SAFETY: offset + image_size <= segment_size, which open/create
        // verified equals the mapping length.
        unsafe { self.map.as_ptr().add(offset) }
    }

    /// Publish one frame. Owner only.
    ///
    /// `pixels` must hold exactly `width * height * depth` bytes, and the
    /// dimensions must equal the feed's. Blocks while readers still hold
    /// the target slot (the ring's only back-pressure), then copies the
    /// image, commits the new uid, and wakes every blocked reader.
    ///
    /// Returns the uid assigned to this publication.
    pub fn publish(
        &self,
        width: u32,
        height: u32,
        depth: u32,
        acquisition_time: u64,
        pixels: &[u8],
    ) -> Result<u64> {
        let header = self.header();

        if width != header.width
            || height != header.height
            || depth != header.depth
            || pixels.len() != header.image_size()
        {
            log::warn!(
                "rejecting {width}x{height}x{depth} frame ({} bytes): feed at {} holds {}x{}x{} frames",
                pixels.len(),
                self.path.display(),
                header.width,
                header.height,
                header.depth,
            );
            return Err(FeedError::SizeMismatch {
                got_width: width,
                got_height: height,
                got_depth: depth,
                want_width: header.width,
                want_height: header.height,
                want_depth: header.depth,
            });
        }
        if !header.alive() {
            return Err(FeedError::NotActive);
        }

        // The slot that will become the newest once the counter advances.
        let target = ((header.frame_cnt.load(Ordering::Acquire) + 1) % RING_DEPTH as u64) as usize;
        let slot = &header.slots[target];

        slot.lock.write_lock();
        // SAFETY: pixels is image_size() bytes (checked above) and the
        // destination is slot `target`'s image area; the write lock
        // excludes every reader of this slot.
        unsafe {
            ptr::copy_nonoverlapping(pixels.as_ptr(), self.slot_pixels(target), pixels.len());
        }
        let uid = header.frame_cnt.fetch_add(1, Ordering::AcqRel) + 1;
        slot.acquisition_time.store(acquisition_time, Ordering::Release);
        slot.frame_uid.store(uid, Ordering::Release);
        slot.lock.write_unlock();

        // Broadcast under the master mutex: a reader that saw no new frame
        // and is about to sleep holds the mutex until its condvar snapshot
        // is taken, so this wake cannot fall between its check and its
        // sleep.
        header.lock.lock();
        header.cond.notify_all();
        header.lock.unlock();

        Ok(uid)
    }

    /// Read the oldest publication newer than `frame`'s current uid.
    ///
    /// With `blocking` set, waits until a newer frame is published (or the
    /// feed dies); otherwise fails with [`FeedError::NoNewFrame`]. On
    /// success the record holds the copied image, its uid, and its
    /// acquisition time; uids observed through one record are strictly
    /// increasing.
    pub fn read(&self, frame: &mut Frame, blocking: bool) -> Result<()> {
        let header = self.header();
        header.lock.lock();

        // Inside the lock so dimensions and buffer stay consistent, but
        // before any pixel I/O.
        frame.conform(header.width, header.height, header.depth);

        if !header.alive() {
            header.lock.unlock();
            return Err(FeedError::NotActive);
        }

        let last = frame.frame_uid();
        let mut newest = header.frame_cnt.load(Ordering::Acquire);

        if newest == last {
            if !blocking {
                header.lock.unlock();
                return Err(FeedError::NoNewFrame);
            }
            while newest == last {
                header.cond.wait(&header.lock);
                if !header.alive() {
                    header.lock.unlock();
                    return Err(FeedError::NotActive);
                }
                newest = header.frame_cnt.load(Ordering::Acquire);
            }
        }

        // Catch-up rule: before the ring wraps every publication is still
        // live; afterwards the oldest survivor is newest - N + 1.
        let target_uid = if newest < RING_DEPTH as u64 {
            last + 1
        } else {
            (last + 1).max(newest - RING_DEPTH as u64 + 1)
        };
        let slot = &header.slots[(target_uid % RING_DEPTH as u64) as usize];

        // Never block on the slot lock itself: park on the master condvar,
        // which the writer broadcasts after releasing the write lock.
        while !slot.lock.try_read_lock() {
            header.cond.wait(&header.lock);
            if !header.alive() {
                header.lock.unlock();
                return Err(FeedError::NotActive);
            }
        }
        header.active_readers.fetch_add(1, Ordering::AcqRel);
        header.lock.unlock();

        let uid = slot.frame_uid.load(Ordering::Acquire);
        let acquisition_time = slot.acquisition_time.load(Ordering::Acquire);
        let image = header.image_size();
        let index = (target_uid % RING_DEPTH as u64) as usize;
        // SAFETY: frame.conform sized the buffer to image_size(); the slot
        // read lock excludes the writer from this slot's image area.
        unsafe {
            ptr::copy_nonoverlapping(
                self.slot_pixels(index) as *const u8,
                frame.pixels_mut().as_mut_ptr(),
                image,
            );
        }
        frame.record_publication(uid, acquisition_time);

        slot.lock.read_unlock();
        header.active_readers.fetch_sub(1, Ordering::Release);
        Ok(())
    }

    /// True until teardown begins.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.header().alive()
    }

    /// True if the owner process is gone but the feed was never destroyed.
    ///
    /// Liveness is probed with `kill(owner_pid, 0)`, so PID reuse can mask
    /// a dead owner; the owner model accepts that risk.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        let header = self.header();
        // SAFETY: signal 0 performs the existence check without delivering
        // anything.
        let rc = unsafe { libc::kill(header.owner_pid, 0) };
        // EPERM still means the PID is running, just under another user;
        // only ESRCH reports a dead owner.
        let owner_alive = rc == 0
            || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
        let poisoned = !owner_alive && header.alive();
        if poisoned {
            log::warn!(
                "feed at {} is poisoned: owner {} is no longer running",
                self.path.display(),
                header.owner_pid
            );
        }
        poisoned
    }

    /// True if the calling process created this feed.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        // SAFETY: getpid cannot fail.
        self.header().owner_pid == unsafe { libc::getpid() }
    }

    /// PID recorded as the feed's owner at creation.
    #[must_use]
    pub fn owner_pid(&self) -> i32 {
        self.header().owner_pid
    }

    /// Frame width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.header().width
    }

    /// Frame height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.header().height
    }

    /// Bytes per pixel.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.header().depth
    }

    /// Bytes of one image in this feed.
    #[must_use]
    pub fn image_size(&self) -> usize {
        self.header().image_size()
    }

    /// Number of publications so far.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.header().frame_cnt.load(Ordering::Acquire)
    }

    /// Anchor file backing this feed.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release this handle. Consumers only.
    ///
    /// Refused for every handle held by the owner process, whose exit path
    /// is [`destroy`]: an owner that merely closed would leave consumers a
    /// live-looking but abandoned feed. On refusal the handle is returned
    /// unchanged.
    ///
    /// [`destroy`]: FrameFeed::destroy
    pub fn close(self) -> std::result::Result<(), Self> {
        if self.is_owner() {
            log::warn!(
                "process {} owns the feed at {}; call destroy instead of close",
                self.owner_pid(),
                self.path.display()
            );
            return Err(self);
        }
        Ok(())
    }

    /// Tear the feed down and remove its anchor.
    ///
    /// Allowed for the owner, or for anyone once the feed is poisoned.
    /// Marks the feed dead, renames the anchor to its archived name so no
    /// new `open` can begin, wakes every blocked reader (they observe
    /// [`FeedError::NotActive`]), waits briefly for in-flight slot copies
    /// to drain, then unmaps and unlinks. OS failures along the way are
    /// logged and teardown continues best-effort.
    pub fn destroy(self) -> Result<()> {
        // SAFETY: getpid cannot fail.
        let pid = unsafe { libc::getpid() };
        if !self.is_owner() && !self.is_poisoned() {
            log::warn!(
                "process {pid} cannot destroy the healthy feed at {} owned by {}",
                self.path.display(),
                self.owner_pid()
            );
            return Err(FeedError::NotOwner { pid });
        }

        // Either we are the owner or the owner is dead, so no publish can
        // race with teardown.
        let header = self.header();
        header.is_alive.store(0, Ordering::Release);

        header.lock.lock();
        let archived = archived_path(&self.path);
        let renamed = segment::archive_anchor(&self.path, &archived);
        header.cond.notify_all();
        header.lock.unlock();

        self.drain_readers();

        let Self { path, map } = self;
        drop(map);
        segment::unlink_anchor(if renamed { &archived } else { &path });
        log::debug!("destroyed feed at {}", path.display());
        Ok(())
    }

    /// Wait for readers mid-copy to release their slot locks before the
    /// mapping disappears underneath them. Bounded; a reader stuck longer
    /// than [`DRAIN_PATIENCE`] is abandoned with a warning.
    fn drain_readers(&self) {
        let header = self.header();
        let mut waited = Duration::ZERO;
        while header.active_readers.load(Ordering::Acquire) != 0 {
            if waited >= DRAIN_PATIENCE {
                log::warn!(
                    "unmapping feed at {} with {} reader(s) still copying",
                    self.path.display(),
                    header.active_readers.load(Ordering::Acquire)
                );
                return;
            }
            std::thread::sleep(DRAIN_POLL);
            waited += DRAIN_POLL;
        }
    }
}

fn archived_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}{ARCHIVE_SUFFIX}", path.display()))
}

/// True if an anchor file for `name` currently exists.
#[must_use]
pub fn feed_exists(name: &str) -> bool {
    anchor_path(name).map(|p| p.exists()).unwrap_or(false)
}

/// Open the named feed, report whether it is still alive, and release the
/// probe handle.
pub fn feed_is_alive(name: &str) -> Result<bool> {
    let feed = FrameFeed::open(name)?;
    Ok(feed.is_alive())
}

/// Open the named feed, report whether it is poisoned, and release the
/// probe handle.
pub fn feed_is_poisoned(name: &str) -> Result<bool> {
    let feed = FrameFeed::open(name)?;
    Ok(feed.is_poisoned())
}
