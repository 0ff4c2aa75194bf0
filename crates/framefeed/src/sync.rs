// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 framefeed contributors

//! Process-shared synchronization primitives backed by futex words.
//!
//! All three primitives are single `AtomicU32` words laid out `repr(C)` so
//! they can live inside the mapped segment and be operated on from any
//! process that maps it. The all-zero bit pattern is the unlocked/idle
//! state, which lets segment creation initialize them with plain zero fill.
//!
//! The condition variable is a sequence counter: waiters snapshot it while
//! holding the paired mutex, drop the mutex, and futex-wait on the snapshot.
//! A notifier that bumps the counter while holding the mutex can therefore
//! never slip between a waiter's decision to sleep and its actual sleep -
//! the futex wait refuses to park on a stale snapshot.

use crate::futex::{futex_wait, futex_wake, futex_wake_all};
use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Futex-based mutex valid across address spaces.
#[repr(C)]
pub(crate) struct ShmMutex {
    state: AtomicU32,
}

impl ShmMutex {
    /// Acquire the mutex, parking on the futex under contention.
    pub(crate) fn lock(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        // Mark contended so the holder knows somebody needs a wake.
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            futex_wait(&self.state, CONTENDED, None);
        }
    }

    /// Release the mutex, waking one parked waiter if there was contention.
    pub(crate) fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake(&self.state, 1);
        }
    }
}

/// Futex-based condition variable valid across address spaces.
#[repr(C)]
pub(crate) struct ShmCondvar {
    seq: AtomicU32,
}

impl ShmCondvar {
    /// Atomically release `mutex` and sleep until notified.
    ///
    /// Reacquires `mutex` before returning. Spurious returns are possible;
    /// callers re-check their predicate in a loop.
    pub(crate) fn wait(&self, mutex: &ShmMutex) {
        let snapshot = self.seq.load(Ordering::Acquire);
        mutex.unlock();
        futex_wait(&self.seq, snapshot, None);
        mutex.lock();
    }

    /// Wake every waiter.
    ///
    /// Callers hold the paired mutex while notifying; the sequence bump
    /// under the mutex is what closes the lost-wakeup window.
    pub(crate) fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake_all(&self.seq);
    }
}

const WRITER: u32 = 1 << 31;

/// Reader/writer lock valid across address spaces.
///
/// The word holds a reader count in the low bits and a writer flag in the
/// top bit. Readers only ever *try* to acquire (the feed protocol parks
/// them on the master condvar instead of here), so the futex is used
/// exclusively to park a writer waiting for readers to drain.
#[repr(C)]
pub(crate) struct ShmRwLock {
    state: AtomicU32,
}

impl ShmRwLock {
    /// Try to take a shared read lock. Fails if a writer holds the lock.
    pub(crate) fn try_read_lock(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & WRITER != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => state = current,
            }
        }
    }

    /// Release a shared read lock, waking a parked writer when the last
    /// reader leaves.
    pub(crate) fn read_unlock(&self) {
        if self.state.fetch_sub(1, Ordering::Release) == 1 {
            futex_wake_all(&self.state);
        }
    }

    /// Take the exclusive write lock, parking until all readers release.
    ///
    /// The release store in [`read_unlock`](Self::read_unlock) pairs with
    /// the acquire here, and the release in
    /// [`write_unlock`](Self::write_unlock) pairs with the acquire in
    /// [`try_read_lock`](Self::try_read_lock); that pair is what publishes
    /// pixel writes made under the write lock to subsequent readers.
    pub(crate) fn write_lock(&self) {
        loop {
            match self.state.compare_exchange(
                UNLOCKED,
                WRITER,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => {
                    futex_wait(&self.state, current, None);
                }
            }
        }
    }

    /// Release the exclusive write lock.
    pub(crate) fn write_unlock(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
        futex_wake_all(&self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    // The primitives are plain words, so tests can construct them directly
    // instead of going through a mapped segment.
    fn mutex() -> ShmMutex {
        ShmMutex {
            state: AtomicU32::new(0),
        }
    }

    fn condvar() -> ShmCondvar {
        ShmCondvar {
            seq: AtomicU32::new(0),
        }
    }

    fn rwlock() -> ShmRwLock {
        ShmRwLock {
            state: AtomicU32::new(0),
        }
    }

    #[test]
    fn test_mutex_excludes() {
        let m = Arc::new(mutex());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let m = Arc::clone(&m);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    m.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    m.unlock();
                }
            }));
        }
        for h in handles {
            h.join().expect("locker panicked");
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_condvar_wakes_waiter() {
        struct Shared {
            mutex: ShmMutex,
            cond: ShmCondvar,
            ready: AtomicU32,
        }
        let shared = Arc::new(Shared {
            mutex: mutex(),
            cond: condvar(),
            ready: AtomicU32::new(0),
        });

        let waiter = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                shared.mutex.lock();
                while shared.ready.load(Ordering::Acquire) == 0 {
                    shared.cond.wait(&shared.mutex);
                }
                shared.mutex.unlock();
            })
        };

        thread::sleep(Duration::from_millis(20));
        shared.mutex.lock();
        shared.ready.store(1, Ordering::Release);
        shared.cond.notify_all();
        shared.mutex.unlock();

        waiter.join().expect("waiter panicked");
    }

    #[test]
    fn test_rwlock_readers_share() {
        let l = rwlock();
        assert!(l.try_read_lock());
        assert!(l.try_read_lock());
        l.read_unlock();
        l.read_unlock();
    }

    #[test]
    fn test_rwlock_writer_excludes_readers() {
        let l = Arc::new(rwlock());
        l.write_lock();
        assert!(!l.try_read_lock());

        let l2 = Arc::clone(&l);
        let reader = thread::spawn(move || {
            while !l2.try_read_lock() {
                thread::yield_now();
            }
            l2.read_unlock();
        });

        thread::sleep(Duration::from_millis(10));
        l.write_unlock();
        reader.join().expect("reader panicked");
    }

    #[test]
    fn test_rwlock_writer_waits_for_readers() {
        let l = Arc::new(rwlock());
        assert!(l.try_read_lock());

        let l2 = Arc::clone(&l);
        let writer = thread::spawn(move || {
            l2.write_lock();
            l2.write_unlock();
        });

        thread::sleep(Duration::from_millis(20));
        l.read_unlock();
        writer.join().expect("writer panicked");
    }
}
