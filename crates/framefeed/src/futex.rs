// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 framefeed contributors

//! Thin wrappers over the Linux futex syscall.
//!
//! # SHARED vs PRIVATE
//!
//! Every lock in this crate lives inside an mmap'd segment visible to
//! several processes, so the wrappers use `FUTEX_WAIT` / `FUTEX_WAKE`, NOT
//! the `_PRIVATE` variants. The private opcodes key the wait queue on the
//! calling process's address space and silently fail to wake waiters in
//! other processes.

use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

const FUTEX_WAIT: i32 = 0; // not 128 (FUTEX_WAIT_PRIVATE)
const FUTEX_WAKE: i32 = 1; // not 129 (FUTEX_WAKE_PRIVATE)

/// Sleep until `addr` is woken or its value no longer equals `expected`.
///
/// Returns the raw syscall result: `0` on wake (including spurious wakes),
/// `-1` with `EAGAIN` if the value already differs, `-1` with `ETIMEDOUT`
/// when `timeout` expires. Callers re-check their predicate in a loop.
pub(crate) fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> i32 {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: addr outlives the call (we hold a reference) and the remaining
    // arguments match the FUTEX_WAIT calling convention.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake up to `count` waiters parked on `addr`. Returns the number woken.
pub(crate) fn futex_wake(addr: &AtomicU32, count: i32) -> i32 {
    // SAFETY: addr outlives the call; FUTEX_WAKE ignores the timeout and
    // secondary-address arguments.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake every waiter parked on `addr`.
#[inline]
pub(crate) fn futex_wake_all(addr: &AtomicU32) -> i32 {
    futex_wake(addr, i32::MAX)
}
