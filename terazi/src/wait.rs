//! Futex-equivalent blocking on a 64-bit atomic.
//!
//! Linux futexes only watch 32 bits, so the "wait until this word changes"
//! primitive the acquire protocol needs is built on address-keyed parking
//! instead: a waiter parks on the word's address with a validation closure
//! that re-checks the value under the queue lock, which closes the race
//! against a concurrent wake.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot_core::{park, unpark_all, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

#[inline]
fn key(word: &AtomicU64) -> usize {
    word as *const AtomicU64 as usize
}

/// Blocks until `word` no longer holds `expected`.
///
/// May return spuriously; callers re-check and wait again.
pub(crate) fn wait(word: &AtomicU64, expected: u64) {
    unsafe {
        // If the value changed before we got parked, validate fails and we
        // return immediately.
        let _ = park(
            key(word),
            || word.load(Ordering::Relaxed) == expected,
            || {},
            |_, _| {},
            DEFAULT_PARK_TOKEN,
            None,
        );
    }
}

/// Wakes every thread parked on `word`.
pub(crate) fn wake_all(word: &AtomicU64) {
    unsafe {
        let _ = unpark_all(key(word), DEFAULT_UNPARK_TOKEN);
    }
}
