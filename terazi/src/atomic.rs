//! Atomic counted words and the weighted acquire protocol.

use core::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::Backoff;

use crate::counted::{Counted, MAX};
use crate::node::Node;
use crate::wait;

/// An atomic [`Counted`] word.
///
/// Besides the raw load/store/compare-exchange surface, this type carries
/// the weighted ownership protocol:
///
/// - [`acquire`](Self::acquire) transfers units of weight out of the word
///   and into the caller's custody, replenishing the local weight from the
///   node's global count whenever a decrement crosses a power-of-two
///   boundary, and parking the caller when the local weight is exhausted
///   (weight one cannot be decremented) until another thread replenishes
///   it.
/// - [`compare_acquire`](Self::compare_acquire) does the same but gives up
///   as soon as the pointer bits change.
///
/// Every mutation that displaces a word of weight one wakes the threads
/// parked on it, so an exhausted word never strands its waiters: either
/// the in-flight replenishment lands (and wakes them), or the word is
/// replaced wholesale by a container operation (which also wakes them).
pub struct AtomicCounted<T> {
    word: AtomicU64,
    _marker: PhantomData<*mut Node<T>>,
}

unsafe impl<T: Send> Send for AtomicCounted<T> {}
unsafe impl<T: Send> Sync for AtomicCounted<T> {}

impl<T> AtomicCounted<T> {
    /// Creates an atomic word holding `value`.
    #[inline]
    pub fn new(value: Counted<T>) -> Self {
        Self {
            word: AtomicU64::new(value.into_raw()),
            _marker: PhantomData,
        }
    }

    /// Creates an atomic word holding the null word.
    #[inline]
    pub fn null() -> Self {
        Self::new(Counted::null())
    }

    /// Loads the current word.
    #[inline]
    pub fn load(&self, order: Ordering) -> Counted<T> {
        Counted::from_raw(self.word.load(order))
    }

    /// Stores `value`.
    ///
    /// Only sound for unpublished words (a fresh node's link, a promise
    /// slot known to be null); a published word must be displaced with a
    /// compare-exchange so its weight is accounted for.
    #[inline]
    pub fn store(&self, value: Counted<T>, order: Ordering) {
        self.word.store(value.into_raw(), order);
    }

    /// Swaps in `value`, returning the displaced word.
    #[inline]
    pub fn swap(&self, value: Counted<T>, order: Ordering) -> Counted<T> {
        let prev = Counted::from_raw(self.word.swap(value.into_raw(), order));
        self.wake_if_exhausted(prev);
        prev
    }

    /// Single-shot compare-exchange.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Counted<T>,
        new: Counted<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Counted<T>, Counted<T>> {
        match self
            .word
            .compare_exchange(current.into_raw(), new.into_raw(), success, failure)
        {
            Ok(prev) => {
                let prev = Counted::from_raw(prev);
                self.wake_if_exhausted(prev);
                Ok(prev)
            }
            Err(actual) => Err(Counted::from_raw(actual)),
        }
    }

    /// Spurious-failure-tolerant compare-exchange.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: Counted<T>,
        new: Counted<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Counted<T>, Counted<T>> {
        match self
            .word
            .compare_exchange_weak(current.into_raw(), new.into_raw(), success, failure)
        {
            Ok(prev) => {
                let prev = Counted::from_raw(prev);
                self.wake_if_exhausted(prev);
                Ok(prev)
            }
            Err(actual) => Err(Counted::from_raw(actual)),
        }
    }

    // A displaced word of weight one may have acquirers parked on it.
    #[inline]
    fn wake_if_exhausted(&self, prev: Counted<T>) {
        if !prev.is_null() && prev.count() == 1 {
            wait::wake_all(&self.word);
        }
    }

    /// Acquires weight on the pointee, retrying across pointer changes.
    ///
    /// Returns the units of weight transferred into the caller's custody
    /// (to be released against the node named by `expected` once the
    /// caller is done), or zero if the word went null. After the call
    /// `expected` holds the value the word was observed to contain.
    pub fn acquire(&self, expected: &mut Counted<T>) -> u64 {
        let backoff = Backoff::new();
        loop {
            let n = self.try_acquire(expected);
            if n != 0 {
                return n;
            }
            if expected.is_null() {
                return 0;
            }
            backoff.spin();
        }
    }

    /// Acquires weight on the pointee, but only while the pointer bits
    /// still match `expected`'s.
    ///
    /// Returns zero (with `expected` updated to the current value) as soon
    /// as the word is null or names a different node.
    pub fn compare_acquire(&self, expected: &mut Counted<T>) -> u64 {
        let target = expected.ptr();
        let backoff = Backoff::new();
        while !expected.is_null() && expected.ptr() == target {
            let n = self.try_acquire(expected);
            if n != 0 {
                return n;
            }
            backoff.spin();
        }
        0
    }

    /// One attempt at taking weight out of the word.
    ///
    /// Returns the units acquired (usually one; more when this caller
    /// performed the replenishment), or zero on any legitimate failure
    /// with `expected` refreshed.
    pub fn try_acquire(&self, expected: &mut Counted<T>) -> u64 {
        if !expected.is_null() {
            if expected.count() > 1 {
                let desired = expected.sub(1);
                match self.compare_exchange_weak(
                    *expected,
                    desired,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        *expected = desired;
                        if desired.healthy() {
                            return 1;
                        }
                        return self.replenish(expected);
                    }
                    Err(actual) => {
                        *expected = actual;
                        return 0;
                    }
                }
            }
            // Exhausted: a unit cannot be taken out of a word of weight
            // one. Another thread is replenishing it; sleep until the word
            // changes rather than turning the caller into a spinlock.
            wait::wait(&self.word, expected.into_raw());
        }
        *expected = self.load(Ordering::Relaxed);
        0
    }

    // The local weight in `expected` just crossed a power-of-two boundary
    // (the caller already owns one unit from the decrement). Move MAX - 1
    // units from the node's global count into the word, restoring the
    // local weight to MAX in the same compare-exchange that publishes it.
    fn replenish(&self, expected: &mut Counted<T>) -> u64 {
        let node = expected.ptr();
        unsafe { Node::clone_weight(node, MAX - 1) };
        loop {
            let desired = expected.with_count(MAX);
            match self.compare_exchange_weak(
                *expected,
                desired,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // Custody: the fast-path unit, plus what we added
                    // globally, minus what the word absorbed.
                    let owed = expected.count();
                    *expected = desired;
                    return owed;
                }
                Err(actual) => {
                    if !actual.same_node(*expected) {
                        // The pointer moved under us; give back our global
                        // contribution plus the fast-path unit and report
                        // failure.
                        unsafe { Node::release(node, MAX) };
                        *expected = actual;
                        return 0;
                    }
                    *expected = actual;
                }
            }
        }
    }
}
