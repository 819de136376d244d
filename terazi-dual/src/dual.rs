use std::sync::atomic::Ordering;

use crossbeam_utils::Backoff;

use terazi::{AtomicCounted, CacheAligned, Counted, Node, MAX, TAG};

use crate::signal::Signal;

// A node carries either a queued item (its link words are untagged) or a
// parked waiter (its link words carry a non-zero tag: a saturating depth
// counter). The roles never mix in one reachable list.
enum Entry<T> {
    Item(T),
    Waiter(Promise<T>),
}

// The slot a producer fulfills for a parked consumer: a counted word
// naming the item node, plus the wakeup for the owning thread.
struct Promise<T> {
    slot: AtomicCounted<Entry<T>>,
    signal: Signal,
}

enum TailStep<T> {
    Appended,
    NoWaiter,
    Matched {
        waiter: *mut Node<Entry<T>>,
        held: u64,
    },
}

enum HeadStep<T> {
    Claimed(T),
    Parked,
    Empty,
}

/// A lock-free dual queue/stack.
///
/// The list between `head` and `tail` is empty, a FIFO of items, or a LIFO
/// of waiters. Producers and consumers race on the sentinel's link; the
/// side whose compare-exchange lands first wins, and the loser retries on
/// the state it finds.
///
/// # Weight ledger
///
/// An enqueued item node is born with weight `2·MAX`: `MAX − 1` goes into
/// the link word that publishes it, `MAX − 1` plus one swinger unit are
/// claimed when `tail` swings onto it, and the final unit is awarded to
/// the consumer that swings `head` onto it (the head word itself inherits
/// the link word's claim). A waiter node is born with `MAX + 1`: `MAX` in
/// its published word, one unit retained by the parked thread. The
/// sentinel's `2·MAX` is exactly the head and tail words.
pub struct Dual<T> {
    head: CacheAligned<AtomicCounted<Entry<T>>>,
    tail: CacheAligned<AtomicCounted<Entry<T>>>,
}

unsafe impl<T: Send> Send for Dual<T> {}
unsafe impl<T: Send> Sync for Dual<T> {}

impl<T> Default for Dual<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dual<T> {
    /// Creates an empty dual.
    pub fn new() -> Self {
        let sentinel = Node::alloc(None, 2 * MAX);
        let word = Counted::new(MAX, sentinel, 0);
        Self {
            head: CacheAligned::new(AtomicCounted::new(word)),
            tail: CacheAligned::new(AtomicCounted::new(word)),
        }
    }

    /// Hands `value` to the youngest waiter, or appends it to the FIFO.
    pub fn push(&self, value: T) {
        let node = Node::alloc(Some(Entry::Item(value)), 2 * MAX);
        let link = Counted::new(MAX - 1, node, 0);
        match self.match_at_tail(Some(link)) {
            TailStep::Appended => {}
            TailStep::Matched { waiter, held } => unsafe {
                // The node never entered the list: shed the link and swing
                // budgets and hand the remaining MAX through the promise.
                Node::release(node, MAX);
                fulfill(waiter, held, node);
            },
            TailStep::NoWaiter => unreachable!("an append never reports emptiness"),
        }
    }

    /// Hands `value` to a waiter if one is parked; never enqueues.
    ///
    /// Returns the value back when no waiter was present.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        match self.match_at_tail(None) {
            TailStep::NoWaiter => Err(value),
            TailStep::Matched { waiter, held } => unsafe {
                let node = Node::alloc(Some(Entry::Item(value)), MAX);
                fulfill(waiter, held, node);
                Ok(())
            },
            TailStep::Appended => unreachable!("nothing was offered for appending"),
        }
    }

    /// Claims the oldest item, or `None` when the FIFO is empty.
    ///
    /// Never publishes a waiter.
    pub fn try_pop(&self) -> Option<T> {
        match self.claim_at_head(None) {
            HeadStep::Claimed(value) => Some(value),
            HeadStep::Empty => None,
            HeadStep::Parked => unreachable!("nothing was offered for parking"),
        }
    }

    /// Claims the oldest item, or parks the calling thread as the youngest
    /// waiter until a producer fulfills it.
    pub fn pop(&self) -> T {
        let node = Node::alloc(
            Some(Entry::Waiter(Promise {
                slot: AtomicCounted::null(),
                signal: Signal::new(),
            })),
            MAX + 1,
        );
        match self.claim_at_head(Some(node)) {
            HeadStep::Claimed(value) => {
                // The waiter never entered the list.
                unsafe { Node::release(node, MAX + 1) };
                value
            }
            HeadStep::Parked => unsafe {
                let word = {
                    let promise = match Node::peek(node) {
                        Some(Entry::Waiter(promise)) => promise,
                        _ => unreachable!("tagged dual nodes always carry waiters"),
                    };
                    promise.signal.wait();
                    promise.slot.load(Ordering::Acquire)
                };
                debug_assert!(!word.is_null());
                let item = word.ptr();
                let value = match Node::take(item) {
                    Some(Entry::Item(value)) => value,
                    _ => unreachable!("promise slots are fulfilled with items"),
                };
                Node::release(item, word.count());
                Node::release(node, 1);
                value
            },
            HeadStep::Empty => unreachable!("a waiter was offered"),
        }
    }

    // The unified tail routine. Classifies the successor of the tail node:
    // null means append `install` (or report NoWaiter), an untagged word
    // means the tail is stale and gets swung forward, a tagged word is the
    // youngest waiter and gets spliced out for the caller to fulfill.
    fn match_at_tail(&self, install: Option<Counted<Entry<T>>>) -> TailStep<T> {
        let backoff = Backoff::new();
        'restart: loop {
            let mut a = self.tail.load(Ordering::Relaxed);
            let mut held = self.tail.acquire(&mut a);
            debug_assert!(held > 0);
            let mut t = a.ptr();
            loop {
                let c = unsafe { (*t).next().load(Ordering::Acquire) };
                if c.is_null() {
                    let Some(link) = install else {
                        unsafe { Node::release(t, held) };
                        return TailStep::NoWaiter;
                    };
                    let installed = unsafe {
                        (*t).next()
                            .compare_exchange(c, link, Ordering::Release, Ordering::Acquire)
                    };
                    match installed {
                        Ok(_) => {
                            unsafe { Node::release(t, held) };
                            return TailStep::Appended;
                        }
                        Err(_) => continue,
                    }
                } else if c.tag() == 0 {
                    // The FIFO grew past this node; swing the stale tail.
                    let mut b = a;
                    loop {
                        match self.tail.compare_exchange_weak(
                            b,
                            c,
                            Ordering::Release,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => {
                                unsafe { Node::release(t, b.count() + held) };
                                // One unit of the new tail's birth weight
                                // is awarded to the swinger.
                                a = c;
                                t = c.ptr();
                                held = 1;
                                break;
                            }
                            Err(actual) => {
                                if actual.same_link(b) {
                                    b = actual;
                                    backoff.spin();
                                } else {
                                    // Somebody else swung it first.
                                    unsafe { Node::release(t, held) };
                                    continue 'restart;
                                }
                            }
                        }
                    }
                } else {
                    // A waiter: acquire a unit of it, then splice it out
                    // by rerouting the link to its successor.
                    let mut current = c;
                    let taken = unsafe { (*t).next().compare_acquire(&mut current) };
                    if taken == 0 {
                        continue;
                    }
                    let waiter = c.ptr();
                    let after = unsafe { (*waiter).next().load(Ordering::Acquire) };
                    let mut d = current;
                    loop {
                        let spliced = unsafe {
                            (*t).next().compare_exchange_weak(
                                d,
                                after,
                                Ordering::Release,
                                Ordering::Acquire,
                            )
                        };
                        match spliced {
                            Ok(_) => {
                                unsafe { Node::release(t, held) };
                                return TailStep::Matched {
                                    waiter,
                                    held: d.count() + taken,
                                };
                            }
                            Err(actual) => {
                                if actual.same_link(d) {
                                    d = actual;
                                    backoff.spin();
                                } else {
                                    // Another producer captured this
                                    // waiter; put our unit back.
                                    unsafe { Node::release(waiter, taken) };
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    // The unified head routine. An untagged successor is the oldest item
    // and is claimed by advancing `head` onto it; otherwise the list is
    // empty or already a waiter stack, and `waiter` (if offered) is linked
    // in with a saturating depth tag.
    fn claim_at_head(&self, waiter: Option<*mut Node<Entry<T>>>) -> HeadStep<T> {
        let backoff = Backoff::new();
        'restart: loop {
            let mut a = self.head.load(Ordering::Relaxed);
            let held = self.head.acquire(&mut a);
            debug_assert!(held > 0);
            let h = a.ptr();
            loop {
                let c = unsafe { (*h).next().load(Ordering::Acquire) };
                if !c.is_null() && c.tag() == 0 {
                    let mut b = a;
                    loop {
                        match self.head.compare_exchange_weak(
                            b,
                            c,
                            Ordering::Release,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => {
                                unsafe { Node::release(h, b.count() + held) };
                                let node = c.ptr();
                                // Award unit: this thread alone claims the
                                // new head node's payload.
                                let value = match unsafe { Node::take(node) } {
                                    Some(Entry::Item(value)) => value,
                                    _ => unreachable!("untagged dual nodes always carry items"),
                                };
                                unsafe { Node::release(node, 1) };
                                return HeadStep::Claimed(value);
                            }
                            Err(actual) => {
                                if actual.same_link(b) {
                                    b = actual;
                                    backoff.spin();
                                } else {
                                    unsafe { Node::release(h, held) };
                                    continue 'restart;
                                }
                            }
                        }
                    }
                } else {
                    let Some(p) = waiter else {
                        unsafe { Node::release(h, held) };
                        return HeadStep::Empty;
                    };
                    let depth = if c.is_null() { 0 } else { c.tag() };
                    let tag = (depth + 1).min(TAG);
                    unsafe { (*p).next().store(c, Ordering::Relaxed) };
                    let word = Counted::new(MAX, p, tag);
                    let linked = unsafe {
                        (*h).next()
                            .compare_exchange(c, word, Ordering::Release, Ordering::Acquire)
                    };
                    match linked {
                        Ok(_) => {
                            unsafe { Node::release(h, held) };
                            return HeadStep::Parked;
                        }
                        Err(_) => continue,
                    }
                }
            }
        }
    }
}

// Publish `item` into the promise slot of `waiter` and wake its owner.
// `held` is the weight the splicer captured; the waiter's own retained
// unit keeps the node alive until it has read the slot.
unsafe fn fulfill<T>(waiter: *mut Node<Entry<T>>, held: u64, item: *mut Node<Entry<T>>) {
    let word = Counted::new(MAX, item, 0);
    match Node::peek(waiter) {
        Some(Entry::Waiter(promise)) => {
            promise.slot.store(word, Ordering::Release);
            promise.signal.notify();
        }
        _ => unreachable!("tagged dual nodes always carry waiters"),
    }
    Node::release(waiter, held);
}

impl<T> Drop for Dual<T> {
    fn drop(&mut self) {
        unsafe {
            let h = self.head.load(Ordering::Relaxed);
            let t = self.tail.load(Ordering::Relaxed);
            let hp = h.ptr();
            let tp = t.ptr();

            // The tail lags behind the head when the last claimed item sat
            // past it; find out which regime we are in.
            let mut on_chain = false;
            let mut x = hp;
            loop {
                if x == tp {
                    on_chain = true;
                    break;
                }
                let next = (*x).next().load(Ordering::Relaxed);
                if next.is_null() {
                    break;
                }
                x = next.ptr();
            }

            if !on_chain {
                // Walk the lagging tail up to the head node, releasing the
                // tail word and then the unspent tail budget of each
                // already consumed node in between.
                let mut cur = tp;
                let mut amount = t.count();
                while cur != hp {
                    let next = (*cur).next().load(Ordering::Relaxed);
                    Node::release(cur, amount);
                    cur = next.ptr();
                    amount = MAX;
                }
            }

            // Walk forward from the head node, releasing every claim the
            // structure still holds; payloads still in flight drop with
            // their nodes. Everything past the tail node still carries its
            // unspent swing budget; when the tail sits on the head node
            // (or lags behind it), that covers the whole chain.
            let mut past_tail = !on_chain || hp == tp;
            let mut cur = hp;
            let mut amount = h.count()
                + if hp == tp { t.count() } else { 0 }
                + if !on_chain { MAX } else { 0 };
            loop {
                let next = (*cur).next().load(Ordering::Relaxed);
                Node::release(cur, amount);
                if next.is_null() {
                    break;
                }
                let node = next.ptr();
                amount = next.count();
                if next.tag() == 0 {
                    // An unclaimed item: its head award was never spent,
                    // and past the tail its swing budget was not either.
                    amount += 1;
                    if past_tail {
                        amount += MAX;
                    } else if node == tp {
                        amount += t.count();
                        past_tail = true;
                    }
                }
                cur = node;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_round_trips() {
        let dual = Dual::new();
        dual.push(7);
        assert_eq!(dual.try_pop(), Some(7));
        assert_eq!(dual.try_pop(), None);
    }

    #[test]
    fn fifo_order_single_thread() {
        let dual = Dual::new();
        for i in 0..100 {
            dual.push(i);
        }
        for i in 0..100 {
            assert_eq!(dual.try_pop(), Some(i));
        }
        assert_eq!(dual.try_pop(), None);
    }

    #[test]
    fn try_push_needs_a_waiter() {
        let dual = Dual::new();
        assert_eq!(dual.try_push(1), Err(1));
        dual.push(2);
        // A queued item is not a waiter.
        assert_eq!(dual.try_push(3), Err(3));
        assert_eq!(dual.try_pop(), Some(2));
    }

    #[test]
    fn drop_frees_a_half_consumed_queue() {
        let dual = Dual::new();
        for i in 0..5 {
            dual.push(i);
        }
        assert_eq!(dual.try_pop(), Some(0));
        assert_eq!(dual.try_pop(), Some(1));
        // The rest is reclaimed by the destructor walk.
    }

    #[test]
    fn drop_handles_a_lagging_tail() {
        let dual = Dual::new();
        dual.push(1);
        dual.push(2);
        assert_eq!(dual.try_pop(), Some(1));
        assert_eq!(dual.try_pop(), Some(2));
        // Head has moved past the node the tail still points at.
    }
}
