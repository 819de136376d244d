use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use terazi_dual::Dual;

struct Tracked {
    value: usize,
    drops: Arc<AtomicUsize>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn three_items_in_order() {
    let dual = Dual::new();
    let mut out = String::new();
    dual.push('a');
    dual.push('b');
    dual.push('c');
    for _ in 0..3 {
        out.push(dual.try_pop().unwrap());
    }
    assert_eq!(out, "abc");
    assert_eq!(dual.try_pop(), None);
}

#[test]
fn waiter_first_handoff_frees_the_waiter() {
    let drops = Arc::new(AtomicUsize::new(0));
    let dual = Arc::new(Dual::new());
    let (started, gate) = mpsc::channel();

    let consumer = {
        let dual = dual.clone();
        thread::spawn(move || {
            started.send(()).unwrap();
            dual.pop()
        })
    };
    gate.recv().unwrap();
    // Give the consumer a moment to actually park as a waiter.
    thread::sleep(Duration::from_millis(50));

    dual.push(Tracked {
        value: 9,
        drops: drops.clone(),
    });
    let got = consumer.join().unwrap();
    assert_eq!(got.value, 9);
    drop(got);
    assert_eq!(drops.load(Ordering::Relaxed), 1);

    // The waiter and item nodes are gone; the dual is empty again.
    assert!(dual.try_pop().is_none());
}

#[test]
fn try_push_matches_only_waiters() {
    let dual = Arc::new(Dual::new());

    // No waiter: the value comes straight back and nothing is enqueued.
    assert_eq!(dual.try_push(1), Err(1));
    assert_eq!(dual.try_pop(), None);

    let consumer = {
        let dual = dual.clone();
        thread::spawn(move || dual.pop())
    };
    // Retry until the consumer has parked.
    let mut value = 2;
    loop {
        match dual.try_push(value) {
            Ok(()) => break,
            Err(v) => {
                value = v;
                thread::yield_now();
            }
        }
    }
    assert_eq!(consumer.join().unwrap(), 2);
}

#[test]
fn producer_writes_are_visible_to_the_consumer() {
    struct Slot(UnsafeCell<u64>);
    unsafe impl Sync for Slot {}

    let slot = Arc::new(Slot(UnsafeCell::new(0)));
    let dual = Arc::new(Dual::new());

    let producer = {
        let slot = slot.clone();
        let dual = dual.clone();
        thread::spawn(move || {
            // Plain, non-atomic write: only the dual's release/acquire
            // pairing makes it visible.
            unsafe { *slot.0.get() = 0xFEED_FACE };
            dual.push(());
        })
    };

    dual.pop();
    assert_eq!(unsafe { *slot.0.get() }, 0xFEED_FACE);
    producer.join().unwrap();
}

#[test]
fn many_parked_waiters_all_resume() {
    const WAITERS: usize = 8;

    let dual = Arc::new(Dual::new());
    let mut consumers = Vec::new();
    for _ in 0..WAITERS {
        let dual = dual.clone();
        consumers.push(thread::spawn(move || dual.pop()));
    }
    thread::sleep(Duration::from_millis(50));
    for i in 0..WAITERS {
        dual.push(i);
    }
    let mut got: Vec<_> = consumers.into_iter().map(|c| c.join().unwrap()).collect();
    got.sort_unstable();
    assert_eq!(got, (0..WAITERS).collect::<Vec<_>>());
}

#[test]
fn dropping_a_loaded_dual_leaks_nothing() {
    let drops = Arc::new(AtomicUsize::new(0));
    {
        let dual = Dual::new();
        for value in 0..50 {
            dual.push(Tracked {
                value,
                drops: drops.clone(),
            });
        }
        for _ in 0..20 {
            dual.try_pop().unwrap();
        }
        assert_eq!(drops.load(Ordering::Relaxed), 20);
    }
    assert_eq!(drops.load(Ordering::Relaxed), 50);
}
