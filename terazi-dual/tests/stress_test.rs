use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use rand::Rng;

use terazi_dual::Dual;

struct Tracked {
    drops: Arc<AtomicUsize>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn paired_producers_and_consumers_exchange_everything() {
    const PAIRS: usize = 2;
    const PER_PAIR: usize = 100_000;

    let drops = Arc::new(AtomicUsize::new(0));
    let executed = Arc::new(AtomicUsize::new(0));
    {
        let dual = Arc::new(Dual::new());
        let mut handles = Vec::new();
        for _ in 0..PAIRS {
            let dual_producer = dual.clone();
            let drops = drops.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..PER_PAIR {
                    dual_producer.push(Tracked {
                        drops: drops.clone(),
                    });
                }
            }));
            let dual_consumer = dual.clone();
            let executed = executed.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..PER_PAIR {
                    let item = dual_consumer.pop();
                    executed.fetch_add(1, Ordering::Relaxed);
                    drop(item);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(executed.load(Ordering::Relaxed), PAIRS * PER_PAIR);
        assert!(dual.try_pop().is_none());
    }
    // Every payload allocated was dropped exactly once.
    assert_eq!(drops.load(Ordering::Relaxed), PAIRS * PER_PAIR);
}

#[test]
#[cfg_attr(miri, ignore)]
fn randomized_mixed_operations_balance() {
    const THREADS: usize = 6;
    const OPS: usize = 50_000;

    let drops = Arc::new(AtomicUsize::new(0));
    let pushed = Arc::new(AtomicUsize::new(0));
    let popped = Arc::new(AtomicUsize::new(0));
    {
        let dual = Arc::new(Dual::new());
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let dual = dual.clone();
            let drops = drops.clone();
            let pushed = pushed.clone();
            let popped = popped.clone();
            handles.push(thread::spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..OPS {
                    if rng.random_bool(0.5) {
                        dual.push(Tracked {
                            drops: drops.clone(),
                        });
                        pushed.fetch_add(1, Ordering::Relaxed);
                    } else if dual.try_pop().is_some() {
                        popped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Whatever was not popped is reclaimed by the destructor.
    }
    assert!(popped.load(Ordering::Relaxed) <= pushed.load(Ordering::Relaxed));
    assert_eq!(drops.load(Ordering::Relaxed), pushed.load(Ordering::Relaxed));
}

#[test]
#[cfg_attr(miri, ignore)]
fn single_producer_order_is_preserved() {
    const ITEMS: usize = 100_000;

    let dual = Arc::new(Dual::new());
    let consumer = {
        let dual = dual.clone();
        thread::spawn(move || {
            for expected in 0..ITEMS {
                assert_eq!(dual.pop(), expected);
            }
        })
    };
    for i in 0..ITEMS {
        dual.push(i);
    }
    consumer.join().unwrap();
}
