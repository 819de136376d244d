use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, Thread};

/// One-shot wakeup channel between a parked waiter and the producer that
/// fulfills it.
pub(crate) struct Signal {
    state: AtomicUsize,
    thread: Thread,
}

impl Signal {
    /// Creates a signal owned by the current thread.
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
            thread: thread::current(),
        }
    }

    /// Parks until notified. Must be called from the owning thread.
    pub(crate) fn wait(&self) {
        while self.state.load(Ordering::Acquire) == 0 {
            thread::park();
        }
    }

    /// Notifies the owning thread, waking it if parked.
    pub(crate) fn notify(&self) {
        self.state.store(1, Ordering::Release);
        self.thread.unpark();
    }
}
