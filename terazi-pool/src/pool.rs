//! A fixed set of worker threads draining the dual.

use std::cell::RefCell;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use terazi::List;
use terazi_dual::Dual;

use crate::task::Task;

struct Inner {
    dual: Dual<Task>,
    cancelled: AtomicBool,
    workers: usize,
}

// The deferred-continuation buffer of the worker running on this thread,
// keyed by its pool so tasks crossing pools cannot smuggle continuations
// into the wrong one.
struct WorkerState {
    owner: usize,
    buffer: Vec<Task>,
}

thread_local! {
    static CURRENT: RefCell<Option<WorkerState>> = const { RefCell::new(None) };
}

/// Configures and spawns a [`Pool`].
pub struct Builder {
    workers: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// A builder defaulting to one worker per hardware thread.
    pub fn new() -> Self {
        Self {
            workers: num_cpus::get(),
        }
    }

    /// Sets the number of worker threads.
    pub fn workers(mut self, workers: usize) -> Self {
        assert!(workers > 0, "a pool needs at least one worker");
        self.workers = workers;
        self
    }

    /// Spawns the workers and returns the pool.
    pub fn build(self) -> Pool {
        let inner = Arc::new(Inner {
            dual: Dual::new(),
            cancelled: AtomicBool::new(false),
            workers: self.workers,
        });
        let threads = (0..self.workers)
            .map(|i| {
                let inner = inner.clone();
                thread::Builder::new()
                    .name(format!("terazi-worker-{i}"))
                    .spawn(move || worker(inner))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Pool { inner, threads }
    }
}

/// A worker pool over a lock-free [`Dual`] of [`Task`]s.
///
/// Each worker loops popping a task (parking as a dual waiter when none is
/// queued) and invoking it. A task that panics unwinds its worker out of
/// the loop: that thread is permanently lost, by design, and any deferred
/// continuations it was holding are destroyed with it.
///
/// # Example
///
/// ```rust
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use terazi_pool::{Builder, Task};
///
/// let pool = Builder::new().workers(2).build();
/// let hits = Arc::new(AtomicUsize::new(0));
/// for _ in 0..8 {
///     let hits = hits.clone();
///     pool.submit_one(Task::new(move || {
///         hits.fetch_add(1, Ordering::Relaxed);
///     }));
/// }
/// while hits.load(Ordering::Relaxed) != 8 {
///     std::thread::yield_now();
/// }
/// ```
pub struct Pool {
    inner: Arc<Inner>,
    threads: Vec<JoinHandle<()>>,
}

impl Pool {
    /// A pool with one worker per hardware thread.
    pub fn new() -> Self {
        Builder::new().build()
    }

    /// A cheap handle for submitting from other threads (the reactor, or
    /// tasks resubmitting themselves).
    pub fn handle(&self) -> Handle {
        Handle {
            inner: self.inner.clone(),
        }
    }

    /// Submits a single task.
    pub fn submit_one(&self, task: Task) {
        self.inner.submit_one(task);
    }

    /// Submits a batch, reversing it so that the order the batch was
    /// pushed in is the order the pool serves.
    pub fn submit_many(&self, batch: List<Task>) {
        self.inner.submit_many(batch);
    }

    /// Queues `task` behind the currently running task on this worker, to
    /// be run (or re-enqueued) when it returns.
    ///
    /// Off a worker thread this degrades to [`Pool::submit_one`].
    pub fn defer(&self, task: Task) {
        self.inner.defer(task);
    }

    /// Cancels the pool: pending tasks are destroyed uninvoked, parked
    /// workers are woken to observe the flag. One-shot and idempotent;
    /// already running tasks finish.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.inner.cancel();
        for handle in self.threads.drain(..) {
            // A worker killed by a panicking task reports the panic here;
            // that loss was already accounted for.
            let _ = handle.join();
        }
    }
}

/// A cloneable submission handle to a [`Pool`].
#[derive(Clone)]
pub struct Handle {
    inner: Arc<Inner>,
}

impl Handle {
    /// See [`Pool::submit_one`].
    pub fn submit_one(&self, task: Task) {
        self.inner.submit_one(task);
    }

    /// See [`Pool::submit_many`].
    pub fn submit_many(&self, batch: List<Task>) {
        self.inner.submit_many(batch);
    }

    /// See [`Pool::defer`].
    pub fn defer(&self, task: Task) {
        self.inner.defer(task);
    }
}

impl Inner {
    fn submit_one(&self, task: Task) {
        if self.cancelled.load(Ordering::Acquire) {
            return; // dropped uninvoked
        }
        self.dual.push(task);
    }

    fn submit_many(&self, mut batch: List<Task>) {
        batch.reverse();
        while let Some(task) = batch.pop() {
            self.submit_one(task);
        }
    }

    fn defer(self: &Arc<Self>, task: Task) {
        let owner = Arc::as_ptr(self) as usize;
        let rejected = CURRENT.with(|current| match current.borrow_mut().as_mut() {
            Some(state) if state.owner == owner => {
                state.buffer.push(task);
                None
            }
            _ => Some(task),
        });
        if let Some(task) = rejected {
            self.submit_one(task);
        }
    }

    fn cancel(self: &Arc<Self>) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        // Destroy whatever was queued but never scheduled.
        while self.dual.try_pop().is_some() {}
        // Wake parked workers; each no-op lets one observe the flag.
        for _ in 0..self.workers {
            self.dual.push(Task::new(|| {}));
        }
    }
}

fn worker(inner: Arc<Inner>) {
    let owner = Arc::as_ptr(&inner) as usize;
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(WorkerState {
            owner,
            buffer: Vec::new(),
        });
    });
    loop {
        let task = inner.dual.pop();
        if inner.cancelled.load(Ordering::Acquire) {
            break; // the task (possibly a wakeup no-op) is dropped
        }
        run_chain(&inner, task);
    }
    CURRENT.with(|current| {
        *current.borrow_mut() = None;
    });
}

// Run a task, then settle its deferred continuations: all but the last go
// back through the dual; the last is tail-chained in-thread unless a
// queued task is already waiting, in which case fairness wins and the
// continuation queues up like everyone else.
fn run_chain(inner: &Arc<Inner>, mut task: Task) {
    loop {
        task.call();
        let mut buffer = CURRENT.with(|current| match current.borrow_mut().as_mut() {
            Some(state) => mem::take(&mut state.buffer),
            None => Vec::new(),
        });
        let Some(last) = buffer.pop() else {
            return;
        };
        for earlier in buffer {
            inner.dual.push(earlier);
        }
        match inner.dual.try_pop() {
            Some(queued) => {
                inner.dual.push(last);
                task = queued;
            }
            None => {
                task = last;
            }
        }
    }
}
