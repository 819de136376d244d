//! A select-based I/O and timer reactor feeding the pool.

use std::collections::BinaryHeap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use terazi::{List, Stack};

use crate::pool::Handle;
use crate::task::Task;

// Reactor state word: one-shot cancellation, an idempotent "self-pipe has
// been poked" bit, and a count of the bytes actually written, which bounds
// how much of the pipe the loop may drain before re-splicing its inputs.
const CANCEL: u64 = 1 << 63;
const PENDING: u64 = 1 << 62;
const COUNT: u64 = PENDING - 1;

struct FdWaiter {
    fd: RawFd,
    task: Task,
}

struct TimerWaiter {
    deadline: Instant,
    task: Task,
}

// Reverse ordering on deadlines, so the max-heap surfaces the earliest.
impl PartialEq for TimerWaiter {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerWaiter {}

impl PartialOrd for TimerWaiter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerWaiter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

struct Inner {
    readers: Stack<FdWaiter>,
    writers: Stack<FdWaiter>,
    excepters: Stack<FdWaiter>,
    timers: Stack<TimerWaiter>,
    state: AtomicU64,
    pipe_read: RawFd,
    pipe_write: RawFd,
}

/// A single background thread multiplexing file-descriptor readiness and
/// deadlines over `select(2)`, handing ready continuations to a [`Pool`]
/// (via its [`Handle`]).
///
/// Registration is lock-free: a waiter node is pushed onto one of four
/// input stacks and the reactor is poked through a self-pipe, writing a
/// byte only when the pending bit transitions from clear to set.
///
/// Registering the same descriptor twice, or a closed one, is the
/// caller's undefined behavior, as is usual for `select`.
///
/// [`Pool`]: crate::Pool
pub struct Reactor {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl Reactor {
    /// Spawns the reactor thread, submitting ready work through `pool`.
    pub fn new(pool: Handle) -> Self {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            fatal("reactor self-pipe");
        }
        // Only the read end goes non-blocking: drains are opportunistic,
        // while the rare notification write may simply block.
        unsafe {
            let flags = libc::fcntl(fds[0], libc::F_GETFL);
            if flags == -1 || libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
                fatal("reactor self-pipe flags");
            }
        }
        let inner = Arc::new(Inner {
            readers: Stack::new(),
            writers: Stack::new(),
            excepters: Stack::new(),
            timers: Stack::new(),
            state: AtomicU64::new(0),
            pipe_read: fds[0],
            pipe_write: fds[1],
        });
        let thread = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("terazi-reactor".into())
                .spawn(move || run(inner, pool))
                .expect("failed to spawn reactor thread")
        };
        Self {
            inner,
            thread: Some(thread),
        }
    }

    /// Runs `task` once `fd` becomes readable.
    pub fn when_readable(&self, fd: RawFd, task: Task) {
        self.inner.register(&self.inner.readers, FdWaiter { fd, task });
    }

    /// Runs `task` once `fd` becomes writable.
    pub fn when_writable(&self, fd: RawFd, task: Task) {
        self.inner.register(&self.inner.writers, FdWaiter { fd, task });
    }

    /// Runs `task` once `fd` reports an exceptional condition.
    pub fn when_exceptional(&self, fd: RawFd, task: Task) {
        self.inner.register(&self.inner.excepters, FdWaiter { fd, task });
    }

    /// Runs `task` once the monotonic clock reaches `deadline`.
    pub fn when(&self, deadline: Instant, task: Task) {
        self.inner
            .register(&self.inner.timers, TimerWaiter { deadline, task });
    }

    /// Runs `task` after `delay`, measured from now.
    pub fn after(&self, delay: Duration, task: Task) {
        self.when(Instant::now() + delay, task);
    }

    /// Cancels the reactor: the thread exits and every waiter or timer
    /// still registered is dropped uninvoked. One-shot and idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.inner.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        unsafe {
            libc::close(self.inner.pipe_write);
            libc::close(self.inner.pipe_read);
        }
    }
}

impl Inner {
    fn register<W>(&self, buffer: &Stack<W>, waiter: W) {
        if self.state.load(Ordering::Acquire) & CANCEL != 0 {
            return; // shut down: the closure is destroyed
        }
        buffer.push(waiter);
        self.notify();
    }

    // Poke the reactor, writing a self-pipe byte only when the pending
    // bit transitioned from clear to set.
    fn notify(&self) {
        let prev = self.state.fetch_or(PENDING, Ordering::AcqRel);
        if prev & (PENDING | CANCEL) == 0 {
            self.write_byte();
        }
    }

    fn write_byte(&self) {
        let byte = 0u8;
        loop {
            let n = unsafe { libc::write(self.pipe_write, (&byte as *const u8).cast(), 1) };
            if n == 1 {
                // Counted after the write so the loop never drains a byte
                // it has not yet accounted for.
                self.state.fetch_add(1, Ordering::Release);
                return;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                // A full pipe means the reactor is hopelessly behind but
                // provably awake; the poke is already delivered.
                Some(libc::EAGAIN) => return,
                _ => fatal("reactor notify"),
            }
        }
    }

    fn cancel(&self) {
        let prev = self.state.fetch_or(CANCEL | PENDING, Ordering::AcqRel);
        if prev & CANCEL != 0 {
            return;
        }
        if prev & PENDING == 0 {
            self.write_byte();
        }
    }
}

fn run(inner: Arc<Inner>, pool: Handle) {
    let mut readers: Vec<FdWaiter> = Vec::new();
    let mut writers: Vec<FdWaiter> = Vec::new();
    let mut excepters: Vec<FdWaiter> = Vec::new();
    let mut timers: BinaryHeap<TimerWaiter> = BinaryHeap::new();

    // Self-pipe bytes observed in the state word but not yet read.
    let mut outstanding: u64 = 0;

    loop {
        // Synchronize with the pushes that preceded every notification,
        // and check for cancellation.
        let old = inner.state.fetch_and(CANCEL, Ordering::Acquire);
        if old & CANCEL != 0 {
            break;
        }
        outstanding += old & COUNT;

        for w in inner.readers.take() {
            readers.push(w);
        }
        for w in inner.writers.take() {
            writers.push(w);
        }
        for w in inner.excepters.take() {
            excepters.push(w);
        }
        for t in inner.timers.take() {
            timers.push(t);
        }

        // Fire everything already due before computing the timeout.
        let now = Instant::now();
        let mut batch = List::new();
        while timers.peek().map_or(false, |t| t.deadline <= now) {
            if let Some(t) = timers.pop() {
                batch.push(t.task);
            }
        }
        if !batch.is_empty() {
            pool.submit_many(batch);
        }

        let mut readset: libc::fd_set = unsafe { mem::zeroed() };
        let mut writeset: libc::fd_set = unsafe { mem::zeroed() };
        let mut exceptset: libc::fd_set = unsafe { mem::zeroed() };
        let mut maxfd = inner.pipe_read;
        unsafe {
            libc::FD_ZERO(&mut readset);
            libc::FD_ZERO(&mut writeset);
            libc::FD_ZERO(&mut exceptset);
            libc::FD_SET(inner.pipe_read, &mut readset);
            for w in &readers {
                libc::FD_SET(w.fd, &mut readset);
                maxfd = maxfd.max(w.fd);
            }
            for w in &writers {
                libc::FD_SET(w.fd, &mut writeset);
                maxfd = maxfd.max(w.fd);
            }
            for w in &excepters {
                libc::FD_SET(w.fd, &mut exceptset);
                maxfd = maxfd.max(w.fd);
            }
        }

        let mut timeout: libc::timeval = unsafe { mem::zeroed() };
        let timeout_ptr = match timers.peek() {
            Some(t) => {
                let gap = t.deadline.saturating_duration_since(Instant::now());
                timeout.tv_sec = gap.as_secs() as libc::time_t;
                timeout.tv_usec = gap.subsec_micros() as libc::suseconds_t;
                &mut timeout as *mut libc::timeval
            }
            None => ptr::null_mut(),
        };

        let n = unsafe {
            libc::select(
                maxfd + 1,
                &mut readset,
                &mut writeset,
                &mut exceptset,
                timeout_ptr,
            )
        };
        if n == -1 {
            if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            fatal("select");
        }
        if n == 0 {
            continue; // timeout: due timers fire at the top of the loop
        }

        // Drain the pipe, but never past the notifications whose pushes
        // this loop has already spliced in.
        if outstanding > 0 && unsafe { libc::FD_ISSET(inner.pipe_read, &readset) } {
            let mut buf = [0u8; 64];
            let want = outstanding.min(buf.len() as u64) as usize;
            let r = unsafe { libc::read(inner.pipe_read, buf.as_mut_ptr().cast(), want) };
            if r > 0 {
                outstanding -= r as u64;
            } else if r == -1 {
                match io::Error::last_os_error().raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => {}
                    _ => fatal("reactor drain"),
                }
            }
        }

        let mut batch = List::new();
        collect_ready(&mut readers, &readset, &mut batch);
        collect_ready(&mut writers, &writeset, &mut batch);
        collect_ready(&mut excepters, &exceptset, &mut batch);
        if !batch.is_empty() {
            pool.submit_many(batch);
        }
    }
    // Falling out of the loop drops the remaining waiters and timers;
    // their closures are destroyed uninvoked.
}

fn collect_ready(list: &mut Vec<FdWaiter>, set: &libc::fd_set, batch: &mut List<Task>) {
    let mut i = 0;
    while i < list.len() {
        if unsafe { libc::FD_ISSET(list[i].fd, set) } {
            let waiter = list.swap_remove(i);
            batch.push(waiter.task);
        } else {
            i += 1;
        }
    }
}

fn fatal(what: &str) -> ! {
    eprintln!("{what}: {}", io::Error::last_os_error());
    std::process::abort();
}
