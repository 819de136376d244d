//! A small task runtime over the [`terazi-dual`](terazi_dual) queue.
//!
//! - [`Task`]: a move-only, one-shot erased closure with an optional
//!   clone probe.
//! - [`Pool`]: N worker threads, each popping the dual (parking as a
//!   waiter when idle) and invoking tasks, with a thread-local
//!   deferred-continuation buffer that lets a task tail-chain its
//!   successor without a round trip through the queue.
//! - [`Reactor`]: a background `select(2)` thread turning file-descriptor
//!   readiness and deadlines into pool submissions.
//!
//! # Example
//!
//! ```rust
//! use std::sync::mpsc;
//! use terazi_pool::{Builder, Reactor, Task};
//!
//! let pool = Builder::new().workers(2).build();
//! let reactor = Reactor::new(pool.handle());
//!
//! let (tx, rx) = mpsc::channel();
//! reactor.after(std::time::Duration::from_millis(10), Task::new(move || {
//!     tx.send("fired").unwrap();
//! }));
//! assert_eq!(rx.recv().unwrap(), "fired");
//! ```

#![warn(missing_docs)]

mod pool;
mod reactor;
mod task;

pub use pool::{Builder, Handle, Pool};
pub use reactor::Reactor;
pub use task::Task;
