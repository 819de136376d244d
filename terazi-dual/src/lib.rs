//! A lock-free *dual* queue/stack.
//!
//! One intrusive linked list, rooted at an atomic `head` and `tail` word,
//! is simultaneously a FIFO of pending items and a LIFO of waiting
//! consumers — with at most one of the two populated at any instant. When
//! a producer arrives it is matched with the youngest waiter, or enqueued
//! if there are none; when a consumer arrives it is matched with the
//! oldest item, or becomes the youngest waiter.
//!
//! Every mutation flows through the weighted counted-pointer protocol of
//! [`terazi`], so nodes are reclaimed exactly when the last reference
//! (structural or thread-held) lets go, without a garbage collector.
//!
//! # Example
//!
//! ```rust
//! use std::thread;
//! use std::sync::Arc;
//! use terazi_dual::Dual;
//!
//! let dual = Arc::new(Dual::new());
//!
//! let consumer = {
//!     let dual = dual.clone();
//!     thread::spawn(move || dual.pop())
//! };
//!
//! dual.push(42);
//! assert_eq!(consumer.join().unwrap(), 42);
//! ```

#![warn(missing_docs)]

mod dual;
mod signal;

pub use dual::Dual;
