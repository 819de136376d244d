//! The erased one-shot callable the pool and reactor traffic in.

use core::fmt;

trait Call: Send {
    fn call(self: Box<Self>);
    fn try_clone(&self) -> Option<Task>;
}

struct Once<F>(F);

impl<F: FnOnce() + Send> Call for Once<F> {
    fn call(self: Box<Self>) {
        (self.0)()
    }

    fn try_clone(&self) -> Option<Task> {
        None
    }
}

struct Shared<F>(F);

impl<F: Fn() + Clone + Send + 'static> Call for Shared<F> {
    fn call(self: Box<Self>) {
        (self.0)()
    }

    fn try_clone(&self) -> Option<Task> {
        Some(Task {
            call: Box::new(Shared(self.0.clone())),
        })
    }
}

/// A move-only, one-shot task.
///
/// Invocation consumes the task; a task built with [`Task::cloneable`] can
/// additionally be duplicated through [`Task::try_clone`].
pub struct Task {
    call: Box<dyn Call>,
}

impl Task {
    /// Wraps an arbitrary closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            call: Box::new(Once(f)),
        }
    }

    /// Wraps a cloneable closure, enabling [`Task::try_clone`].
    pub fn cloneable<F>(f: F) -> Self
    where
        F: Fn() + Clone + Send + 'static,
    {
        Self {
            call: Box::new(Shared(f)),
        }
    }

    /// Invokes the task, consuming it. Panics propagate to the caller.
    pub fn call(self) {
        self.call.call()
    }

    /// Duplicates the task if (and only if) its closure was declared
    /// cloneable at construction.
    pub fn try_clone(&self) -> Option<Task> {
        self.call.try_clone()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Task")
    }
}
