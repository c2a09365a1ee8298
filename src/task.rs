//! Background work off the render thread.
//!
//! Only screenshot encoding runs here. Results travel back through a
//! [`Fence`](crate::sync::Fence) and a mutex-guarded slot owned by the caller.

use std::thread;

/// A unit of background work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs [`Task`]s somewhere other than the calling thread.
pub trait TaskRunner: Send + Sync {
    fn spawn(&self, name: &str, task: Task);
}

/// Runs every task on its own named OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadTaskRunner;

impl TaskRunner for ThreadTaskRunner {
    fn spawn(&self, name: &str, task: Task) {
        let builder = thread::Builder::new().name(name.to_string());
        // `spawn` consumes the closure, so a failed spawn cannot fall back to
        // running it inline; the fence the task would set is never set.
        if let Err(e) = builder.spawn(task) {
            log::error!("Failed to spawn worker thread '{}': {}", name, e);
        }
    }
}

/// Runs tasks immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineTaskRunner;

impl TaskRunner for InlineTaskRunner {
    fn spawn(&self, name: &str, task: Task) {
        log::trace!("Running task '{}' inline", name);
        task();
    }
}

static_assertions::assert_impl_all!(ThreadTaskRunner: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Fence;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_thread_runner_uses_named_thread() {
        let fence = Arc::new(Fence::new());
        let name = Arc::new(parking_lot::Mutex::new(None));

        let done = Arc::clone(&fence);
        let seen = Arc::clone(&name);
        ThreadTaskRunner.spawn(
            "vk2d-test-worker",
            Box::new(move || {
                *seen.lock() = thread::current().name().map(str::to_string);
                done.set();
            }),
        );

        assert!(fence.wait_timeout(Duration::from_secs(5)));
        assert_eq!(name.lock().as_deref(), Some("vk2d-test-worker"));
    }

    #[test]
    fn test_inline_runner_runs_before_returning() {
        let fence = Arc::new(Fence::new());
        let done = Arc::clone(&fence);
        InlineTaskRunner.spawn("inline", Box::new(move || done.set()));
        assert!(fence.is_set());
    }
}
