//! CPU-side synchronization primitives.
//!
//! [`Fence`] is a one-shot boolean latch used to hand work between the render
//! thread and worker threads (screenshot encoding). GPU-side fences and
//! semaphores live behind [`GpuDevice`](crate::backend::GpuDevice); this type
//! never touches the device.
//!
//! Waiting is condition-variable based, so waiters sleep instead of polling.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vk2d::sync::Fence;
//!
//! let fence = Arc::new(Fence::new());
//! let worker = Arc::clone(&fence);
//!
//! std::thread::spawn(move || {
//!     // ... do work ...
//!     worker.set();
//! });
//!
//! assert!(fence.wait_timeout(Duration::from_secs(5)));
//! assert!(fence.is_set());
//! ```

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// One-shot completion latch.
///
/// Once [`set`](Self::set) is called the fence stays set for its whole
/// lifetime; every current and future waiter returns immediately.
#[derive(Debug, Default)]
pub struct Fence {
    /// Fast path for [`is_set`](Self::is_set) without taking the lock.
    is_set: AtomicBool,
    mutex: Mutex<bool>,
    condvar: Condvar,
}

impl Fence {
    /// Create an unset fence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fence and wake every waiter.
    pub fn set(&self) {
        let mut guard = self.mutex.lock();
        *guard = true;
        self.is_set.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    /// Check whether the fence has been set (non-blocking).
    pub fn is_set(&self) -> bool {
        self.is_set.load(Ordering::Acquire)
    }

    /// Block until the fence is set.
    pub fn wait(&self) {
        let mut guard = self.mutex.lock();
        while !*guard {
            self.condvar.wait(&mut guard);
        }
    }

    /// Block until the fence is set or `timeout` elapses.
    ///
    /// Returns `true` if the fence was set, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline),
            None => {
                self.wait();
                true
            }
        }
    }

    /// Block until the fence is set or `deadline` is reached.
    ///
    /// Spurious wake-ups are absorbed; the deadline is absolute.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut guard = self.mutex.lock();
        while !*guard {
            if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                return *guard;
            }
        }
        true
    }
}

static_assertions::assert_impl_all!(Fence: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_new_fence_is_unset() {
        let fence = Fence::new();
        assert!(!fence.is_set());
    }

    #[test]
    fn test_set_is_sticky() {
        let fence = Fence::new();
        fence.set();
        assert!(fence.is_set());
        fence.set();
        assert!(fence.is_set());
    }

    #[test]
    fn test_wait_returns_immediately_when_set() {
        let fence = Fence::new();
        fence.set();
        fence.wait();
        assert!(fence.wait_timeout(Duration::from_millis(0)));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let fence = Fence::new();
        let start = Instant::now();
        assert!(!fence.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cross_thread_wake() {
        let fence = Arc::new(Fence::new());
        let producer = Arc::clone(&fence);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.set();
        });

        assert!(fence.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_many_waiters() {
        let fence = Arc::new(Fence::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let fence = Arc::clone(&fence);
                std::thread::spawn(move || fence.wait_timeout(Duration::from_secs(5)))
            })
            .collect();

        fence.set();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }

    #[test]
    fn test_wait_timeout_huge_duration_does_not_overflow() {
        let fence = Fence::new();
        fence.set();
        assert!(fence.wait_timeout(Duration::MAX));
    }
}
