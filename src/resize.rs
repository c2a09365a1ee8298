//! Window resize debouncing.
//!
//! During a drag-resize the OS sends a burst of resize events. Rebuilding
//! the presentation chain for each of them stalls the GPU every time, so
//! [`ResizeManager`] buffers them and releases one [`ResizeEvent`] once the
//! size has been stable for the debounce period:
//!
//! ```text
//! Events:  R  R  R  R  R  R  ... R [quiet period]
//!          └──────────────────────┘      │
//!            (events buffered)           ▼
//!                               Single chain rebuild
//! ```
//!
//! A `0x0` event means the window was minimised. It is not clamped to the
//! minimum size; the window stops rendering until a real size arrives.
//!
//! # Example
//!
//! ```
//! use vk2d::resize::ResizeManager;
//!
//! let mut manager = ResizeManager::new((800, 600), 0);
//! manager.on_resize_event(1024, 768);
//! let event = manager.update().unwrap();
//! assert_eq!((event.width, event.height), (1024, 768));
//! assert_eq!((event.previous_width, event.previous_height), (800, 600));
//! ```

use std::time::{Duration, Instant};

/// A resize to apply, returned by [`ResizeManager::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeEvent {
    pub width: u32,
    pub height: u32,
    pub previous_width: u32,
    pub previous_height: u32,
}

#[derive(Debug)]
pub struct ResizeManager {
    /// Buffered size, not yet applied.
    pending_size: Option<(u32, u32)>,
    last_event_time: Instant,
    debounce_duration: Duration,
    /// Size last applied to the presentation chain.
    current_size: (u32, u32),
    min_size: (u32, u32),
    minimized: bool,
}

impl ResizeManager {
    /// `debounce_ms` is the quiet period after the last event before the
    /// resize is released; `0` releases it on the next
    /// [`update`](Self::update).
    pub fn new(initial_size: (u32, u32), debounce_ms: u64) -> Self {
        Self {
            pending_size: None,
            last_event_time: Instant::now(),
            debounce_duration: Duration::from_millis(debounce_ms),
            current_size: initial_size,
            min_size: (1, 1),
            minimized: false,
        }
    }

    /// Non-zero resize events smaller than this are clamped to it.
    pub fn set_min_size(&mut self, min_width: u32, min_height: u32) {
        self.min_size = (min_width.max(1), min_height.max(1));
    }

    pub fn set_debounce(&mut self, debounce_ms: u64) {
        self.debounce_duration = Duration::from_millis(debounce_ms);
    }

    /// Handle a resize event from the windowing system.
    pub fn on_resize_event(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            if !self.minimized {
                log::debug!("Window minimized");
            }
            self.minimized = true;
            self.pending_size = None;
            return;
        }
        if self.minimized {
            log::debug!("Window restored at {}x{}", width, height);
            self.minimized = false;
        }

        let new_size = (width.max(self.min_size.0), height.max(self.min_size.1));
        if Some(new_size) == self.pending_size {
            return;
        }
        if new_size == self.current_size {
            // Back to the applied size; nothing left to do.
            self.pending_size = None;
            return;
        }

        self.pending_size = Some(new_size);
        self.last_event_time = Instant::now();

        log::trace!(
            "Resize event: {}x{} (pending, debounce={}ms)",
            new_size.0,
            new_size.1,
            self.debounce_duration.as_millis()
        );
    }

    /// Release the pending resize once the debounce period has elapsed.
    ///
    /// Call once per frame.
    pub fn update(&mut self) -> Option<ResizeEvent> {
        let (width, height) = self.pending_size?;
        if self.last_event_time.elapsed() < self.debounce_duration {
            return None;
        }
        self.apply(width, height, "applied")
    }

    /// Release the pending resize without waiting.
    pub fn force_resize(&mut self) -> Option<ResizeEvent> {
        let (width, height) = self.pending_size?;
        self.apply(width, height, "forced")
    }

    fn apply(&mut self, width: u32, height: u32, how: &str) -> Option<ResizeEvent> {
        let previous = self.current_size;
        self.pending_size = None;
        self.current_size = (width, height);

        log::trace!(
            "Resize {}: {}x{} -> {}x{}",
            how,
            previous.0,
            previous.1,
            width,
            height
        );
        Some(ResizeEvent {
            width,
            height,
            previous_width: previous.0,
            previous_height: previous.1,
        })
    }

    /// Record a size the chain was rebuilt at for another reason.
    pub fn confirm_size(&mut self, width: u32, height: u32) {
        self.current_size = (width, height);
        if self.pending_size == Some(self.current_size) {
            self.pending_size = None;
        }
    }

    /// Size last applied to the presentation chain.
    pub fn swapchain_size(&self) -> (u32, u32) {
        self.current_size
    }

    pub fn pending_size(&self) -> Option<(u32, u32)> {
        self.pending_size
    }

    pub fn is_resizing(&self) -> bool {
        self.pending_size.is_some()
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn set_minimized(&mut self, minimized: bool) {
        self.minimized = minimized;
    }

    /// Time left before the pending resize is released.
    pub fn remaining_debounce(&self) -> Duration {
        if self.pending_size.is_some() {
            self.debounce_duration
                .saturating_sub(self.last_event_time.elapsed())
        } else {
            Duration::ZERO
        }
    }

    pub fn cancel_pending(&mut self) {
        self.pending_size = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_resize_event_sets_pending() {
        let mut manager = ResizeManager::new((1920, 1080), 50);
        manager.on_resize_event(1024, 768);
        assert!(manager.is_resizing());
        assert_eq!(manager.pending_size(), Some((1024, 768)));
        assert_eq!(manager.swapchain_size(), (1920, 1080));
    }

    #[test]
    fn test_same_size_ignored() {
        let mut manager = ResizeManager::new((1920, 1080), 50);
        manager.on_resize_event(1920, 1080);
        assert!(!manager.is_resizing());

        manager.on_resize_event(1024, 768);
        manager.on_resize_event(1920, 1080);
        assert!(!manager.is_resizing());
    }

    #[test]
    fn test_update_waits_for_debounce() {
        let mut manager = ResizeManager::new((1920, 1080), 100);
        manager.on_resize_event(1024, 768);
        assert!(manager.update().is_none());
        assert!(manager.remaining_debounce() > Duration::ZERO);
    }

    #[test]
    fn test_update_after_debounce() {
        let mut manager = ResizeManager::new((1920, 1080), 10);
        manager.on_resize_event(1024, 768);
        thread::sleep(Duration::from_millis(20));

        let event = manager.update().unwrap();
        assert_eq!((event.width, event.height), (1024, 768));
        assert_eq!((event.previous_width, event.previous_height), (1920, 1080));
        assert_eq!(manager.swapchain_size(), (1024, 768));
        assert!(manager.update().is_none());
    }

    #[test]
    fn test_force_resize() {
        let mut manager = ResizeManager::new((1920, 1080), 1000);
        manager.on_resize_event(800, 600);
        let event = manager.force_resize().unwrap();
        assert_eq!((event.width, event.height), (800, 600));
    }

    #[test]
    fn test_min_size_clamp() {
        let mut manager = ResizeManager::new((1920, 1080), 0);
        manager.set_min_size(32, 32);
        manager.on_resize_event(10, 5);
        assert_eq!(manager.pending_size(), Some((32, 32)));
    }

    #[test]
    fn test_zero_size_minimizes() {
        let mut manager = ResizeManager::new((1920, 1080), 0);
        manager.on_resize_event(1024, 768);
        manager.on_resize_event(0, 0);
        assert!(manager.is_minimized());
        assert!(manager.update().is_none());

        manager.on_resize_event(1280, 720);
        assert!(!manager.is_minimized());
        assert_eq!(manager.update().map(|e| (e.width, e.height)), Some((1280, 720)));
    }
}
