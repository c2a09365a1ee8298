//! Configuration for instances, windows and render targets.
//!
//! All configuration types implement [`Default`] and offer `with_*`
//! builders:
//!
//! ```
//! use std::time::Duration;
//! use vk2d::{Multisamples, WindowConfig};
//!
//! let config = WindowConfig::new(1280, 720)
//!     .with_samples(Multisamples::X4)
//!     .with_frame_timeout(Duration::from_secs(2));
//! assert_eq!(config.width, 1280);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Multisamples, PresentMode};
use crate::report::ReportCallback;
use crate::task::TaskRunner;

/// Configuration for an [`Instance`](crate::Instance).
#[derive(Clone)]
pub struct InstanceConfig {
    /// Receives every reported problem, in addition to the log.
    pub report_callback: Option<ReportCallback>,
    /// Runs screenshot encoding. Defaults to one OS thread per task.
    pub task_runner: Option<Arc<dyn TaskRunner>>,
    /// Longest render-target dependency chain a commit follows.
    pub max_dependency_depth: usize,
    /// Descriptor sets unused for this long are freed at frame boundaries.
    pub descriptor_eviction_age: Duration,
    /// Bound on waiting for a render target's renders when it is dropped.
    pub shutdown_timeout: Duration,
}

impl InstanceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_report_callback(mut self, callback: ReportCallback) -> Self {
        self.report_callback = Some(callback);
        self
    }

    pub fn with_task_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.task_runner = Some(runner);
        self
    }

    pub fn with_max_dependency_depth(mut self, depth: usize) -> Self {
        self.max_dependency_depth = depth;
        self
    }

    pub fn with_descriptor_eviction_age(mut self, age: Duration) -> Self {
        self.descriptor_eviction_age = age;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            report_callback: None,
            task_runner: None,
            max_dependency_depth: 16,
            descriptor_eviction_age: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("report_callback", &self.report_callback.is_some())
            .field("task_runner", &self.task_runner.is_some())
            .field("max_dependency_depth", &self.max_dependency_depth)
            .field("descriptor_eviction_age", &self.descriptor_eviction_age)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

/// Configuration for a [`Window`](crate::Window).
#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    /// Initial content width in pixels.
    pub width: u32,
    /// Initial content height in pixels.
    pub height: u32,
    /// Resize events below this size are clamped to it.
    pub min_size: (u32, u32),
    pub present_mode: PresentMode,
    /// Multisampling of the window's color attachment.
    pub samples: Multisamples,
    /// Presentable image count; clamped to what the surface supports.
    /// `None` asks for one more than the surface minimum.
    pub preferred_image_count: Option<u32>,
    /// Bound on waiting for a frame's GPU work. `None` waits forever.
    pub frame_timeout: Option<Duration>,
    /// Bound on waiting for in-flight work when the window is dropped.
    pub shutdown_timeout: Duration,
    pub clear_color: [f32; 4],
    /// Quiet period before a resize is applied.
    pub resize_debounce_ms: u64,
}

impl WindowConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn with_min_size(mut self, width: u32, height: u32) -> Self {
        self.min_size = (width, height);
        self
    }

    pub fn with_present_mode(mut self, present_mode: PresentMode) -> Self {
        self.present_mode = present_mode;
        self
    }

    pub fn with_samples(mut self, samples: Multisamples) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_preferred_image_count(mut self, count: u32) -> Self {
        self.preferred_image_count = Some(count);
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    pub fn with_resize_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.resize_debounce_ms = debounce_ms;
        self
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            min_size: (32, 32),
            present_mode: PresentMode::Fifo,
            samples: Multisamples::X1,
            preferred_image_count: None,
            frame_timeout: None,
            shutdown_timeout: Duration::from_secs(5),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            resize_debounce_ms: 0,
        }
    }
}

/// Parameters for a [`RenderTargetTexture`](crate::RenderTargetTexture).
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTargetTextureCreateInfo {
    pub width: u32,
    pub height: u32,
    /// Multisampling of the render attachment; resolved before sampling.
    pub samples: Multisamples,
    /// Allocate the extra images `end_render` needs to blur.
    pub enable_blur: bool,
    pub clear_color: [f32; 4],
}

impl RenderTargetTextureCreateInfo {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn with_samples(mut self, samples: Multisamples) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_blur(mut self, enable_blur: bool) -> Self {
        self.enable_blur = enable_blur;
        self
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }
}

impl Default for RenderTargetTextureCreateInfo {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            samples: Multisamples::X1,
            enable_blur: false,
            clear_color: [0.0, 0.0, 0.0, 0.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_defaults() {
        let config = InstanceConfig::default();
        assert_eq!(config.max_dependency_depth, 16);
        assert_eq!(config.descriptor_eviction_age, Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert!(config.report_callback.is_none());
    }

    #[test]
    fn test_window_defaults() {
        let config = WindowConfig::default();
        assert_eq!(config.frame_timeout, None);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.resize_debounce_ms, 0);
        assert_eq!(config.present_mode, PresentMode::Fifo);
    }

    #[test]
    fn test_builders() {
        let config = WindowConfig::new(320, 240)
            .with_preferred_image_count(3)
            .with_resize_debounce_ms(50);
        assert_eq!((config.width, config.height), (320, 240));
        assert_eq!(config.preferred_image_count, Some(3));
        assert_eq!(config.resize_debounce_ms, 50);

        let info = RenderTargetTextureCreateInfo::new(64, 32)
            .with_samples(Multisamples::X4)
            .with_blur(true);
        assert!(info.enable_blur);
        assert_eq!(info.samples, Multisamples::X4);
    }
}
