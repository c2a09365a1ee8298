//! # vk2d
//!
//! A 2D renderer built around multi-buffered presentation and lazily
//! scheduled off-screen render targets.
//!
//! ## Overview
//!
//! - [`Instance`] - Device, shared resources and the render-target arena
//! - [`Window`] - Presentation chain, per-slot frame resources and frame submission
//! - [`RenderTargetTexture`] - Double-buffered off-screen target, sampleable in
//!   the same frame it is drawn
//! - [`backend`] - The [`GpuDevice`] trait, the headless [`DummyDevice`] and,
//!   with `vulkan-backend`, an ash device
//!
//! Render targets are never submitted on their own. Whatever samples them
//! (a window frame or another render target) commits them first, and its
//! submission waits on the exact timeline value their render signals.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use vk2d::{DummyDevice, Instance, InstanceConfig, Window, WindowConfig};
//!
//! let instance = Instance::new(Arc::new(DummyDevice::new()), InstanceConfig::default())?;
//! let mut window = Window::new(&instance, WindowConfig::new(640, 480))?;
//!
//! window.begin_frame()?;
//! // draw_triangle_list, draw_mesh, ...
//! window.end_frame()?;
//! # Ok::<(), vk2d::RenderError>(())
//! ```

pub mod backend;
pub mod config;
pub mod draw;
pub mod error;
mod frame;
pub mod instance;
pub mod mesh_buffer;
pub mod render_target;
pub mod report;
pub mod resize;
pub mod resources;
pub mod screenshot;
mod submission;
mod swapchain;
pub mod sync;
pub mod task;
pub mod window;

// Re-export main types for convenience
pub use backend::{
    BackendError, BlurType, CompletionMode, DummyDevice, Extent2d, GpuDevice, Multisamples,
    PresentMode, TextureFormat, Vertex,
};
pub use config::{InstanceConfig, RenderTargetTextureCreateInfo, WindowConfig};
pub use draw::DrawGeometry;
pub use error::{ErrorClass, RenderError, RenderResult};
pub use instance::Instance;
pub use render_target::{RenderTargetId, RenderTargetTexture};
pub use report::{ReportCallback, ReportSeverity};
pub use resources::{Mesh, MeshType, Sampler, Texture, TextureData};
pub use screenshot::{ScreenshotEvent, ScreenshotHandler};
pub use window::Window;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
