//! Device abstraction layer
//!
//! Provides the [`GpuDevice`] trait and the types shared by its
//! implementations: the headless [`DummyDevice`] and, with the
//! `vulkan-backend` feature, the ash-based [`vulkan::VulkanDevice`].

pub mod dummy;
pub(crate) mod guard;
pub mod traits;
pub mod types;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub use dummy::{CompletionMode, DummyDevice, SubmitRecord};
pub use traits::*;
pub use types::*;
