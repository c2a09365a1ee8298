//! Core device abstraction
//!
//! [`GpuDevice`] is the narrow interface the renderer drives: object
//! creation, command recording, queue submission and presentation. Every
//! object is referred to by an opaque `u64` handle so devices can keep their
//! native objects in maps behind a lock.

use crate::backend::types::*;
use std::time::Duration;
use thiserror::Error;

/// Device error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to initialize device: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to create {kind}: {reason}")]
    ResourceCreationFailed { kind: &'static str, reason: String },
    #[error("Failed to record command buffer: {0}")]
    RecordingFailed(String),
    #[error("Failed to submit work: {0}")]
    SubmitFailed(String),
    #[error("Failed to wait for synchronization object: {0}")]
    WaitFailed(String),
    #[error("Command buffer {0:?} is still executing")]
    CommandBufferInFlight(CommandBufferHandle),
    #[error("Unknown {0} handle")]
    InvalidHandle(&'static str),
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

impl BackendError {
    pub(crate) fn creation(kind: &'static str, reason: impl ToString) -> Self {
        BackendError::ResourceCreationFailed {
            kind,
            reason: reason.to_string(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a presentation chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapchainHandle(pub(crate) u64);

/// Handle to a GPU image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub(crate) u64);

/// Handle to an image view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageViewHandle(pub(crate) u64);

/// Handle to a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassHandle(pub(crate) u64);

/// Handle to a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub(crate) u64);

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

/// Handle to a descriptor set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetHandle(pub(crate) u64);

/// Handle to a binary or timeline semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreHandle(pub(crate) u64);

/// Handle to a GPU-to-CPU fence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub(crate) u64);

/// Handle to a primary command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle(pub(crate) u64);

/// What a descriptor set binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorBinding {
    Sampler(SamplerHandle),
    Texture(ImageViewHandle),
    UniformBuffer(BufferHandle),
}

/// Graphics device and queue.
///
/// Implementations must be usable from the render thread while worker
/// threads hold an `Arc` to them, hence `Send + Sync`.
pub trait GpuDevice: Send + Sync {
    /// Short device name for logs.
    fn name(&self) -> &'static str;

    // Presentation

    /// Query what the surface supports right now.
    fn surface_capabilities(&self) -> BackendResult<SurfaceCapabilities>;

    /// Create a presentation chain, retiring `old` if given.
    fn create_swapchain(
        &self,
        desc: &SwapchainDescriptor,
        old: Option<SwapchainHandle>,
    ) -> BackendResult<SwapchainHandle>;

    /// Images owned by the chain, indexed by slot.
    fn swapchain_images(&self, swapchain: SwapchainHandle) -> BackendResult<Vec<ImageHandle>>;

    fn destroy_swapchain(&self, swapchain: SwapchainHandle);

    /// Acquire the next writable image; `fence` is signaled once it is usable.
    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        fence: FenceHandle,
    ) -> BackendResult<AcquireOutcome>;

    /// Queue `image_index` for presentation once `wait` is signaled.
    fn present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> BackendResult<PresentOutcome>;

    // Images

    fn create_image(&self, desc: &ImageDescriptor) -> BackendResult<ImageHandle>;

    fn destroy_image(&self, image: ImageHandle);

    /// Upload tightly packed pixel data into mip 0 of `image`.
    fn write_image(&self, image: ImageHandle, data: &[u8]) -> BackendResult<()>;

    fn create_image_view(&self, image: ImageHandle) -> BackendResult<ImageViewHandle>;

    fn destroy_image_view(&self, view: ImageViewHandle);

    fn create_render_pass(&self, desc: &RenderPassDescriptor) -> BackendResult<RenderPassHandle>;

    fn destroy_render_pass(&self, render_pass: RenderPassHandle);

    fn create_framebuffer(&self, desc: &FramebufferDescriptor)
        -> BackendResult<FramebufferHandle>;

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle);

    // Buffers

    fn create_buffer(&self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Write into a host-visible buffer.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()>;

    /// Read back from a host-visible buffer.
    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>>;

    // Samplers and descriptors

    fn create_sampler(&self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    fn destroy_sampler(&self, sampler: SamplerHandle);

    fn create_descriptor_set(&self, binding: &DescriptorBinding)
        -> BackendResult<DescriptorSetHandle>;

    fn destroy_descriptor_set(&self, set: DescriptorSetHandle);

    // Synchronization

    fn create_semaphore(&self, kind: SemaphoreKind) -> BackendResult<SemaphoreHandle>;

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    /// Wait until a timeline semaphore reaches `value`.
    ///
    /// Returns `Ok(false)` if `timeout` elapsed first. `None` waits forever.
    fn wait_semaphore(
        &self,
        semaphore: SemaphoreHandle,
        value: u64,
        timeout: Option<Duration>,
    ) -> BackendResult<bool>;

    fn create_fence(&self, signaled: bool) -> BackendResult<FenceHandle>;

    fn destroy_fence(&self, fence: FenceHandle);

    /// Wait for `fence`. Returns `Ok(false)` if `timeout` elapsed first.
    fn wait_fence(&self, fence: FenceHandle, timeout: Option<Duration>) -> BackendResult<bool>;

    fn reset_fence(&self, fence: FenceHandle) -> BackendResult<()>;

    // Commands

    fn allocate_command_buffer(&self) -> BackendResult<CommandBufferHandle>;

    fn free_command_buffer(&self, command_buffer: CommandBufferHandle);

    /// Reset `command_buffer` and record `commands` into it.
    fn record_commands(
        &self,
        command_buffer: CommandBufferHandle,
        commands: &CommandList,
    ) -> BackendResult<()>;

    /// Submit a batch in order; `fence` is signaled when all of it completes.
    fn submit(&self, submissions: &[SubmitInfo], fence: Option<FenceHandle>)
        -> BackendResult<()>;

    /// Block until the queue is idle.
    fn wait_idle(&self) -> BackendResult<()>;
}
