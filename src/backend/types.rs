//! Common types shared between devices

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::Vec2;

use crate::backend::traits::{
    BufferHandle, CommandBufferHandle, DescriptorSetHandle, FramebufferHandle, ImageHandle,
    ImageViewHandle, RenderPassHandle, SamplerHandle, SemaphoreHandle,
};

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
}

impl TextureFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        4
    }

    /// Whether the red and blue channels are swapped relative to RGBA.
    pub fn is_bgra(&self) -> bool {
        matches!(self, TextureFormat::Bgra8Unorm | TextureFormat::Bgra8UnormSrgb)
    }
}

/// Presentation mode for the swapchain.
///
/// Controls how frames are synchronized with the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresentMode {
    /// No synchronization. May cause tearing but has lowest latency.
    Immediate,
    /// Triple buffering. Low latency without tearing.
    Mailbox,
    /// VSync enabled. No tearing, but may have higher latency.
    #[default]
    Fifo,
    /// VSync with relaxed timing. May tear if a frame is late.
    FifoRelaxed,
}

/// Multisample count for color attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Multisamples {
    #[default]
    X1,
    X2,
    X4,
    X8,
    X16,
    X32,
    X64,
}

impl Multisamples {
    pub fn count(&self) -> u32 {
        match self {
            Multisamples::X1 => 1,
            Multisamples::X2 => 2,
            Multisamples::X4 => 4,
            Multisamples::X8 => 8,
            Multisamples::X16 => 16,
            Multisamples::X32 => 32,
            Multisamples::X64 => 64,
        }
    }

    pub fn is_multisampled(&self) -> bool {
        *self != Multisamples::X1
    }
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of mip levels in a full chain down to 1x1.
    pub fn mip_levels(&self) -> u32 {
        32 - self.width.max(self.height).max(1).leading_zeros()
    }
}

bitflags! {
    /// Image usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const COLOR_ATTACHMENT = 1 << 0;
        const SAMPLED = 1 << 1;
        const TRANSFER_SRC = 1 << 2;
        const TRANSFER_DST = 1 << 3;
    }
}

bitflags! {
    /// Buffer usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
        /// CPU-visible memory; required for `write_buffer` and `read_buffer`.
        const HOST_VISIBLE = 1 << 6;
    }
}

bitflags! {
    /// Pipeline stages a semaphore wait blocks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const VERTEX_INPUT = 1 << 1;
        const VERTEX_SHADER = 1 << 2;
        const FRAGMENT_SHADER = 1 << 3;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 4;
        const TRANSFER = 1 << 5;
        const ALL_COMMANDS = 1 << 6;
    }
}

/// Image descriptor
#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    pub label: Option<String>,
    pub extent: Extent2d,
    pub mip_levels: u32,
    pub samples: Multisamples,
    pub format: TextureFormat,
    pub usage: ImageUsage,
}

impl Default for ImageDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            extent: Extent2d::new(1, 1),
            mip_levels: 1,
            samples: Multisamples::X1,
            format: TextureFormat::Rgba8Unorm,
            usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
        }
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    ClampToEdge,
    #[default]
    Repeat,
    MirrorRepeat,
    ClampToBorder,
}

/// Sampler descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerDescriptor {
    pub label: Option<String>,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub border_color: [f32; 4],
}

impl SamplerDescriptor {
    /// Border color is only honoured by the shader when an axis clamps to border.
    pub fn uses_border_color(&self) -> bool {
        self.address_mode_u == AddressMode::ClampToBorder
            || self.address_mode_v == AddressMode::ClampToBorder
    }
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: FilterMode::Linear,
            address_mode_u: AddressMode::Repeat,
            address_mode_v: AddressMode::Repeat,
            border_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Layout an attachment is left in when its render pass ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinalLayout {
    /// Ready for the presentation engine.
    Present,
    /// Ready to be resolved, blurred or mip-mapped.
    TransferSrc,
    /// Ready to be sampled by a shader.
    ShaderRead,
}

/// Render pass descriptor
///
/// One color attachment, optionally multisampled with a single-sample resolve
/// attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub format: TextureFormat,
    pub samples: Multisamples,
    pub final_layout: FinalLayout,
}

/// Framebuffer descriptor
#[derive(Debug, Clone)]
pub struct FramebufferDescriptor {
    pub render_pass: RenderPassHandle,
    /// Color attachment first, then the resolve target when multisampled.
    pub attachments: Vec<ImageViewHandle>,
    pub extent: Extent2d,
}

/// Swapchain descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct SwapchainDescriptor {
    pub extent: Extent2d,
    pub format: TextureFormat,
    pub present_mode: PresentMode,
    pub image_count: u32,
}

/// What the surface supports right now.
#[derive(Debug, Clone)]
pub struct SurfaceCapabilities {
    pub min_image_count: u32,
    /// `0` means no upper bound.
    pub max_image_count: u32,
    /// Fixed extent dictated by the surface, if any.
    pub current_extent: Option<Extent2d>,
    pub min_extent: Extent2d,
    pub max_extent: Extent2d,
    pub formats: Vec<TextureFormat>,
    pub present_modes: Vec<PresentMode>,
}

/// Result of asking the presentation engine for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready(u32),
    /// Usable, but the chain should be rebuilt soon.
    Suboptimal(u32),
    /// The chain no longer matches the surface.
    OutOfDate,
}

/// Result of a present request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemaphoreKind {
    Binary,
    Timeline { initial_value: u64 },
}

/// Wait on a semaphore before the submission's command buffers run.
///
/// `value` is ignored for binary semaphores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: SemaphoreHandle,
    pub value: u64,
    pub stages: PipelineStages,
}

/// Signal a semaphore once the submission completes.
///
/// `value` is ignored for binary semaphores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreSignal {
    pub semaphore: SemaphoreHandle,
    pub value: u64,
}

/// One entry of a queue submission batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitInfo {
    pub label: Option<String>,
    pub waits: Vec<SemaphoreWait>,
    pub command_buffers: Vec<CommandBufferHandle>,
    pub signals: Vec<SemaphoreSignal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    TriangleList,
    LineList,
    PointList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    Fill,
    Line,
    Point,
}

/// Everything that selects a graphics pipeline for a draw.
///
/// Pipeline objects themselves are built and cached by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineSettings {
    pub render_pass: RenderPassHandle,
    pub topology: PrimitiveTopology,
    pub polygon_mode: PolygonMode,
    pub samples: Multisamples,
    /// More than one texture layer is blended per vertex.
    pub multitextured: bool,
    pub border_color: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlurType {
    #[default]
    None,
    Box,
    Gaussian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlurDirection {
    Horizontal,
    Vertical,
}

/// Vertex as consumed by the 2D shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec2,
    pub uv: Vec2,
    pub color: [f32; 4],
    pub point_size: f32,
    /// Texture layer used when no per-vertex layer weights are supplied.
    pub single_texture_layer: u32,
}

impl Vertex {
    pub fn new(position: Vec2, uv: Vec2, color: [f32; 4]) -> Self {
        Self {
            position,
            uv,
            color,
            point_size: 1.0,
            single_texture_layer: 0,
        }
    }
}

impl Default for Vertex {
    fn default() -> Self {
        Self::new(Vec2::ZERO, Vec2::ZERO, [1.0; 4])
    }
}

/// Per-draw constants pushed alongside each indexed draw.
///
/// Offsets are element offsets into the geometry buffer sections.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct DrawConstants {
    pub transformation_offset: u32,
    pub index_offset: u32,
    pub index_count: u32,
    pub vertex_offset: u32,
    pub texture_layer_weight_offset: u32,
    pub texture_layer_count: u32,
}

/// A single recorded GPU command.
///
/// Commands are recorded on the CPU into a [`CommandList`] and handed to
/// [`GpuDevice::record_commands`](crate::backend::GpuDevice::record_commands).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRenderPass {
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2d,
        clear_color: [f32; 4],
    },
    EndRenderPass,
    /// Viewport and scissor covering `extent`.
    SetViewport {
        extent: Extent2d,
    },
    SetLineWidth(f32),
    BindPipeline(PipelineSettings),
    BindDescriptorSet {
        index: u32,
        set: DescriptorSetHandle,
    },
    BindGeometry {
        buffer: BufferHandle,
        index_offset: u64,
        vertex_offset: u64,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        constants: DrawConstants,
    },
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    },
    ResolveImage {
        src: ImageHandle,
        dst: ImageHandle,
        extent: Extent2d,
    },
    Blur {
        source: ImageViewHandle,
        sampler: SamplerHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2d,
        direction: BlurDirection,
        blur_type: BlurType,
        amount: Vec2,
    },
    /// Copy `src` into mip 0 of `dst` and blit the rest of the chain.
    GenerateMipmaps {
        src: ImageHandle,
        dst: ImageHandle,
        extent: Extent2d,
        mip_levels: u32,
    },
    CopyImageToBuffer {
        image: ImageHandle,
        buffer: BufferHandle,
        extent: Extent2d,
    },
}

/// An ordered list of commands for one command buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn extend(&mut self, other: &CommandList) {
        self.commands.extend(other.commands.iter().cloned());
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    pub fn count_draws(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::DrawIndexed { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_levels() {
        assert_eq!(Extent2d::new(1, 1).mip_levels(), 1);
        assert_eq!(Extent2d::new(256, 16).mip_levels(), 9);
        assert_eq!(Extent2d::new(300, 200).mip_levels(), 9);
        assert_eq!(Extent2d::new(0, 0).mip_levels(), 1);
    }

    #[test]
    fn test_vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 40);
        assert_eq!(std::mem::size_of::<DrawConstants>(), 24);
    }

    #[test]
    fn test_multisamples() {
        assert!(!Multisamples::X1.is_multisampled());
        assert!(Multisamples::X4.is_multisampled());
        assert_eq!(Multisamples::X8.count(), 8);
    }
}
