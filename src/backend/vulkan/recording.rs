//! Translation of [`CommandList`]s into Vulkan command buffers.
//!
//! Image layouts are tracked per image while recording. Transitions are
//! emitted lazily in front of the command that needs a layout, and every
//! touched image is returned to its resting layout at the end of the
//! command buffer: presentable images to `PRESENT_SRC_KHR`, sampled images
//! to `SHADER_READ_ONLY_OPTIMAL`. Tracking follows recording order, which
//! matches submission order for everything the renderer records.

use ash::vk;

use super::pipeline::{create_blur_pipeline, create_draw_pipeline, BlurConstants};
use super::{Resources, VulkanDevice};
use crate::backend::traits::*;
use crate::backend::types::*;

fn src_sync(layout: vk::ImageLayout) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    match layout {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::empty(),
        ),
        _ => (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
    }
}

fn dst_sync(layout: vk::ImageLayout) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    match layout {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        _ => (vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty()),
    }
}

fn color_range(base_mip_level: u32, level_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level,
        level_count,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn color_layers(mip_level: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn extent_3d(extent: Extent2d) -> vk::Extent3D {
    vk::Extent3D {
        width: extent.width.max(1),
        height: extent.height.max(1),
        depth: 1,
    }
}

unsafe fn image_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    range: vk::ImageSubresourceRange,
) {
    let (src_stage, src_access) = src_sync(old_layout);
    let (dst_stage, dst_access) = dst_sync(new_layout);
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);
    device.cmd_pipeline_barrier(
        cmd,
        src_stage,
        dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

/// Copy tightly packed pixels from `src` into mip 0 of `image`, leaving the
/// whole image shader-readable.
pub(super) unsafe fn upload_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Buffer,
    image: vk::Image,
    extent: Extent2d,
) {
    let all_mips = color_range(0, vk::REMAINING_MIP_LEVELS);
    image_barrier(
        device,
        cmd,
        image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        all_mips,
    );
    let region = vk::BufferImageCopy::default()
        .image_subresource(color_layers(0))
        .image_extent(extent_3d(extent));
    device.cmd_copy_buffer_to_image(
        cmd,
        src,
        image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[region],
    );
    image_barrier(
        device,
        cmd,
        image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        all_mips,
    );
}

pub(super) struct Recorder<'a> {
    owner: &'a VulkanDevice,
    resources: &'a mut Resources,
    cmd: vk::CommandBuffer,
    touched: Vec<ImageHandle>,
    /// Framebuffer of the open render pass.
    open_pass: Option<FramebufferHandle>,
    /// Whether a usable draw pipeline is bound.
    draw_ready: bool,
}

impl<'a> Recorder<'a> {
    pub(super) fn new(
        owner: &'a VulkanDevice,
        resources: &'a mut Resources,
        cmd: vk::CommandBuffer,
    ) -> Self {
        Self {
            owner,
            resources,
            cmd,
            touched: Vec::new(),
            open_pass: None,
            draw_ready: false,
        }
    }

    fn device(&self) -> &'a ash::Device {
        let owner = self.owner;
        &owner.device
    }

    fn touch(&mut self, image: ImageHandle) {
        if !self.touched.contains(&image) {
            self.touched.push(image);
        }
    }

    /// Move every mip of `image` into `layout` and return the native image.
    fn transition(
        &mut self,
        image: ImageHandle,
        layout: vk::ImageLayout,
    ) -> BackendResult<vk::Image> {
        let entry = self
            .resources
            .images
            .get_mut(&image.0)
            .ok_or(BackendError::InvalidHandle("image"))?;
        let native = entry.image;
        if entry.layout != layout {
            unsafe {
                image_barrier(
                    &self.owner.device,
                    self.cmd,
                    native,
                    entry.layout,
                    layout,
                    color_range(0, vk::REMAINING_MIP_LEVELS),
                );
            }
            entry.layout = layout;
        }
        self.touch(image);
        Ok(native)
    }

    fn buffer(&self, buffer: BufferHandle) -> BackendResult<vk::Buffer> {
        self.resources
            .buffers
            .get(&buffer.0)
            .map(|b| b.buffer)
            .ok_or(BackendError::InvalidHandle("buffer"))
    }

    pub(super) fn record(&mut self, commands: &CommandList) -> BackendResult<()> {
        for command in commands.iter() {
            self.record_one(command)?;
        }
        Ok(())
    }

    fn record_one(&mut self, command: &Command) -> BackendResult<()> {
        let device = self.device();
        let cmd = self.cmd;

        match command {
            Command::BeginRenderPass {
                render_pass,
                framebuffer,
                extent,
                clear_color,
            } => self.begin_pass(*render_pass, *framebuffer, *extent, *clear_color)?,
            Command::EndRenderPass => self.end_pass()?,
            Command::SetViewport { extent } => unsafe { self.set_viewport(*extent) },
            Command::SetLineWidth(width) => {
                if self.draw_ready {
                    let width = if self.owner.features.wide_lines {
                        *width
                    } else {
                        1.0
                    };
                    unsafe { device.cmd_set_line_width(cmd, width) };
                }
            }
            Command::BindPipeline(settings) => {
                self.draw_ready = false;
                let Some(pipeline) = self.draw_pipeline(settings)? else {
                    return Ok(());
                };
                unsafe {
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
                    device.cmd_set_line_width(cmd, 1.0);
                }
                self.draw_ready = true;
            }
            Command::BindDescriptorSet { index, set } => {
                let native = *self
                    .resources
                    .descriptor_sets
                    .get(&set.0)
                    .ok_or(BackendError::InvalidHandle("descriptor set"))?;
                if self.draw_ready {
                    unsafe {
                        device.cmd_bind_descriptor_sets(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            self.owner.layouts.draw,
                            *index,
                            &[native],
                            &[],
                        );
                    }
                }
            }
            Command::BindGeometry {
                buffer,
                index_offset,
                vertex_offset,
            } => {
                let native = self.buffer(*buffer)?;
                unsafe {
                    device.cmd_bind_index_buffer(cmd, native, *index_offset, vk::IndexType::UINT32);
                    device.cmd_bind_vertex_buffers(cmd, 0, &[native], &[*vertex_offset]);
                }
            }
            Command::DrawIndexed {
                index_count,
                instance_count,
                constants,
            } => {
                if self.draw_ready {
                    unsafe {
                        device.cmd_push_constants(
                            cmd,
                            self.owner.layouts.draw,
                            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                            0,
                            bytemuck::bytes_of(constants),
                        );
                        device.cmd_draw_indexed(
                            cmd,
                            *index_count,
                            *instance_count,
                            constants.index_offset,
                            constants.vertex_offset as i32,
                            0,
                        );
                    }
                }
            }
            Command::CopyBuffer { src, dst, size } => {
                let src = self.buffer(*src)?;
                let dst = self.buffer(*dst)?;
                let region = vk::BufferCopy::default().size(*size);
                let barrier = vk::MemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(
                        vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                            | vk::AccessFlags::INDEX_READ
                            | vk::AccessFlags::UNIFORM_READ
                            | vk::AccessFlags::SHADER_READ,
                    );
                unsafe {
                    device.cmd_copy_buffer(cmd, src, dst, &[region]);
                    device.cmd_pipeline_barrier(
                        cmd,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::VERTEX_INPUT
                            | vk::PipelineStageFlags::VERTEX_SHADER
                            | vk::PipelineStageFlags::FRAGMENT_SHADER,
                        vk::DependencyFlags::empty(),
                        &[barrier],
                        &[],
                        &[],
                    );
                }
            }
            Command::ResolveImage { src, dst, extent } => {
                let src = self.transition(*src, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
                let dst = self.transition(*dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
                let region = vk::ImageResolve::default()
                    .src_subresource(color_layers(0))
                    .dst_subresource(color_layers(0))
                    .extent(extent_3d(*extent));
                unsafe {
                    device.cmd_resolve_image(
                        cmd,
                        src,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
            }
            Command::Blur {
                source,
                sampler,
                render_pass,
                framebuffer,
                extent,
                direction,
                blur_type,
                amount,
            } => {
                let source_image = self
                    .resources
                    .views
                    .get(&source.0)
                    .map(|v| v.image)
                    .ok_or(BackendError::InvalidHandle("image view"))?;
                self.transition(source_image, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;

                let Some(pipeline) = self.blur_pipeline(*render_pass)? else {
                    return Ok(());
                };
                let set = self.blur_set(*source, *sampler)?;
                let constants = BlurConstants {
                    amount: amount.to_array(),
                    inv_extent: [
                        1.0 / extent.width.max(1) as f32,
                        1.0 / extent.height.max(1) as f32,
                    ],
                    direction: match direction {
                        BlurDirection::Horizontal => 0,
                        BlurDirection::Vertical => 1,
                    },
                    blur_type: match blur_type {
                        BlurType::None => 0,
                        BlurType::Box => 1,
                        BlurType::Gaussian => 2,
                    },
                };

                self.begin_pass(*render_pass, *framebuffer, *extent, [0.0; 4])?;
                unsafe {
                    self.set_viewport(*extent);
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.owner.layouts.blur,
                        0,
                        &[set],
                        &[],
                    );
                    device.cmd_push_constants(
                        cmd,
                        self.owner.layouts.blur,
                        vk::ShaderStageFlags::FRAGMENT,
                        0,
                        bytemuck::bytes_of(&constants),
                    );
                    device.cmd_draw(cmd, 3, 1, 0, 0);
                }
                self.end_pass()?;
            }
            Command::GenerateMipmaps {
                src,
                dst,
                extent,
                mip_levels,
            } => self.generate_mipmaps(*src, *dst, *extent, *mip_levels)?,
            Command::CopyImageToBuffer {
                image,
                buffer,
                extent,
            } => {
                let image = self.transition(*image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
                let buffer = self.buffer(*buffer)?;
                let region = vk::BufferImageCopy::default()
                    .image_subresource(color_layers(0))
                    .image_extent(extent_3d(*extent));
                let barrier = vk::BufferMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::HOST_READ)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE);
                unsafe {
                    device.cmd_copy_image_to_buffer(
                        cmd,
                        image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        buffer,
                        &[region],
                    );
                    device.cmd_pipeline_barrier(
                        cmd,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::HOST,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[barrier],
                        &[],
                    );
                }
            }
        }
        Ok(())
    }

    unsafe fn set_viewport(&self, extent: Extent2d) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: extent.width,
                height: extent.height,
            },
        };
        self.device().cmd_set_viewport(self.cmd, 0, &[viewport]);
        self.device().cmd_set_scissor(self.cmd, 0, &[scissor]);
    }

    fn begin_pass(
        &mut self,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2d,
        clear_color: [f32; 4],
    ) -> BackendResult<()> {
        if self.open_pass.is_some() {
            return Err(BackendError::RecordingFailed(
                "render pass begun inside another render pass".into(),
            ));
        }
        let pass = self
            .resources
            .render_passes
            .get(&render_pass.0)
            .ok_or(BackendError::InvalidHandle("render pass"))?
            .render_pass;
        let entry = self
            .resources
            .framebuffers
            .get(&framebuffer.0)
            .ok_or(BackendError::InvalidHandle("framebuffer"))?;
        let native = entry.framebuffer;
        let images = entry.images.clone();

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            },
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            },
        ];
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(pass)
            .framebuffer(native)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: extent.width,
                    height: extent.height,
                },
            })
            .clear_values(&clear_values[..images.len()]);
        unsafe {
            self.device()
                .cmd_begin_render_pass(self.cmd, &info, vk::SubpassContents::INLINE);
        }

        for image in images {
            self.touch(image);
        }
        self.open_pass = Some(framebuffer);
        self.draw_ready = false;
        Ok(())
    }

    fn end_pass(&mut self) -> BackendResult<()> {
        let framebuffer = self.open_pass.take().ok_or_else(|| {
            BackendError::RecordingFailed("render pass ended without being begun".into())
        })?;
        unsafe { self.device().cmd_end_render_pass(self.cmd) };
        self.draw_ready = false;

        let Some(entry) = self.resources.framebuffers.get(&framebuffer.0) else {
            return Ok(());
        };
        let Some(pass) = self.resources.render_passes.get(&entry.render_pass.0) else {
            return Ok(());
        };
        let final_layout = match pass.desc.final_layout {
            FinalLayout::Present => vk::ImageLayout::PRESENT_SRC_KHR,
            FinalLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            FinalLayout::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let layouts: Vec<_> = if pass.resolves() {
            entry
                .images
                .iter()
                .copied()
                .zip([vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, final_layout])
                .collect()
        } else {
            entry.images.iter().map(|i| (*i, final_layout)).collect()
        };
        for (image, layout) in layouts {
            if let Some(image) = self.resources.images.get_mut(&image.0) {
                image.layout = layout;
            }
        }
        Ok(())
    }

    fn draw_pipeline(&mut self, settings: &PipelineSettings) -> BackendResult<Option<vk::Pipeline>> {
        let Some(modules) = self.owner.shaders.as_ref() else {
            self.owner.warn_missing_shaders();
            return Ok(None);
        };
        if let Some(pipeline) = self.resources.draw_pipelines.get(settings) {
            return Ok(Some(*pipeline));
        }

        let render_pass = self
            .resources
            .render_passes
            .get(&settings.render_pass.0)
            .ok_or(BackendError::InvalidHandle("render pass"))?
            .render_pass;
        let pipeline = unsafe {
            create_draw_pipeline(
                &self.owner.device,
                &self.owner.layouts,
                modules,
                render_pass,
                settings,
                self.owner.features.non_solid_fill,
            )
        }
        .map_err(super::vk_error("graphics pipeline"))?;
        log::debug!("VulkanDevice: created draw pipeline {:?}", settings);
        self.resources.draw_pipelines.insert(*settings, pipeline);
        Ok(Some(pipeline))
    }

    fn blur_pipeline(&mut self, render_pass: RenderPassHandle) -> BackendResult<Option<vk::Pipeline>> {
        let Some(modules) = self.owner.shaders.as_ref() else {
            self.owner.warn_missing_shaders();
            return Ok(None);
        };
        if let Some(pipeline) = self.resources.blur_pipelines.get(&render_pass.0) {
            return Ok(Some(*pipeline));
        }

        let native = self
            .resources
            .render_passes
            .get(&render_pass.0)
            .ok_or(BackendError::InvalidHandle("render pass"))?
            .render_pass;
        let pipeline = unsafe {
            create_blur_pipeline(&self.owner.device, &self.owner.layouts, modules, native)
        }
        .map_err(super::vk_error("blur pipeline"))?;
        self.resources.blur_pipelines.insert(render_pass.0, pipeline);
        Ok(Some(pipeline))
    }

    fn blur_set(
        &mut self,
        source: ImageViewHandle,
        sampler: SamplerHandle,
    ) -> BackendResult<vk::DescriptorSet> {
        if let Some(set) = self.resources.blur_sets.get(&(source.0, sampler.0)) {
            return Ok(*set);
        }
        let view = self
            .resources
            .views
            .get(&source.0)
            .ok_or(BackendError::InvalidHandle("image view"))?
            .view;
        let native_sampler = *self
            .resources
            .samplers
            .get(&sampler.0)
            .ok_or(BackendError::InvalidHandle("sampler"))?;

        let set_layouts = [self.owner.layouts.blur_set];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.owner.descriptor_pool)
            .set_layouts(&set_layouts);
        let set = unsafe { self.device().allocate_descriptor_sets(&alloc_info) }
            .map_err(super::vk_error("descriptor set"))?[0];

        let sampler_info = [vk::DescriptorImageInfo::default().sampler(native_sampler)];
        let image_info = [vk::DescriptorImageInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .image_info(&sampler_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .image_info(&image_info),
        ];
        unsafe { self.device().update_descriptor_sets(&writes, &[]) };

        self.resources
            .blur_sets
            .insert((source.0, sampler.0), set);
        Ok(set)
    }

    fn generate_mipmaps(
        &mut self,
        src: ImageHandle,
        dst: ImageHandle,
        extent: Extent2d,
        mip_levels: u32,
    ) -> BackendResult<()> {
        let device = self.device();
        let cmd = self.cmd;
        let src = self.transition(src, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
        let dst_native = self.transition(dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        let mip_levels = mip_levels.max(1);

        let copy = vk::ImageCopy::default()
            .src_subresource(color_layers(0))
            .dst_subresource(color_layers(0))
            .extent(extent_3d(extent));

        unsafe {
            device.cmd_copy_image(
                cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_native,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );

            let mut width = extent.width.max(1) as i32;
            let mut height = extent.height.max(1) as i32;
            for level in 1..mip_levels {
                image_barrier(
                    device,
                    cmd,
                    dst_native,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    color_range(level - 1, 1),
                );

                let next_width = (width / 2).max(1);
                let next_height = (height / 2).max(1);
                let blit = vk::ImageBlit::default()
                    .src_subresource(color_layers(level - 1))
                    .src_offsets([
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: width,
                            y: height,
                            z: 1,
                        },
                    ])
                    .dst_subresource(color_layers(level))
                    .dst_offsets([
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: next_width,
                            y: next_height,
                            z: 1,
                        },
                    ]);
                device.cmd_blit_image(
                    cmd,
                    dst_native,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst_native,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
                width = next_width;
                height = next_height;
            }

            // Every level but the last is now a blit source.
            if mip_levels > 1 {
                image_barrier(
                    device,
                    cmd,
                    dst_native,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    color_range(0, mip_levels - 1),
                );
            }
            image_barrier(
                device,
                cmd,
                dst_native,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                color_range(mip_levels - 1, 1),
            );
        }

        if let Some(entry) = self.resources.images.get_mut(&dst.0) {
            entry.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        }
        Ok(())
    }

    /// Close an unterminated pass and return touched images to their
    /// resting layouts.
    pub(super) fn finish(mut self) {
        if self.open_pass.is_some() {
            log::warn!("VulkanDevice: command list left a render pass open");
            let _ = self.end_pass();
        }
        for image in std::mem::take(&mut self.touched) {
            let Some(entry) = self.resources.images.get_mut(&image.0) else {
                continue;
            };
            let Some(resting) = entry.resting_layout() else {
                continue;
            };
            if entry.layout != resting && entry.layout != vk::ImageLayout::UNDEFINED {
                unsafe {
                    image_barrier(
                        &self.owner.device,
                        self.cmd,
                        entry.image,
                        entry.layout,
                        resting,
                        color_range(0, vk::REMAINING_MIP_LEVELS),
                    );
                }
                entry.layout = resting;
            }
        }
    }
}
