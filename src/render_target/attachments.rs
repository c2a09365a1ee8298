//! GPU objects behind one render-target swap buffer.
//!
//! | Type | attachment | buffer 1 | buffer 2 |
//! |------|------------|----------|----------|
//! | `Direct` | render | | |
//! | `WithMultisample` | render (MS) | resolve | |
//! | `WithBlur` | render, blur pass 2 | blur pass 1 | |
//! | `WithMultisampleAndBlur` | render (MS) | resolve, blur pass 2 | blur pass 1 |
//!
//! Every type ends by generating mip maps into the sampled image.

use glam::Vec2;

use crate::backend::guard::{CreationGuard, DeviceObject};
use crate::backend::*;

/// Which finalize steps a render target runs after its draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderTargetTextureType {
    /// No multisample, no blur.
    Direct,
    /// Multisampled, no blur.
    WithMultisample,
    /// No multisample, blur available.
    WithBlur,
    /// Multisampled, blur available.
    WithMultisampleAndBlur,
}

impl RenderTargetTextureType {
    pub fn determine(samples: Multisamples, enable_blur: bool) -> Self {
        match (samples.is_multisampled(), enable_blur) {
            (false, false) => RenderTargetTextureType::Direct,
            (true, false) => RenderTargetTextureType::WithMultisample,
            (false, true) => RenderTargetTextureType::WithBlur,
            (true, true) => RenderTargetTextureType::WithMultisampleAndBlur,
        }
    }

    pub fn is_multisampled(&self) -> bool {
        matches!(
            self,
            RenderTargetTextureType::WithMultisample
                | RenderTargetTextureType::WithMultisampleAndBlur
        )
    }

    pub fn has_blur(&self) -> bool {
        matches!(
            self,
            RenderTargetTextureType::WithBlur | RenderTargetTextureType::WithMultisampleAndBlur
        )
    }

    fn needs_buffer_1(&self) -> bool {
        *self != RenderTargetTextureType::Direct
    }

    fn needs_buffer_2(&self) -> bool {
        *self == RenderTargetTextureType::WithMultisampleAndBlur
    }
}

/// Blur requested by `end_render`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct BlurRequest {
    pub blur_type: BlurType,
    pub amount: Vec2,
}

impl BlurRequest {
    pub fn is_active(&self) -> bool {
        self.blur_type != BlurType::None && (self.amount.x > 0.0 || self.amount.y > 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ImageWithView {
    pub image: ImageHandle,
    pub view: ImageViewHandle,
}

/// Shared per-target objects used by every swap buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PassObjects {
    pub render_pass: RenderPassHandle,
    pub blur_pass: Option<RenderPassHandle>,
    pub blur_sampler: Option<SamplerHandle>,
}

impl PassObjects {
    pub fn create(
        guard: &mut CreationGuard<'_>,
        kind: RenderTargetTextureType,
        format: TextureFormat,
        samples: Multisamples,
    ) -> BackendResult<Self> {
        let render_pass = guard.render_pass(&RenderPassDescriptor {
            label: Some("render target".into()),
            format,
            samples,
            final_layout: FinalLayout::TransferSrc,
        })?;

        let (blur_pass, blur_sampler) = if kind.has_blur() {
            let pass = guard.render_pass(&RenderPassDescriptor {
                label: Some("render target blur".into()),
                format,
                samples: Multisamples::X1,
                final_layout: FinalLayout::TransferSrc,
            })?;
            let sampler = guard.sampler(&SamplerDescriptor {
                label: Some("render target blur".into()),
                address_mode_u: AddressMode::ClampToEdge,
                address_mode_v: AddressMode::ClampToEdge,
                ..Default::default()
            })?;
            (Some(pass), Some(sampler))
        } else {
            (None, None)
        };

        Ok(Self {
            render_pass,
            blur_pass,
            blur_sampler,
        })
    }

    pub fn objects(&self) -> Vec<DeviceObject> {
        let mut objects = vec![DeviceObject::RenderPass(self.render_pass)];
        objects.extend(self.blur_pass.map(DeviceObject::RenderPass));
        objects.extend(self.blur_sampler.map(DeviceObject::Sampler));
        objects
    }
}

/// Images and framebuffers of one swap buffer.
#[derive(Debug, Clone)]
pub(crate) struct SwapBufferImages {
    pub attachment: ImageWithView,
    pub buffer_1: Option<ImageWithView>,
    pub buffer_2: Option<ImageWithView>,
    /// Mip-mapped output that consumers sample.
    pub sampled: ImageWithView,
    pub render_framebuffer: FramebufferHandle,
    pub blur_framebuffer_1: Option<FramebufferHandle>,
    pub blur_framebuffer_2: Option<FramebufferHandle>,
}

fn create_image(
    guard: &mut CreationGuard<'_>,
    label: String,
    extent: Extent2d,
    format: TextureFormat,
    samples: Multisamples,
    mip_levels: u32,
    usage: ImageUsage,
) -> BackendResult<ImageWithView> {
    let image = guard.image(&ImageDescriptor {
        label: Some(label),
        extent,
        mip_levels,
        samples,
        format,
        usage,
    })?;
    let view = guard.image_view(image)?;
    Ok(ImageWithView { image, view })
}

impl SwapBufferImages {
    pub fn create(
        guard: &mut CreationGuard<'_>,
        label: &str,
        kind: RenderTargetTextureType,
        passes: &PassObjects,
        extent: Extent2d,
        format: TextureFormat,
        samples: Multisamples,
    ) -> BackendResult<Self> {
        let intermediate = ImageUsage::COLOR_ATTACHMENT
            | ImageUsage::SAMPLED
            | ImageUsage::TRANSFER_SRC
            | ImageUsage::TRANSFER_DST;

        let attachment = create_image(
            guard,
            format!("{label} attachment"),
            extent,
            format,
            samples,
            1,
            ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED | ImageUsage::TRANSFER_SRC,
        )?;
        let buffer_1 = if kind.needs_buffer_1() {
            Some(create_image(
                guard,
                format!("{label} buffer 1"),
                extent,
                format,
                Multisamples::X1,
                1,
                intermediate,
            )?)
        } else {
            None
        };
        let buffer_2 = if kind.needs_buffer_2() {
            Some(create_image(
                guard,
                format!("{label} buffer 2"),
                extent,
                format,
                Multisamples::X1,
                1,
                intermediate,
            )?)
        } else {
            None
        };
        let sampled = create_image(
            guard,
            format!("{label} sampled"),
            extent,
            format,
            Multisamples::X1,
            extent.mip_levels(),
            ImageUsage::SAMPLED | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST,
        )?;

        let render_framebuffer = guard.framebuffer(&FramebufferDescriptor {
            render_pass: passes.render_pass,
            attachments: vec![attachment.view],
            extent,
        })?;

        // Pass 1 writes into the first free intermediate, pass 2 writes back
        // into the image mip maps are generated from.
        let blur_targets = match kind {
            RenderTargetTextureType::WithBlur => Some((buffer_1, Some(attachment))),
            RenderTargetTextureType::WithMultisampleAndBlur => Some((buffer_2, buffer_1)),
            _ => None,
        };
        let (blur_framebuffer_1, blur_framebuffer_2) = match (blur_targets, passes.blur_pass) {
            (Some((Some(first), Some(second))), Some(blur_pass)) => {
                let first = guard.framebuffer(&FramebufferDescriptor {
                    render_pass: blur_pass,
                    attachments: vec![first.view],
                    extent,
                })?;
                let second = guard.framebuffer(&FramebufferDescriptor {
                    render_pass: blur_pass,
                    attachments: vec![second.view],
                    extent,
                })?;
                (Some(first), Some(second))
            }
            _ => (None, None),
        };

        Ok(Self {
            attachment,
            buffer_1,
            buffer_2,
            sampled,
            render_framebuffer,
            blur_framebuffer_1,
            blur_framebuffer_2,
        })
    }

    /// Commands that turn the rendered attachment into the sampled image.
    pub fn finalize_commands(
        &self,
        kind: RenderTargetTextureType,
        passes: &PassObjects,
        extent: Extent2d,
        blur: BlurRequest,
    ) -> Vec<Command> {
        let mut commands = Vec::new();

        // Image holding the single-sampled render result.
        let mut result = self.attachment;
        if kind.is_multisampled() {
            if let Some(resolved) = self.buffer_1 {
                commands.push(Command::ResolveImage {
                    src: self.attachment.image,
                    dst: resolved.image,
                    extent,
                });
                result = resolved;
            }
        }

        if blur.is_active() {
            let first_target = match kind {
                RenderTargetTextureType::WithBlur => self.buffer_1,
                _ => self.buffer_2,
            };
            if let (Some(first), Some(fb_1), Some(fb_2), Some(pass), Some(sampler)) = (
                first_target,
                self.blur_framebuffer_1,
                self.blur_framebuffer_2,
                passes.blur_pass,
                passes.blur_sampler,
            ) {
                commands.push(Command::Blur {
                    source: result.view,
                    sampler,
                    render_pass: pass,
                    framebuffer: fb_1,
                    extent,
                    direction: BlurDirection::Horizontal,
                    blur_type: blur.blur_type,
                    amount: blur.amount,
                });
                commands.push(Command::Blur {
                    source: first.view,
                    sampler,
                    render_pass: pass,
                    framebuffer: fb_2,
                    extent,
                    direction: BlurDirection::Vertical,
                    blur_type: blur.blur_type,
                    amount: blur.amount,
                });
            }
        }

        commands.push(Command::GenerateMipmaps {
            src: result.image,
            dst: self.sampled.image,
            extent,
            mip_levels: extent.mip_levels(),
        });
        commands
    }

    /// Views consumers may have descriptor sets for.
    pub fn sampled_view(&self) -> ImageViewHandle {
        self.sampled.view
    }

    pub fn objects(&self) -> Vec<DeviceObject> {
        let mut objects = vec![DeviceObject::Framebuffer(self.render_framebuffer)];
        objects.extend(self.blur_framebuffer_1.map(DeviceObject::Framebuffer));
        objects.extend(self.blur_framebuffer_2.map(DeviceObject::Framebuffer));
        for image in [Some(self.attachment), self.buffer_1, self.buffer_2, Some(self.sampled)]
            .into_iter()
            .flatten()
        {
            objects.push(DeviceObject::ImageView(image.view));
            objects.push(DeviceObject::Image(image.image));
        }
        objects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(kind: RenderTargetTextureType) -> (DummyDevice, PassObjects, SwapBufferImages) {
        let device = DummyDevice::new();
        let samples = if kind.is_multisampled() {
            Multisamples::X4
        } else {
            Multisamples::X1
        };
        let (passes, images) = {
            let mut guard = CreationGuard::new(&device);
            let passes =
                PassObjects::create(&mut guard, kind, TextureFormat::Rgba8Unorm, samples).unwrap();
            let images = SwapBufferImages::create(
                &mut guard,
                "test",
                kind,
                &passes,
                Extent2d::new(64, 64),
                TextureFormat::Rgba8Unorm,
                samples,
            )
            .unwrap();
            guard.finish();
            (passes, images)
        };
        (device, passes, images)
    }

    fn kinds(commands: &[Command]) -> Vec<&'static str> {
        commands
            .iter()
            .map(|c| match c {
                Command::ResolveImage { .. } => "resolve",
                Command::Blur { .. } => "blur",
                Command::GenerateMipmaps { .. } => "mipmaps",
                _ => "other",
            })
            .collect()
    }

    #[test]
    fn test_type_determination() {
        assert_eq!(
            RenderTargetTextureType::determine(Multisamples::X1, false),
            RenderTargetTextureType::Direct
        );
        assert_eq!(
            RenderTargetTextureType::determine(Multisamples::X4, true),
            RenderTargetTextureType::WithMultisampleAndBlur
        );
    }

    #[test]
    fn test_finalize_steps_per_type() {
        let blur = BlurRequest {
            blur_type: BlurType::Gaussian,
            amount: Vec2::splat(4.0),
        };
        let extent = Extent2d::new(64, 64);

        let (_d, passes, images) = build(RenderTargetTextureType::Direct);
        assert_eq!(
            kinds(&images.finalize_commands(RenderTargetTextureType::Direct, &passes, extent, blur)),
            vec!["mipmaps"]
        );

        let (_d, passes, images) = build(RenderTargetTextureType::WithMultisample);
        assert_eq!(
            kinds(&images.finalize_commands(
                RenderTargetTextureType::WithMultisample,
                &passes,
                extent,
                blur
            )),
            vec!["resolve", "mipmaps"]
        );

        let (_d, passes, images) = build(RenderTargetTextureType::WithBlur);
        assert_eq!(
            kinds(&images.finalize_commands(RenderTargetTextureType::WithBlur, &passes, extent, blur)),
            vec!["blur", "blur", "mipmaps"]
        );
        assert_eq!(
            kinds(&images.finalize_commands(
                RenderTargetTextureType::WithBlur,
                &passes,
                extent,
                BlurRequest::default()
            )),
            vec!["mipmaps"]
        );

        let (_d, passes, images) = build(RenderTargetTextureType::WithMultisampleAndBlur);
        assert_eq!(
            kinds(&images.finalize_commands(
                RenderTargetTextureType::WithMultisampleAndBlur,
                &passes,
                extent,
                blur
            )),
            vec!["resolve", "blur", "blur", "mipmaps"]
        );
    }
}
