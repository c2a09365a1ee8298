//! Presentation chain of a window.
//!
//! [`Swapchain`] owns the device chain, one view and framebuffer per chain
//! image, and the optional multisample attachments that resolve into them.
//! It never waits on frames itself: the window drains in-flight work before
//! calling [`Swapchain::recreate`].

use std::sync::Arc;

use crate::backend::guard::{CreationGuard, DeviceObject};
use crate::backend::*;
use crate::error::{RenderError, RenderResult};

/// Per-image objects of the chain.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SwapchainImage {
    pub image: ImageHandle,
    pub view: ImageViewHandle,
    pub framebuffer: FramebufferHandle,
    /// Multisample colour attachment resolving into `image`.
    pub msaa: Option<(ImageHandle, ImageViewHandle)>,
}

impl SwapchainImage {
    fn objects(&self) -> Vec<DeviceObject> {
        let mut objects = vec![
            DeviceObject::Framebuffer(self.framebuffer),
            DeviceObject::ImageView(self.view),
        ];
        if let Some((image, view)) = self.msaa {
            objects.push(DeviceObject::ImageView(view));
            objects.push(DeviceObject::Image(image));
        }
        objects
    }
}

/// Pick format, present mode, image count and extent for a chain.
pub(crate) fn choose_descriptor(
    caps: &SurfaceCapabilities,
    width: u32,
    height: u32,
    present_mode: PresentMode,
    preferred_image_count: Option<u32>,
) -> RenderResult<SwapchainDescriptor> {
    let format = if caps.formats.contains(&TextureFormat::Bgra8Unorm) {
        TextureFormat::Bgra8Unorm
    } else {
        *caps
            .formats
            .first()
            .ok_or_else(|| BackendError::creation("swapchain", "surface reports no formats"))?
    };

    let present_mode = if caps.present_modes.contains(&present_mode) {
        present_mode
    } else {
        // Always available
        PresentMode::Fifo
    };

    let max_images = if caps.max_image_count > 0 {
        caps.max_image_count
    } else {
        u32::MAX
    };
    let image_count = preferred_image_count
        .unwrap_or(caps.min_image_count + 1)
        .clamp(caps.min_image_count.max(1), max_images.max(1));

    let extent = match caps.current_extent {
        Some(extent) => extent,
        None => Extent2d::new(
            width.clamp(caps.min_extent.width, caps.max_extent.width.max(caps.min_extent.width)),
            height.clamp(
                caps.min_extent.height,
                caps.max_extent.height.max(caps.min_extent.height),
            ),
        ),
    };

    Ok(SwapchainDescriptor {
        extent,
        format,
        present_mode,
        image_count,
    })
}

pub(crate) struct Swapchain {
    device: Arc<dyn GpuDevice>,
    handle: Option<SwapchainHandle>,
    desc: SwapchainDescriptor,
    render_pass: Option<RenderPassHandle>,
    samples: Multisamples,
    images: Vec<SwapchainImage>,
    /// Signaled by the device once an acquired image may be written.
    acquire_fence: FenceHandle,
    requested: (u32, u32),
    present_mode: PresentMode,
    preferred_image_count: Option<u32>,
    stale: bool,
    generation: u64,
}

impl Swapchain {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        width: u32,
        height: u32,
        present_mode: PresentMode,
        samples: Multisamples,
        preferred_image_count: Option<u32>,
    ) -> RenderResult<Self> {
        let acquire_fence = device.create_fence(false)?;
        let mut swapchain = Self {
            device,
            handle: None,
            desc: SwapchainDescriptor {
                extent: Extent2d::new(width, height),
                format: TextureFormat::Bgra8Unorm,
                present_mode,
                image_count: 0,
            },
            render_pass: None,
            samples,
            images: Vec::new(),
            acquire_fence,
            requested: (width, height),
            present_mode,
            preferred_image_count,
            stale: true,
            generation: 0,
        };
        swapchain.recreate(width, height)?;
        Ok(swapchain)
    }

    pub fn extent(&self) -> Extent2d {
        self.desc.extent
    }

    pub fn format(&self) -> TextureFormat {
        self.desc.format
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn samples(&self) -> Multisamples {
        self.samples
    }

    /// Render pass the window records into; final layout is `Present`.
    pub fn render_pass(&self) -> Option<RenderPassHandle> {
        self.render_pass
    }

    pub fn image(&self, index: usize) -> Option<&SwapchainImage> {
        self.images.get(index)
    }

    /// Bumped by every rebuild.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn mark_stale(&mut self) {
        if !self.stale {
            log::debug!("Presentation chain marked stale");
        }
        self.stale = true;
    }

    /// Rebuild the chain for a `width` x `height` window.
    ///
    /// Returns `Ok(false)` if the chain is up to date and nothing was done.
    /// The caller must make sure no frame still uses the chain.
    pub fn recreate(&mut self, width: u32, height: u32) -> RenderResult<bool> {
        let caps = self.device.surface_capabilities()?;
        let desc = choose_descriptor(
            &caps,
            width,
            height,
            self.present_mode,
            self.preferred_image_count,
        )?;
        if !self.stale && self.handle.is_some() && desc == self.desc && self.requested == (width, height)
        {
            return Ok(false);
        }
        if desc.extent.is_empty() {
            return Err(RenderError::invalid(format!(
                "presentation chain size {}x{}",
                desc.extent.width, desc.extent.height
            )));
        }

        self.destroy_images();
        if self.render_pass.is_some() && desc.format != self.desc.format {
            if let Some(render_pass) = self.render_pass.take() {
                self.device.destroy_render_pass(render_pass);
            }
        }
        if self.render_pass.is_none() {
            self.render_pass = Some(self.device.create_render_pass(&RenderPassDescriptor {
                label: Some("window".into()),
                format: desc.format,
                samples: self.samples,
                final_layout: FinalLayout::Present,
            })?);
        }

        let old = self.handle.take();
        let created = self.device.create_swapchain(&desc, old);
        if let Some(old) = old {
            self.device.destroy_swapchain(old);
        }
        let handle = created?;
        self.handle = Some(handle);
        self.desc = desc;
        self.requested = (width, height);

        self.images = self.create_images(handle)?;
        self.stale = false;
        self.generation += 1;

        log::debug!(
            "Created presentation chain {}x{} {:?} {:?} with {} images (generation {})",
            self.desc.extent.width,
            self.desc.extent.height,
            self.desc.format,
            self.desc.present_mode,
            self.images.len(),
            self.generation
        );
        Ok(true)
    }

    fn create_images(&self, handle: SwapchainHandle) -> RenderResult<Vec<SwapchainImage>> {
        let render_pass = self
            .render_pass
            .ok_or_else(|| BackendError::creation("framebuffer", "no render pass"))?;
        let extent = self.desc.extent;

        let mut guard = CreationGuard::new(self.device.as_ref());
        let mut images = Vec::new();
        for (index, image) in self.device.swapchain_images(handle)?.into_iter().enumerate() {
            let view = guard.image_view(image)?;
            let msaa = if self.samples.is_multisampled() {
                let msaa_image = guard.image(&ImageDescriptor {
                    label: Some(format!("window msaa {index}")),
                    extent,
                    mip_levels: 1,
                    samples: self.samples,
                    format: self.desc.format,
                    usage: ImageUsage::COLOR_ATTACHMENT,
                })?;
                Some((msaa_image, guard.image_view(msaa_image)?))
            } else {
                None
            };

            let attachments = match msaa {
                Some((_, msaa_view)) => vec![msaa_view, view],
                None => vec![view],
            };
            let framebuffer = guard.framebuffer(&FramebufferDescriptor {
                render_pass,
                attachments,
                extent,
            })?;
            images.push(SwapchainImage {
                image,
                view,
                framebuffer,
                msaa,
            });
        }
        guard.finish();
        Ok(images)
    }

    fn destroy_images(&mut self) {
        for image in self.images.drain(..) {
            for object in image.objects() {
                object.destroy(self.device.as_ref());
            }
        }
    }

    /// Acquire the next image and wait until it may be written.
    ///
    /// A stale chain, or one the device reports out of date, gives
    /// [`RenderError::Stale`]. A suboptimal image is still returned and the
    /// chain is rebuilt before the next frame.
    pub fn acquire(&mut self) -> RenderResult<u32> {
        let handle = match self.handle {
            Some(handle) if !self.stale => handle,
            _ => return Err(RenderError::Stale),
        };

        let index = match self.device.acquire_next_image(handle, self.acquire_fence)? {
            AcquireOutcome::Ready(index) => index,
            AcquireOutcome::Suboptimal(index) => {
                log::trace!("Presentation chain suboptimal");
                self.mark_stale();
                index
            }
            AcquireOutcome::OutOfDate => {
                log::debug!("Presentation chain out of date");
                self.mark_stale();
                return Err(RenderError::Stale);
            }
        };

        self.device.wait_fence(self.acquire_fence, None)?;
        self.device.reset_fence(self.acquire_fence)?;
        log::trace!("Acquired image {}", index);
        Ok(index)
    }

    /// Queue `index` for presentation after `wait` is signaled.
    ///
    /// Suboptimal and out-of-date results only mark the chain stale.
    pub fn present(&mut self, index: u32, wait: SemaphoreHandle) -> RenderResult<()> {
        let handle = self
            .handle
            .ok_or_else(|| RenderError::protocol("present without a presentation chain"))?;
        match self.device.present(handle, index, wait)? {
            PresentOutcome::Presented => {}
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => {
                log::trace!("Present reported the chain as stale");
                self.mark_stale();
            }
        }
        Ok(())
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_images();
        if let Some(render_pass) = self.render_pass.take() {
            self.device.destroy_render_pass(render_pass);
        }
        if let Some(handle) = self.handle.take() {
            self.device.destroy_swapchain(handle);
        }
        self.device.destroy_fence(self.acquire_fence);
    }
}

impl std::fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("desc", &self.desc)
            .field("images", &self.images.len())
            .field("stale", &self.stale)
            .field("generation", &self.generation)
            .finish()
    }
}
