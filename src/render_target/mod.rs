//! Off-screen render targets.
//!
//! A [`RenderTargetTexture`] is drawn into between
//! [`begin_render`](RenderTargetTexture::begin_render) and
//! [`end_render`](RenderTargetTexture::end_render), and sampled through
//! [`texture`](RenderTargetTexture::texture) like any other texture, by a
//! window or by another render target, in the same frame.
//!
//! Nothing is submitted when recording ends. The render is committed lazily
//! by the first consumer that is submitted, after everything it samples
//! itself. See [`arena`] for the per-swap-buffer state machine and
//! [`dependency`] for the consumer side.

pub mod arena;
mod attachments;
pub mod dependency;

pub use arena::{CommitState, RenderTargetArena, RenderTargetId, SwapBufferStatus};
pub use attachments::RenderTargetTextureType;
pub use dependency::{DependencyInfo, DependencySet, DependencyTracker, SubmissionCollector};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use glam::Vec2;

use crate::backend::*;
use crate::config::RenderTargetTextureCreateInfo;
use crate::draw::{DrawGeometry, Primitive, RecordTarget};
use crate::error::{RenderError, RenderResult};
use crate::instance::Instance;
use crate::report::ReportSeverity;
use crate::resources::{Mesh, Sampler, Texture};

use arena::{RenderTargetEntry, SWAP_BUFFER_COUNT};
use attachments::BlurRequest;

/// State of a render target readable without locking the arena.
#[derive(Debug)]
pub(crate) struct RenderTargetShared {
    data_ready: AtomicBool,
    width: AtomicU32,
    height: AtomicU32,
}

impl RenderTargetShared {
    pub fn new(extent: Extent2d) -> Self {
        Self {
            data_ready: AtomicBool::new(false),
            width: AtomicU32::new(extent.width),
            height: AtomicU32::new(extent.height),
        }
    }

    fn set_data_ready(&self, ready: bool) {
        self.data_ready.store(ready, Ordering::Release);
    }

    fn set_extent(&self, extent: Extent2d) {
        self.width.store(extent.width, Ordering::Relaxed);
        self.height.store(extent.height, Ordering::Relaxed);
    }
}

/// Non-owning reference to a render target, as held by [`Texture`].
#[derive(Debug, Clone)]
pub struct RenderTargetRef {
    id: RenderTargetId,
    shared: Arc<RenderTargetShared>,
}

impl RenderTargetRef {
    pub fn id(&self) -> RenderTargetId {
        self.id
    }

    /// Whether a render has ended since creation or the last resize.
    pub fn is_data_ready(&self) -> bool {
        self.shared.data_ready.load(Ordering::Acquire)
    }

    pub fn extent(&self) -> Extent2d {
        Extent2d::new(
            self.shared.width.load(Ordering::Relaxed),
            self.shared.height.load(Ordering::Relaxed),
        )
    }
}

/// Owning handle of an off-screen render target.
///
/// Dropping it waits for in-flight renders and releases the GPU objects.
/// Consumers that still reference it fail their next commit with
/// [`RenderError::Released`].
pub struct RenderTargetTexture {
    instance: Arc<Instance>,
    id: RenderTargetId,
    shared: Arc<RenderTargetShared>,
}

impl RenderTargetTexture {
    pub fn new(instance: &Arc<Instance>, info: &RenderTargetTextureCreateInfo) -> RenderResult<Self> {
        let result = Self::create(instance, info);
        instance.reporter().check(result)
    }

    fn create(instance: &Arc<Instance>, info: &RenderTargetTextureCreateInfo) -> RenderResult<Self> {
        let extent = Extent2d::new(info.width, info.height);
        if extent.is_empty() {
            return Err(RenderError::invalid(format!(
                "render target size {}x{}",
                info.width, info.height
            )));
        }

        let shared = Arc::new(RenderTargetShared::new(extent));
        let entry = RenderTargetEntry::create(
            instance.device().as_ref(),
            format!("render target {}x{}", extent.width, extent.height),
            extent,
            info.samples,
            info.enable_blur,
            info.clear_color,
        )?;
        let id = instance.render_targets().insert(entry);

        Ok(Self {
            instance: Arc::clone(instance),
            id,
            shared,
        })
    }

    pub fn id(&self) -> RenderTargetId {
        self.id
    }

    pub fn size(&self) -> Extent2d {
        self.texture_ref().extent()
    }

    pub fn is_data_ready(&self) -> bool {
        self.texture_ref().is_data_ready()
    }

    fn texture_ref(&self) -> RenderTargetRef {
        RenderTargetRef {
            id: self.id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// This target as something draws can sample.
    pub fn texture(&self) -> Texture {
        Texture::RenderTarget(self.texture_ref())
    }

    /// State of one swap buffer.
    pub fn swap_status(&self, swap_index: usize) -> Option<SwapBufferStatus> {
        self.instance
            .render_targets()
            .swap_status(self.id, swap_index)
    }

    /// Start recording into the next swap buffer.
    ///
    /// If that buffer's previous render was submitted, this blocks until the
    /// GPU has finished it.
    pub fn begin_render(&mut self) -> RenderResult<()> {
        let result = self.begin_render_inner();
        self.instance.reporter().check(result)
    }

    fn begin_render_inner(&mut self) -> RenderResult<()> {
        let device = Arc::clone(self.instance.device());
        let mut arena = self.instance.render_targets();
        let entry = arena.get_mut(self.id).ok_or(RenderError::Released)?;
        if entry.recording {
            return Err(RenderError::protocol("begin_render called twice"));
        }

        let next = (entry.current + 1) % SWAP_BUFFER_COUNT;
        let swap = &mut entry.swap_buffers[next];
        if swap.state == CommitState::Submitted {
            log::trace!(
                "{}: waiting for swap {} to reach {}",
                entry.label,
                next,
                swap.render_counter
            );
            device.wait_semaphore(swap.render_complete, swap.render_counter, None)?;
        }
        swap.reset_recording();

        entry.current = next;
        entry.recording = true;
        Ok(())
    }

    /// Finish recording. The render runs when the first consumer submits.
    ///
    /// A blur is only applied by targets created with `enable_blur`.
    pub fn end_render(&mut self, blur_type: BlurType, amount: Vec2) -> RenderResult<()> {
        let result = self.end_render_inner(blur_type, amount);
        self.instance.reporter().check(result)
    }

    fn end_render_inner(&mut self, blur_type: BlurType, amount: Vec2) -> RenderResult<()> {
        let mut request = BlurRequest { blur_type, amount };
        let ignored_blur = {
            let mut arena = self.instance.render_targets();
            let entry = arena.get_mut(self.id).ok_or(RenderError::Released)?;
            if !entry.recording {
                return Err(RenderError::protocol("end_render without begin_render"));
            }

            let ignored_blur = request.is_active() && !entry.kind.has_blur();
            if ignored_blur {
                request = BlurRequest::default();
            }

            let current = entry.current;
            let swap = &mut entry.swap_buffers[current];
            swap.finalize = request;
            swap.has_pending_render = true;
            entry.recording = false;
            entry.last_rendered = Some(current);
            ignored_blur
        };
        self.shared.set_data_ready(true);

        if ignored_blur {
            self.instance.reporter().report(
                ReportSeverity::Warning,
                "Blur requested on a render target created without blur support; ignored",
            );
        }
        Ok(())
    }

    fn draw(
        &mut self,
        primitive: Primitive,
        geometry: DrawGeometry<'_>,
        texture: Option<&Texture>,
        sampler: Option<&Sampler>,
        line_width: f32,
    ) -> RenderResult<()> {
        // Resolving a render-target texture locks the arena itself.
        let bindings = self.instance.resolve_bindings(texture, sampler)?;

        let mut arena = self.instance.render_targets();
        let entry = arena.get_mut(self.id).ok_or(RenderError::Released)?;
        if !entry.recording {
            return Err(RenderError::protocol(
                "draw on a render target outside begin_render/end_render",
            ));
        }

        let target = RecordTarget {
            render_pass: entry.passes.render_pass,
            samples: entry.samples,
        };
        let current = entry.current;
        let swap = &mut entry.swap_buffers[current];
        swap.recorder
            .record(target, &mut swap.mesh, primitive, geometry, &bindings, line_width)?;
        if let Some(dependency) = bindings.dependency {
            swap.dependencies.insert(dependency);
        }
        Ok(())
    }

    pub fn draw_triangle_list(
        &mut self,
        geometry: DrawGeometry<'_>,
        filled: bool,
        texture: Option<&Texture>,
        sampler: Option<&Sampler>,
    ) -> RenderResult<()> {
        let result = self.draw(Primitive::Triangles { filled }, geometry, texture, sampler, 1.0);
        self.instance.reporter().check(result)
    }

    pub fn draw_line_list(
        &mut self,
        geometry: DrawGeometry<'_>,
        texture: Option<&Texture>,
        sampler: Option<&Sampler>,
        line_width: f32,
    ) -> RenderResult<()> {
        let result = self.draw(Primitive::Lines, geometry, texture, sampler, line_width);
        self.instance.reporter().check(result)
    }

    /// Draw every vertex as a point; indices are ignored.
    pub fn draw_point_list(
        &mut self,
        geometry: DrawGeometry<'_>,
        texture: Option<&Texture>,
        sampler: Option<&Sampler>,
    ) -> RenderResult<()> {
        let result = self.draw(Primitive::Points, geometry, texture, sampler, 1.0);
        self.instance.reporter().check(result)
    }

    pub fn draw_mesh(&mut self, mesh: &Mesh, transformations: &[glam::Mat4]) -> RenderResult<()> {
        let geometry = DrawGeometry::new(&mesh.indices, &mesh.vertices)
            .with_texture_layer_weights(&mesh.texture_layer_weights)
            .with_transformations(transformations);
        let result = self.draw(
            Primitive::from_mesh_type(mesh.mesh_type),
            geometry,
            mesh.texture.as_ref(),
            mesh.sampler.as_ref(),
            mesh.line_width,
        );
        self.instance.reporter().check(result)
    }

    /// Resize the target. Previous contents are lost and the target is not
    /// data ready until the next `end_render`.
    pub fn set_size(&mut self, width: u32, height: u32) -> RenderResult<()> {
        let result = self.set_size_inner(Extent2d::new(width, height));
        self.instance.reporter().check(result)
    }

    fn set_size_inner(&mut self, extent: Extent2d) -> RenderResult<()> {
        if extent.is_empty() {
            return Err(RenderError::invalid(format!(
                "render target size {}x{}",
                extent.width, extent.height
            )));
        }

        let device = Arc::clone(self.instance.device());
        let old_views = {
            let mut arena = self.instance.render_targets();
            let entry = arena.get_mut(self.id).ok_or(RenderError::Released)?;
            if entry.recording {
                return Err(RenderError::protocol("set_size while recording"));
            }
            if entry.extent == extent {
                return Ok(());
            }

            entry.drain(device.as_ref(), None)?;
            let old_views = entry.sampled_views();
            entry.recreate_images(device.as_ref(), extent)?;
            old_views
        };

        self.instance.forget_texture_views(&old_views);
        self.shared.set_extent(extent);
        self.shared.set_data_ready(false);
        log::debug!(
            "Resized render target {:?} to {}x{}",
            self.id,
            extent.width,
            extent.height
        );
        Ok(())
    }

    /// Block until every submitted render of this target has finished.
    pub fn wait_idle(&self) -> RenderResult<()> {
        let device = Arc::clone(self.instance.device());
        let result = match self.instance.render_targets().get(self.id) {
            Some(entry) => entry
                .drain(device.as_ref(), None)
                .map(|_| ())
                .map_err(RenderError::from),
            None => Err(RenderError::Released),
        };
        self.instance.reporter().check(result)
    }
}

impl Drop for RenderTargetTexture {
    fn drop(&mut self) {
        self.shared.set_data_ready(false);
        let removed = self.instance.render_targets().remove(self.id);
        let Some(mut entry) = removed else {
            return;
        };

        let device = Arc::clone(self.instance.device());
        let timeout = self.instance.shutdown_timeout();
        match entry.drain(device.as_ref(), Some(timeout)) {
            Ok(true) => {}
            Ok(false) => self.instance.reporter().report(
                ReportSeverity::Warning,
                format!(
                    "{}: renders still running after {:?}; destroying anyway",
                    entry.label, timeout
                ),
            ),
            Err(e) => log::warn!("{}: destroying with renders in flight: {}", entry.label, e),
        }
        self.instance.forget_texture_views(&entry.sampled_views());
        entry.destroy(device.as_ref());
    }
}

impl std::fmt::Debug for RenderTargetTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTargetTexture")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("data_ready", &self.is_data_ready())
            .finish()
    }
}

static_assertions::assert_impl_all!(RenderTargetTexture: Send);
static_assertions::assert_impl_all!(RenderTargetRef: Send, Sync);
