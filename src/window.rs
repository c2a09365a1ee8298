//! Presentable window.
//!
//! # Frame flow
//!
//! ```text
//! begin_frame ── poll screenshot, apply debounced resize
//!      │         acquire slot (one rebuild + retry on a stale chain)
//!      │         wait for the slot if its last frame is unsynchronized
//!      ▼
//!   draw_*   ── recorded into the slot's geometry buffer; sampled
//!      │        render targets are noted as dependencies
//!      ▼
//! end_frame  ── record window transfer + render
//!               synchronize the previous frame
//!               commit sampled render targets, submit everything, present
//! ```

use std::path::Path;
use std::sync::Arc;

use glam::Mat4;

use crate::backend::*;
use crate::config::WindowConfig;
use crate::draw::{DrawGeometry, DrawRecorder, PassBegin, Primitive, RecordTarget};
use crate::error::{RenderError, RenderResult};
use crate::frame::FrameSet;
use crate::instance::Instance;
use crate::render_target::{DependencySet, DependencyTracker, SubmissionCollector};
use crate::resize::ResizeManager;
use crate::resources::{Mesh, Sampler, Texture};
use crate::screenshot::{ScreenshotHandler, ScreenshotManager};
use crate::submission;
use crate::swapchain::Swapchain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    Recording { slot: usize, image_index: u32 },
    /// Minimised: the frame is accepted and dropped.
    Skipped,
}

/// Confirms everything a finished frame sampled and reads back its
/// screenshot. Borrows only the fields it needs so it can run while the
/// frame set is borrowed.
fn on_frame_finished<'a>(
    instance: &'a Instance,
    tracker: &'a mut DependencyTracker,
    screenshot: &'a mut ScreenshotManager,
) -> impl FnMut(usize) + 'a {
    move |slot| {
        tracker.confirm_finished(slot, &mut instance.render_targets());
        screenshot.on_frame_finished(slot);
    }
}

/// A window drawn into between [`begin_frame`](Window::begin_frame) and
/// [`end_frame`](Window::end_frame).
pub struct Window {
    instance: Arc<Instance>,
    config: WindowConfig,
    swapchain: Swapchain,
    frames: FrameSet,
    tracker: DependencyTracker,
    resize: ResizeManager,
    screenshot: ScreenshotManager,
    recorder: DrawRecorder,
    state: FrameState,
}

impl Window {
    pub fn new(instance: &Arc<Instance>, config: WindowConfig) -> RenderResult<Self> {
        let result = Self::create(instance, config);
        instance.reporter().check(result)
    }

    fn create(instance: &Arc<Instance>, config: WindowConfig) -> RenderResult<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(RenderError::invalid(format!(
                "window size {}x{}",
                config.width, config.height
            )));
        }

        let device = Arc::clone(instance.device());
        let swapchain = Swapchain::new(
            Arc::clone(&device),
            config.width,
            config.height,
            config.present_mode,
            config.samples,
            config.preferred_image_count,
        )?;
        let slot_count = swapchain.image_count();
        let frames = FrameSet::new(Arc::clone(&device), slot_count, config.frame_timeout)?;

        let extent = swapchain.extent();
        let mut resize =
            ResizeManager::new((extent.width, extent.height), config.resize_debounce_ms);
        resize.set_min_size(config.min_size.0, config.min_size.1);

        let screenshot = ScreenshotManager::new(
            device,
            instance.reporter().clone(),
            Arc::clone(instance.task_runner()),
        );

        log::info!(
            "Created window {}x{} with {} slots ({:?}, {:?})",
            extent.width,
            extent.height,
            slot_count,
            config.present_mode,
            config.samples
        );
        Ok(Self {
            instance: Arc::clone(instance),
            config,
            swapchain,
            frames,
            tracker: DependencyTracker::new(slot_count),
            resize,
            screenshot,
            recorder: DrawRecorder::new(),
            state: FrameState::Idle,
        })
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Size of the presentation chain.
    pub fn size(&self) -> Extent2d {
        self.swapchain.extent()
    }

    /// Number of presentable slots, one per chain image.
    pub fn slot_count(&self) -> usize {
        self.frames.slot_count()
    }

    /// Frames submitted so far.
    pub fn frame_count(&self) -> u64 {
        self.frames.frame_count()
    }

    /// Bumped every time the presentation chain is rebuilt.
    pub fn swapchain_generation(&self) -> u64 {
        self.swapchain.generation()
    }

    pub fn is_minimized(&self) -> bool {
        self.resize.is_minimized()
    }

    /// Render targets the frame in `slot` samples.
    pub fn dependencies(&self, slot: usize) -> Option<&DependencySet> {
        self.tracker.dependencies(slot)
    }

    /// Start a frame.
    ///
    /// Calling it twice without [`end_frame`](Self::end_frame) is a
    /// [`RenderError::Protocol`] and has no effect.
    pub fn begin_frame(&mut self) -> RenderResult<()> {
        let result = self.begin_frame_inner();
        self.instance.reporter().check(result)
    }

    fn begin_frame_inner(&mut self) -> RenderResult<()> {
        if self.state != FrameState::Idle {
            return Err(RenderError::protocol("begin_frame called twice"));
        }
        self.screenshot.poll();

        if self.resize.is_minimized() {
            self.state = FrameState::Skipped;
            return Ok(());
        }
        if let Some(event) = self.resize.update() {
            log::debug!(
                "Applying resize {}x{} -> {}x{}",
                event.previous_width,
                event.previous_height,
                event.width,
                event.height
            );
            self.rebuild(event.width, event.height)?;
        }

        let image_index = self.acquire_slot()?;
        let slot = image_index as usize;
        {
            let mut finished =
                on_frame_finished(&self.instance, &mut self.tracker, &mut self.screenshot);
            self.frames.begin(slot, &mut finished)?;
        }

        self.recorder.reset();
        if let Some(frame_slot) = self.frames.slot_mut(slot) {
            frame_slot.mesh.clear();
        }
        self.state = FrameState::Recording { slot, image_index };
        log::trace!("Begin frame in slot {}", slot);
        Ok(())
    }

    /// Acquire the next image, rebuilding the chain once if it is stale.
    fn acquire_slot(&mut self) -> RenderResult<u32> {
        match self.swapchain.acquire() {
            Err(RenderError::Stale) => {}
            other => return other,
        }

        let (width, height) = self.resize.swapchain_size();
        self.rebuild(width, height)?;
        match self.swapchain.acquire() {
            Err(RenderError::Stale) => {
                log::error!("Presentation chain still stale after rebuild");
                Err(RenderError::StaleAfterRebuild)
            }
            other => other,
        }
    }

    /// Drain the previous frame, then rebuild the chain and everything
    /// indexed by its slots.
    fn rebuild(&mut self, width: u32, height: u32) -> RenderResult<()> {
        {
            let mut finished =
                on_frame_finished(&self.instance, &mut self.tracker, &mut self.screenshot);
            self.frames.synchronize(&mut finished)?;
        }

        if !self.swapchain.recreate(width, height)? {
            return Ok(());
        }
        let slot_count = self.swapchain.image_count();
        self.frames.resize(slot_count)?;
        self.tracker
            .reset(slot_count, &mut self.instance.render_targets());

        let extent = self.swapchain.extent();
        self.resize.confirm_size(extent.width, extent.height);
        Ok(())
    }

    /// Submit and present the frame.
    pub fn end_frame(&mut self) -> RenderResult<()> {
        let result = self.end_frame_inner();
        self.instance.reporter().check(result)
    }

    fn end_frame_inner(&mut self) -> RenderResult<()> {
        let (slot, image_index) = match self.state {
            FrameState::Idle => return Err(RenderError::protocol("end_frame without begin_frame")),
            FrameState::Skipped => {
                self.state = FrameState::Idle;
                return Ok(());
            }
            FrameState::Recording { slot, image_index } => (slot, image_index),
        };
        self.state = FrameState::Idle;

        let submitted = self.submit_frame(slot);
        self.recorder.reset_bindings();
        let result = match submitted {
            // The frame is on the device; its targets finish with the slot fence.
            Ok(submit_to_present) => self.swapchain.present(image_index, submit_to_present),
            Err(e) => {
                log::warn!("Frame in slot {} abandoned: {}", slot, e);
                self.tracker
                    .abort_all(slot, &mut self.instance.render_targets());
                self.screenshot.frame_aborted(slot);
                Err(e)
            }
        };
        self.instance.evict_descriptors();
        result
    }

    /// Record and submit the frame, returning the semaphore present waits on.
    fn submit_frame(&mut self, slot: usize) -> RenderResult<SemaphoreHandle> {
        let device = Arc::clone(self.instance.device());
        let extent = self.swapchain.extent();
        let format = self.swapchain.format();
        let image = *self
            .swapchain
            .image(slot)
            .ok_or_else(|| RenderError::invalid(format!("chain image {}", slot)))?;
        let render_pass = self
            .swapchain
            .render_pass()
            .ok_or_else(|| RenderError::protocol("window has no render pass"))?;

        {
            let frame_slot = self
                .frames
                .slot_mut(slot)
                .ok_or_else(|| RenderError::invalid(format!("frame slot {}", slot)))?;

            let mut transfer = CommandList::new();
            frame_slot.upload_frame_data(device.as_ref(), extent, &mut transfer)?;
            let geometry = frame_slot.mesh.upload(device.as_ref(), &mut transfer)?;
            device.record_commands(frame_slot.transfer_cb, &transfer)?;

            let mut render = self.recorder.build_render_pass(
                PassBegin {
                    render_pass,
                    framebuffer: image.framebuffer,
                    extent,
                    clear_color: self.config.clear_color,
                },
                geometry.map(|buffer| (buffer, frame_slot.mesh.layout())),
            );
            if let Some(copy) = self
                .screenshot
                .pending_copy(slot, image.image, extent, format)?
            {
                render.push(copy);
            }
            device.record_commands(frame_slot.render_cb, &render)?;
        }

        // At most one frame on the GPU while this one is submitted.
        {
            let mut finished =
                on_frame_finished(&self.instance, &mut self.tracker, &mut self.screenshot);
            self.frames.synchronize(&mut finished)?;
        }

        let submit_to_present = {
            let frame_slot = self
                .frames
                .slot(slot)
                .ok_or_else(|| RenderError::invalid(format!("frame slot {}", slot)))?;
            let mut arena = self.instance.render_targets();
            let mut collector = SubmissionCollector::new();
            self.tracker.commit_all(
                slot,
                &mut arena,
                &mut collector,
                device.as_ref(),
                self.instance.max_dependency_depth(),
            )?;
            submission::submit_frame(
                device.as_ref(),
                &mut arena,
                &mut self.tracker,
                slot,
                frame_slot,
                collector,
            )?;
            frame_slot.submit_to_present
        };
        self.frames.end(slot);
        Ok(submit_to_present)
    }

    fn draw(
        &mut self,
        primitive: Primitive,
        geometry: DrawGeometry<'_>,
        texture: Option<&Texture>,
        sampler: Option<&Sampler>,
        line_width: f32,
    ) -> RenderResult<()> {
        let slot = match self.state {
            FrameState::Recording { slot, .. } => slot,
            FrameState::Skipped => return Ok(()),
            FrameState::Idle => {
                return Err(RenderError::protocol(
                    "draw on a window outside begin_frame/end_frame",
                ))
            }
        };

        let bindings = self.instance.resolve_bindings(texture, sampler)?;
        let target = RecordTarget {
            render_pass: self
                .swapchain
                .render_pass()
                .ok_or_else(|| RenderError::protocol("window has no render pass"))?,
            samples: self.swapchain.samples(),
        };
        let frame_slot = self
            .frames
            .slot_mut(slot)
            .ok_or_else(|| RenderError::invalid(format!("frame slot {}", slot)))?;
        self.recorder.record(
            target,
            &mut frame_slot.mesh,
            primitive,
            geometry,
            &bindings,
            line_width,
        )?;
        if let Some(dependency) = bindings.dependency {
            self.tracker.note_usage(slot, dependency);
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

    pub fn draw_point_list(
        &mut self,
        geometry: DrawGeometry<'_>,
        texture: Option<&Texture>,
        sampler: Option<&Sampler>,
    ) -> RenderResult<()> {
        let result = self.draw(Primitive::Points, geometry, texture, sampler, 1.0);
        self.instance.reporter().check(result)
    }

    pub fn draw_mesh(&mut self, mesh: &Mesh, transformations: &[Mat4]) -> RenderResult<()> {
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

    /// Tell the window its size changed. The chain is rebuilt by a later
    /// `begin_frame` once the size settles. `0x0` minimises the window.
    pub fn notify_resize(&mut self, width: u32, height: u32) {
        self.resize.on_resize_event(width, height);
    }

    /// While minimised, frames are accepted and dropped.
    pub fn set_minimized(&mut self, minimized: bool) {
        self.resize.set_minimized(minimized);
    }

    /// Save the next frame to `path`. The extension picks the format
    /// (`png`, `bmp`, `tga`, `jpg`/`jpeg`); anything else gets `.png`
    /// appended.
    ///
    /// Returns `false` if a previous screenshot is still being processed.
    pub fn take_screenshot_to_file(&mut self, path: impl AsRef<Path>, include_alpha: bool) -> bool {
        self.screenshot.request_file(path.as_ref(), include_alpha)
    }

    /// Capture the next frame as pixel data.
    pub fn take_screenshot_to_data(&mut self, include_alpha: bool) -> bool {
        self.screenshot.request_data(include_alpha)
    }

    pub fn set_screenshot_handler(&mut self, handler: Option<ScreenshotHandler>) {
        self.screenshot.set_handler(handler);
    }

    /// Block until the last submitted frame has finished.
    pub fn wait_idle(&mut self) -> RenderResult<()> {
        let result = {
            let mut finished =
                on_frame_finished(&self.instance, &mut self.tracker, &mut self.screenshot);
            self.frames.synchronize(&mut finished)
        };
        self.screenshot.poll();
        self.instance.reporter().check(result)
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        let timeout = self.config.shutdown_timeout;
        {
            let mut finished =
                on_frame_finished(&self.instance, &mut self.tracker, &mut self.screenshot);
            self.frames.wait_all(timeout, &mut finished);
        }
        self.screenshot.teardown(timeout);
        self.tracker.reset(0, &mut self.instance.render_targets());
        log::debug!("Destroyed window after {} frames", self.frames.frame_count());
    }
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window")
            .field("size", &self.size())
            .field("slots", &self.slot_count())
            .field("state", &self.state)
            .field("minimized", &self.is_minimized())
            .finish()
    }
}

static_assertions::assert_impl_all!(Window: Send);
