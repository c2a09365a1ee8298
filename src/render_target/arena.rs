//! Storage and commit protocol of render targets.
//!
//! Every [`RenderTargetTexture`](super::RenderTargetTexture) owns one entry in
//! the instance-wide [`RenderTargetArena`]. Consumers only ever hold a
//! generational [`RenderTargetId`], so a released target is detected instead
//! of dereferenced.
//!
//! Each entry has two swap buffers. One can be recorded while the other is
//! sampled. Each swap buffer walks through
//!
//! ```text
//! Uncommitted ──commit──► Committed ──submit──► Submitted ──fence──► Finished
//!      ▲                      │
//!      └──── clear_aborted ◄── Aborted ◄── abort
//! ```
//!
//! with a transient `Committing` state while its upstream dependencies are
//! being committed.

use std::time::{Duration, Instant};

use crate::backend::guard::{CreationGuard, DeviceObject};
use crate::backend::*;
use crate::draw::{DrawRecorder, PassBegin};
use crate::error::{RenderError, RenderResult};
use crate::mesh_buffer::MeshBuffer;

use super::attachments::{BlurRequest, PassObjects, RenderTargetTextureType, SwapBufferImages};
use super::dependency::{DependencyInfo, DependencySet, SubmissionCollector};

/// Number of swap buffers per render target.
pub(crate) const SWAP_BUFFER_COUNT: usize = 2;

/// Generational id of a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetId {
    index: u32,
    generation: u32,
}

impl RenderTargetId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Where a swap buffer is in the submission protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommitState {
    #[default]
    Uncommitted,
    /// Upstream dependencies are being committed.
    Committing,
    /// Submissions are in a collector but not yet handed to the device.
    Committed,
    Submitted,
    /// The GPU finished the render.
    Finished,
    /// A commit failed; cleared back to `Uncommitted` by the frame that
    /// attempted it.
    Aborted,
}

/// Read-only view of one swap buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapBufferStatus {
    pub state: CommitState,
    pub render_counter: u64,
    pub has_pending_render: bool,
    pub has_been_submitted: bool,
    pub contains_non_pending_sampled_image: bool,
    pub render_complete: SemaphoreHandle,
}

pub(crate) struct SwapBuffer {
    pub images: SwapBufferImages,
    pub transfer_cb: CommandBufferHandle,
    pub render_cb: CommandBufferHandle,
    /// Binary; signaled by the transfer submission, waited by the render.
    pub transfer_complete: SemaphoreHandle,
    /// Timeline; reaches `render_counter` when the render is done.
    pub render_complete: SemaphoreHandle,
    pub render_counter: u64,
    pub recorder: DrawRecorder,
    pub mesh: MeshBuffer,
    pub dependencies: DependencySet,
    pub finalize: BlurRequest,
    pub has_pending_render: bool,
    pub state: CommitState,
    pub has_been_submitted: bool,
    pub contains_non_pending_sampled_image: bool,
}

impl SwapBuffer {
    fn create(
        guard: &mut CreationGuard<'_>,
        label: &str,
        kind: RenderTargetTextureType,
        passes: &PassObjects,
        extent: Extent2d,
        format: TextureFormat,
        samples: Multisamples,
    ) -> BackendResult<Self> {
        let images = SwapBufferImages::create(guard, label, kind, passes, extent, format, samples)?;
        let transfer_cb = guard.command_buffer()?;
        let render_cb = guard.command_buffer()?;
        let transfer_complete = guard.semaphore(SemaphoreKind::Binary)?;
        let render_complete = guard.semaphore(SemaphoreKind::Timeline { initial_value: 0 })?;

        Ok(Self {
            images,
            transfer_cb,
            render_cb,
            transfer_complete,
            render_complete,
            render_counter: 0,
            recorder: DrawRecorder::new(),
            mesh: MeshBuffer::new(label),
            dependencies: DependencySet::new(),
            finalize: BlurRequest::default(),
            has_pending_render: false,
            state: CommitState::Uncommitted,
            has_been_submitted: false,
            contains_non_pending_sampled_image: false,
        })
    }

    /// Forget the previous recording before a new one starts.
    pub fn reset_recording(&mut self) {
        self.recorder.reset();
        self.mesh.clear();
        self.dependencies.clear();
        self.finalize = BlurRequest::default();
        self.has_pending_render = false;
        self.state = CommitState::Uncommitted;
    }

    pub fn status(&self) -> SwapBufferStatus {
        SwapBufferStatus {
            state: self.state,
            render_counter: self.render_counter,
            has_pending_render: self.has_pending_render,
            has_been_submitted: self.has_been_submitted,
            contains_non_pending_sampled_image: self.contains_non_pending_sampled_image,
            render_complete: self.render_complete,
        }
    }

    fn sync_objects(&self) -> [DeviceObject; 4] {
        [
            DeviceObject::CommandBuffer(self.transfer_cb),
            DeviceObject::CommandBuffer(self.render_cb),
            DeviceObject::Semaphore(self.transfer_complete),
            DeviceObject::Semaphore(self.render_complete),
        ]
    }
}

pub(crate) struct RenderTargetEntry {
    pub label: String,
    pub extent: Extent2d,
    pub samples: Multisamples,
    pub kind: RenderTargetTextureType,
    pub format: TextureFormat,
    pub clear_color: [f32; 4],
    pub passes: PassObjects,
    pub swap_buffers: Vec<SwapBuffer>,
    /// Swap buffer being (or last) recorded.
    pub current: usize,
    /// Swap buffer consumers sample.
    pub last_rendered: Option<usize>,
    pub recording: bool,
}

impl RenderTargetEntry {
    /// Create every device object of a render target, or none of them.
    pub fn create(
        device: &dyn GpuDevice,
        label: String,
        extent: Extent2d,
        samples: Multisamples,
        enable_blur: bool,
        clear_color: [f32; 4],
    ) -> BackendResult<Self> {
        let kind = RenderTargetTextureType::determine(samples, enable_blur);
        let format = TextureFormat::Rgba8Unorm;

        let mut guard = CreationGuard::new(device);
        let passes = PassObjects::create(&mut guard, kind, format, samples)?;
        let mut swap_buffers = Vec::with_capacity(SWAP_BUFFER_COUNT);
        for index in 0..SWAP_BUFFER_COUNT {
            swap_buffers.push(SwapBuffer::create(
                &mut guard,
                &format!("{label} swap {index}"),
                kind,
                &passes,
                extent,
                format,
                samples,
            )?);
        }
        guard.finish();

        log::debug!(
            "Created {} ({}x{}, {:?})",
            label,
            extent.width,
            extent.height,
            kind
        );
        Ok(Self {
            label,
            extent,
            samples,
            kind,
            format,
            clear_color,
            passes,
            swap_buffers,
            current: 1,
            last_rendered: None,
            recording: false,
        })
    }

    /// Block until every submitted render has completed.
    ///
    /// With a timeout the whole drain shares one deadline; returns false if
    /// it passed with renders still in flight.
    pub fn drain(&self, device: &dyn GpuDevice, timeout: Option<Duration>) -> BackendResult<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        for swap in self.swap_buffers.iter().filter(|s| s.has_been_submitted) {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if !device.wait_semaphore(swap.render_complete, swap.render_counter, remaining)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Views consumers may hold descriptor sets for.
    pub fn sampled_views(&self) -> Vec<ImageViewHandle> {
        self.swap_buffers
            .iter()
            .map(|s| s.images.sampled_view())
            .collect()
    }

    /// Replace every swap buffer's images with ones of `extent`.
    ///
    /// The old images are only destroyed once all new ones exist. Call
    /// [`drain`](Self::drain) first.
    pub fn recreate_images(&mut self, device: &dyn GpuDevice, extent: Extent2d) -> BackendResult<()> {
        let mut guard = CreationGuard::new(device);
        let mut images = Vec::with_capacity(self.swap_buffers.len());
        for index in 0..self.swap_buffers.len() {
            images.push(SwapBufferImages::create(
                &mut guard,
                &format!("{} swap {}", self.label, index),
                self.kind,
                &self.passes,
                extent,
                self.format,
                self.samples,
            )?);
        }
        guard.finish();

        for (swap, images) in self.swap_buffers.iter_mut().zip(images) {
            let old = std::mem::replace(&mut swap.images, images);
            for object in old.objects() {
                object.destroy(device);
            }
            swap.reset_recording();
            swap.contains_non_pending_sampled_image = false;
        }
        self.extent = extent;
        self.last_rendered = None;
        Ok(())
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        for swap in &mut self.swap_buffers {
            swap.mesh.destroy(device);
            for object in swap.images.objects() {
                object.destroy(device);
            }
            for object in swap.sync_objects() {
                object.destroy(device);
            }
        }
        self.swap_buffers.clear();
        for object in self.passes.objects() {
            object.destroy(device);
        }
        log::debug!("Destroyed {}", self.label);
    }
}

struct ArenaSlot {
    generation: u32,
    entry: Option<RenderTargetEntry>,
}

/// Instance-wide render-target storage.
#[derive(Default)]
pub struct RenderTargetArena {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
}

impl RenderTargetArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, entry: RenderTargetEntry) -> RenderTargetId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return RenderTargetId::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(ArenaSlot {
            generation: 0,
            entry: Some(entry),
        });
        RenderTargetId::new(index, 0)
    }

    pub(crate) fn get(&self, id: RenderTargetId) -> Option<&RenderTargetEntry> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: RenderTargetId) -> Option<&mut RenderTargetEntry> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    /// Take the entry out; its id is never handed out again.
    pub(crate) fn remove(&mut self, id: RenderTargetId) -> Option<RenderTargetEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(entry)
    }

    pub fn contains(&self, id: RenderTargetId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live render targets.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sampled view of the last rendered swap buffer and its index.
    pub(crate) fn sampling_view(&self, id: RenderTargetId) -> Option<(ImageViewHandle, usize)> {
        let entry = self.get(id)?;
        let index = entry.last_rendered?;
        let swap = entry.swap_buffers.get(index)?;
        Some((swap.images.sampled_view(), index))
    }

    /// Swap buffer consumers of `id` currently sample.
    pub fn last_rendered(&self, id: RenderTargetId) -> Option<usize> {
        self.get(id)?.last_rendered
    }

    pub fn swap_status(&self, id: RenderTargetId, swap_index: usize) -> Option<SwapBufferStatus> {
        self.get(id)?
            .swap_buffers
            .get(swap_index)
            .map(SwapBuffer::status)
    }

    fn swap_mut(&mut self, info: &DependencyInfo) -> Option<&mut SwapBuffer> {
        self.get_mut(info.target())?
            .swap_buffers
            .get_mut(info.swap_index())
    }

    /// Commit the swap buffer `info` refers to and resolve its wait pair.
    ///
    /// Upstream render targets are committed first, depth first. Their
    /// submissions are pushed into `collector` ahead of this target's.
    pub(crate) fn commit(
        &mut self,
        info: &mut DependencyInfo,
        collector: &mut SubmissionCollector,
        device: &dyn GpuDevice,
        depth: usize,
        max_depth: usize,
    ) -> RenderResult<()> {
        let id = info.target();
        let swap = self.swap_mut(info).ok_or(RenderError::Released)?;

        match swap.state {
            CommitState::Aborted => return Err(RenderError::Aborted),
            CommitState::Committing => return Err(RenderError::DependencyCycle(id)),
            _ => {}
        }
        if depth > max_depth {
            return Err(RenderError::DependencyTooDeep(max_depth));
        }
        if !swap.has_pending_render {
            info.resolve(swap.render_complete, swap.render_counter);
            return Ok(());
        }

        swap.state = CommitState::Committing;
        let mut upstream = swap.dependencies.as_slice().to_vec();

        for index in 0..upstream.len() {
            if let Err(e) = self.commit(&mut upstream[index], collector, device, depth + 1, max_depth)
            {
                self.fail_commit(info, &upstream[..index]);
                return Err(e);
            }
        }

        let upstream_committed = upstream.clone();
        if let Some(swap) = self.swap_mut(info) {
            swap.dependencies.replace(upstream);
        }

        match self.record(info, collector, device) {
            Ok((semaphore, value)) => {
                info.resolve(semaphore, value);
                Ok(())
            }
            Err(e) => {
                self.fail_commit(info, &upstream_committed);
                Err(e)
            }
        }
    }

    fn fail_commit(&mut self, info: &DependencyInfo, committed_upstream: &[DependencyInfo]) {
        for upstream in committed_upstream {
            self.abort(upstream);
        }
        if let Some(swap) = self.swap_mut(info) {
            swap.state = CommitState::Aborted;
        }
        log::warn!(
            "Aborted render target {:?} swap {}",
            info.target(),
            info.swap_index()
        );
    }

    /// Record both command buffers and push the transfer and render
    /// submissions.
    fn record(
        &mut self,
        info: &DependencyInfo,
        collector: &mut SubmissionCollector,
        device: &dyn GpuDevice,
    ) -> RenderResult<(SemaphoreHandle, u64)> {
        let entry = self.get_mut(info.target()).ok_or(RenderError::Released)?;
        let extent = entry.extent;
        let kind = entry.kind;
        let passes = entry.passes;
        let clear_color = entry.clear_color;
        let label = entry.label.clone();
        let swap = entry
            .swap_buffers
            .get_mut(info.swap_index())
            .ok_or(RenderError::Released)?;

        let mut transfer = CommandList::new();
        let geometry = swap.mesh.upload(device, &mut transfer)?;
        device.record_commands(swap.transfer_cb, &transfer)?;

        let mut render = swap.recorder.build_render_pass(
            PassBegin {
                render_pass: passes.render_pass,
                framebuffer: swap.images.render_framebuffer,
                extent,
                clear_color,
            },
            geometry.map(|buffer| (buffer, swap.mesh.layout())),
        );
        for command in swap
            .images
            .finalize_commands(kind, &passes, extent, swap.finalize)
        {
            render.push(command);
        }
        device.record_commands(swap.render_cb, &render)?;

        swap.render_counter += 1;
        let value = swap.render_counter;

        collector.push(SubmitInfo {
            label: Some(format!("{label} transfer")),
            waits: Vec::new(),
            command_buffers: vec![swap.transfer_cb],
            signals: vec![SemaphoreSignal {
                semaphore: swap.transfer_complete,
                value: 1,
            }],
        });

        let mut waits = vec![SemaphoreWait {
            semaphore: swap.transfer_complete,
            value: 1,
            stages: PipelineStages::VERTEX_INPUT | PipelineStages::VERTEX_SHADER,
        }];
        waits.extend(swap.dependencies.waits());
        collector.push(SubmitInfo {
            label: Some(format!("{label} render")),
            waits,
            command_buffers: vec![swap.render_cb],
            signals: vec![SemaphoreSignal {
                semaphore: swap.render_complete,
                value,
            }],
        });

        swap.has_pending_render = false;
        swap.state = CommitState::Committed;
        log::trace!(
            "Committed {} swap {} at counter {} ({} draws, {} upstream)",
            label,
            info.swap_index(),
            value,
            swap.recorder.draw_count(),
            swap.dependencies.len()
        );
        Ok((swap.render_complete, value))
    }

    /// The committed submissions reached the device.
    pub(crate) fn confirm_submission(&mut self, info: &DependencyInfo) {
        let Some(swap) = self.swap_mut(info) else {
            return;
        };
        if swap.state != CommitState::Committed {
            return;
        }
        swap.state = CommitState::Submitted;
        swap.has_been_submitted = true;
        let upstream = swap.dependencies.as_slice().to_vec();
        for dependency in &upstream {
            self.confirm_submission(dependency);
        }
    }

    /// The GPU finished the render; the sampled image holds valid data.
    pub(crate) fn confirm_finished(&mut self, info: &DependencyInfo) {
        let Some(swap) = self.swap_mut(info) else {
            return;
        };
        if swap.state != CommitState::Submitted {
            return;
        }
        swap.state = CommitState::Finished;
        swap.contains_non_pending_sampled_image = true;
        let upstream = swap.dependencies.as_slice().to_vec();
        for dependency in &upstream {
            self.confirm_finished(dependency);
        }
    }

    /// Undo a commit whose submissions never reached the device.
    pub(crate) fn abort(&mut self, info: &DependencyInfo) {
        let Some(swap) = self.swap_mut(info) else {
            return;
        };
        if swap.state != CommitState::Committed {
            return;
        }
        swap.render_counter = swap.render_counter.saturating_sub(1);
        swap.has_pending_render = true;
        swap.state = CommitState::Aborted;
        let upstream = swap.dependencies.as_slice().to_vec();
        for dependency in &upstream {
            self.abort(dependency);
        }
    }

    /// Return aborted swap buffers to `Uncommitted` so the next frame can
    /// commit them again.
    pub(crate) fn clear_aborted(&mut self, info: &DependencyInfo) {
        let Some(swap) = self.swap_mut(info) else {
            return;
        };
        if swap.state != CommitState::Aborted {
            return;
        }
        swap.state = CommitState::Uncommitted;
        let upstream = swap.dependencies.as_slice().to_vec();
        for dependency in &upstream {
            self.clear_aborted(dependency);
        }
    }
}
