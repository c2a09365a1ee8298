//! Per-slot frame resources and CPU-GPU frame synchronization.
//!
//! Each presentable slot owns its command buffers, a fence, the semaphores
//! linking its submissions to presentation, a frame-data uniform and the
//! geometry buffer its draws are uploaded into.
//!
//! # Synchronization
//!
//! Synchronization is lazy. Ending a frame only remembers its slot; the
//! fence is waited when the next frame is about to be submitted, or earlier
//! if the same slot comes around again:
//!
//! ```text
//! end_frame(N-1)  begin_frame(N)  end_frame(N)
//!      │               │               │
//!      └─ previous ────┴── waited ─────┘ before N is submitted
//! ```
//!
//! So at most two frames exist at once: one on the GPU, one being recorded.

use std::sync::Arc;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};

use crate::backend::guard::{CreationGuard, DeviceObject};
use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::mesh_buffer::MeshBuffer;

/// Uniform data every window draw can read.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub(crate) struct FrameData {
    pub extent: [f32; 2],
    pub inv_extent: [f32; 2],
}

impl FrameData {
    pub fn new(extent: Extent2d) -> Self {
        let width = extent.width.max(1) as f32;
        let height = extent.height.max(1) as f32;
        Self {
            extent: [width, height],
            inv_extent: [1.0 / width, 1.0 / height],
        }
    }
}

const FRAME_DATA_SIZE: u64 = std::mem::size_of::<FrameData>() as u64;

/// Objects owned by one presentable slot.
pub(crate) struct FrameSlot {
    pub transfer_cb: CommandBufferHandle,
    pub render_cb: CommandBufferHandle,
    /// Signaled when the slot's render submission completes.
    pub fence: FenceHandle,
    /// Binary; signaled by the render submission, waited by present.
    pub submit_to_present: SemaphoreHandle,
    /// Binary; signaled by the transfer submission, waited by the render.
    pub transfer_complete: SemaphoreHandle,
    frame_data_staging: BufferHandle,
    pub frame_data: BufferHandle,
    pub mesh: MeshBuffer,
}

impl FrameSlot {
    fn create(guard: &mut CreationGuard<'_>, index: usize) -> BackendResult<Self> {
        let transfer_cb = guard.command_buffer()?;
        let render_cb = guard.command_buffer()?;
        let fence = guard.fence(false)?;
        let submit_to_present = guard.semaphore(SemaphoreKind::Binary)?;
        let transfer_complete = guard.semaphore(SemaphoreKind::Binary)?;
        let frame_data_staging = guard.buffer(&BufferDescriptor {
            label: Some(format!("frame data staging {index}")),
            size: FRAME_DATA_SIZE,
            usage: BufferUsage::HOST_VISIBLE | BufferUsage::TRANSFER_SRC,
        })?;
        let frame_data = guard.buffer(&BufferDescriptor {
            label: Some(format!("frame data {index}")),
            size: FRAME_DATA_SIZE,
            usage: BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST,
        })?;

        Ok(Self {
            transfer_cb,
            render_cb,
            fence,
            submit_to_present,
            transfer_complete,
            frame_data_staging,
            frame_data,
            mesh: MeshBuffer::new(format!("window slot {index}")),
        })
    }

    /// Write the frame data for `extent` and record its upload.
    pub fn upload_frame_data(
        &self,
        device: &dyn GpuDevice,
        extent: Extent2d,
        commands: &mut CommandList,
    ) -> BackendResult<()> {
        let data = FrameData::new(extent);
        device.write_buffer(self.frame_data_staging, 0, bytemuck::bytes_of(&data))?;
        commands.push(Command::CopyBuffer {
            src: self.frame_data_staging,
            dst: self.frame_data,
            size: FRAME_DATA_SIZE,
        });
        Ok(())
    }

    fn destroy(mut self, device: &dyn GpuDevice) {
        self.mesh.destroy(device);
        let objects = [
            DeviceObject::Buffer(self.frame_data),
            DeviceObject::Buffer(self.frame_data_staging),
            DeviceObject::Semaphore(self.transfer_complete),
            DeviceObject::Semaphore(self.submit_to_present),
            DeviceObject::Fence(self.fence),
            DeviceObject::CommandBuffer(self.render_cb),
            DeviceObject::CommandBuffer(self.transfer_cb),
        ];
        for object in objects {
            object.destroy(device);
        }
    }
}

/// The slots of a window and the lazy frame synchronization between them.
pub(crate) struct FrameSet {
    device: Arc<dyn GpuDevice>,
    slots: Vec<FrameSlot>,
    /// Slot of the last submitted frame.
    previous: Option<usize>,
    /// Whether `previous` has not been waited yet.
    needs_sync: bool,
    timeout: Option<Duration>,
    frame_count: u64,
}

impl FrameSet {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        slot_count: usize,
        timeout: Option<Duration>,
    ) -> RenderResult<Self> {
        let slots = Self::create_slots(device.as_ref(), slot_count)?;
        Ok(Self {
            device,
            slots,
            previous: None,
            needs_sync: false,
            timeout,
            frame_count: 0,
        })
    }

    fn create_slots(device: &dyn GpuDevice, count: usize) -> BackendResult<Vec<FrameSlot>> {
        let mut guard = CreationGuard::new(device);
        let mut slots = Vec::with_capacity(count);
        for index in 0..count {
            slots.push(FrameSlot::create(&mut guard, index)?);
        }
        guard.finish();
        Ok(slots)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut FrameSlot> {
        self.slots.get_mut(index)
    }

    #[cfg(test)]
    pub fn needs_sync(&self) -> bool {
        self.needs_sync
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Reallocate the slots if the chain now has `count` images.
    ///
    /// Returns whether anything changed. Every frame must have been
    /// synchronized before.
    pub fn resize(&mut self, count: usize) -> RenderResult<bool> {
        if count == self.slots.len() {
            return Ok(false);
        }
        if self.needs_sync {
            return Err(RenderError::protocol(
                "frame slots resized while a frame is in flight",
            ));
        }

        let new_slots = Self::create_slots(self.device.as_ref(), count)?;
        for slot in std::mem::replace(&mut self.slots, new_slots) {
            slot.destroy(self.device.as_ref());
        }
        self.previous = None;
        log::debug!("Reallocated {} frame slots", count);
        Ok(true)
    }

    /// Prepare `slot` for recording.
    ///
    /// If the previous frame used the same slot and has not been waited yet,
    /// this waits for it first.
    pub fn begin(&mut self, slot: usize, on_finished: &mut dyn FnMut(usize)) -> RenderResult<()> {
        if slot >= self.slots.len() {
            return Err(RenderError::invalid(format!(
                "frame slot {} of {}",
                slot,
                self.slots.len()
            )));
        }
        if self.previous == Some(slot) && self.needs_sync {
            log::trace!("Slot {} reused before synchronization, waiting", slot);
            self.synchronize(on_finished)?;
        }
        Ok(())
    }

    /// Wait for the previous frame, then run `on_finished` for its slot.
    pub fn synchronize(&mut self, on_finished: &mut dyn FnMut(usize)) -> RenderResult<()> {
        let slot = match self.previous {
            Some(slot) if self.needs_sync => slot,
            _ => return Ok(()),
        };
        let fence = self.slots[slot].fence;

        if !self.device.wait_fence(fence, self.timeout)? {
            let timeout = self.timeout.unwrap_or_default();
            log::error!("Frame in slot {} did not finish within {:?}", slot, timeout);
            return Err(RenderError::FrameTimeout(timeout));
        }
        on_finished(slot);
        self.device.reset_fence(fence)?;
        self.needs_sync = false;

        log::trace!("Synchronized slot {}", slot);
        Ok(())
    }

    /// `slot` was submitted; it is synchronized lazily.
    pub fn end(&mut self, slot: usize) {
        self.previous = Some(slot);
        self.needs_sync = true;
        self.frame_count += 1;
        log::trace!("Frame {} submitted in slot {}", self.frame_count, slot);
    }

    /// Wait for the last frame with a bound, for shutdown.
    ///
    /// Returns `false` if it did not finish in time. That is logged and the
    /// caller carries on tearing down.
    pub fn wait_all(&mut self, timeout: Duration, on_finished: &mut dyn FnMut(usize)) -> bool {
        let slot = match self.previous {
            Some(slot) if self.needs_sync => slot,
            _ => return true,
        };

        match self.device.wait_fence(self.slots[slot].fence, Some(timeout)) {
            Ok(true) => {
                on_finished(slot);
                if let Err(e) = self.device.reset_fence(self.slots[slot].fence) {
                    log::warn!("Failed to reset fence of slot {}: {}", slot, e);
                }
                self.needs_sync = false;
                true
            }
            Ok(false) => {
                log::warn!(
                    "Frame in slot {} still running after {:?}; tearing down anyway",
                    slot,
                    timeout
                );
                false
            }
            Err(e) => {
                log::warn!("Waiting for slot {} failed: {}", slot, e);
                false
            }
        }
    }
}

impl Drop for FrameSet {
    fn drop(&mut self) {
        for slot in self.slots.drain(..) {
            slot.destroy(self.device.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit(device: &DummyDevice, frames: &FrameSet, slot: usize) {
        let frame_slot = frames.slot(slot).unwrap();
        device
            .record_commands(frame_slot.render_cb, &CommandList::new())
            .unwrap();
        device
            .submit(
                &[SubmitInfo {
                    label: None,
                    waits: Vec::new(),
                    command_buffers: vec![frame_slot.render_cb],
                    signals: Vec::new(),
                }],
                Some(frame_slot.fence),
            )
            .unwrap();
    }

    #[test]
    fn test_frame_data() {
        let data = FrameData::new(Extent2d::new(200, 100));
        assert_eq!(data.extent, [200.0, 100.0]);
        assert_eq!(data.inv_extent, [0.005, 0.01]);
        assert_eq!(FRAME_DATA_SIZE, 16);
    }

    #[test]
    fn test_synchronize_is_lazy() {
        let device = Arc::new(DummyDevice::with_mode(CompletionMode::Deferred));
        let mut frames = FrameSet::new(device.clone(), 2, None).unwrap();
        let mut finished = Vec::new();

        frames.begin(0, &mut |s| finished.push(s)).unwrap();
        submit(&device, &frames, 0);
        frames.end(0);
        assert!(frames.needs_sync());

        // A different slot does not wait.
        frames.begin(1, &mut |s| finished.push(s)).unwrap();
        assert!(finished.is_empty());

        device.complete_all();
        frames.synchronize(&mut |s| finished.push(s)).unwrap();
        assert_eq!(finished, vec![0]);
        assert!(!frames.needs_sync());

        // Second synchronize is a no-op.
        frames.synchronize(&mut |s| finished.push(s)).unwrap();
        assert_eq!(finished, vec![0]);
    }

    #[test]
    fn test_reused_slot_waits() {
        let device = Arc::new(DummyDevice::new());
        let mut frames = FrameSet::new(device.clone(), 1, None).unwrap();
        let mut finished = Vec::new();

        frames.begin(0, &mut |s| finished.push(s)).unwrap();
        submit(&device, &frames, 0);
        frames.end(0);

        frames.begin(0, &mut |s| finished.push(s)).unwrap();
        assert_eq!(finished, vec![0]);
    }

    #[test]
    fn test_timeout() {
        let device = Arc::new(DummyDevice::with_mode(CompletionMode::Stalled));
        let mut frames =
            FrameSet::new(device.clone(), 2, Some(Duration::from_millis(1))).unwrap();

        submit(&device, &frames, 0);
        frames.end(0);
        let result = frames.synchronize(&mut |_| {});
        assert_eq!(result, Err(RenderError::FrameTimeout(Duration::from_millis(1))));
        assert!(!frames.wait_all(Duration::from_millis(1), &mut |_| {}));

        device.complete_all();
        assert!(frames.wait_all(Duration::from_millis(1), &mut |_| {}));
    }

    #[test]
    fn test_resize_reallocates_only_on_change() {
        let device = Arc::new(DummyDevice::new());
        let mut frames = FrameSet::new(device.clone(), 2, None).unwrap();
        let before = device.live_sync_objects();
        assert!(!frames.resize(2).unwrap());
        assert!(frames.resize(3).unwrap());
        assert_eq!(frames.slot_count(), 3);
        assert_eq!(device.live_sync_objects(), before / 2 * 3);

        drop(frames);
        assert_eq!(device.live_sync_objects(), 0);
    }
}
