//! Rollback of partially created device objects.

use super::traits::*;
use super::types::*;

/// Any object a [`GpuDevice`] hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceObject {
    Image(ImageHandle),
    ImageView(ImageViewHandle),
    RenderPass(RenderPassHandle),
    Framebuffer(FramebufferHandle),
    Buffer(BufferHandle),
    Sampler(SamplerHandle),
    Semaphore(SemaphoreHandle),
    Fence(FenceHandle),
    CommandBuffer(CommandBufferHandle),
}

impl DeviceObject {
    pub fn destroy(self, device: &dyn GpuDevice) {
        match self {
            DeviceObject::Image(h) => device.destroy_image(h),
            DeviceObject::ImageView(h) => device.destroy_image_view(h),
            DeviceObject::RenderPass(h) => device.destroy_render_pass(h),
            DeviceObject::Framebuffer(h) => device.destroy_framebuffer(h),
            DeviceObject::Buffer(h) => device.destroy_buffer(h),
            DeviceObject::Sampler(h) => device.destroy_sampler(h),
            DeviceObject::Semaphore(h) => device.destroy_semaphore(h),
            DeviceObject::Fence(h) => device.destroy_fence(h),
            DeviceObject::CommandBuffer(h) => device.free_command_buffer(h),
        }
    }
}

/// Creates device objects and destroys them again, newest first, unless
/// [`finish`](Self::finish) is reached.
pub(crate) struct CreationGuard<'a> {
    device: &'a dyn GpuDevice,
    objects: Vec<DeviceObject>,
}

impl<'a> CreationGuard<'a> {
    pub fn new(device: &'a dyn GpuDevice) -> Self {
        Self {
            device,
            objects: Vec::new(),
        }
    }

    pub fn image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        let handle = self.device.create_image(desc)?;
        self.objects.push(DeviceObject::Image(handle));
        Ok(handle)
    }

    pub fn image_view(&mut self, image: ImageHandle) -> BackendResult<ImageViewHandle> {
        let handle = self.device.create_image_view(image)?;
        self.objects.push(DeviceObject::ImageView(handle));
        Ok(handle)
    }

    pub fn render_pass(&mut self, desc: &RenderPassDescriptor) -> BackendResult<RenderPassHandle> {
        let handle = self.device.create_render_pass(desc)?;
        self.objects.push(DeviceObject::RenderPass(handle));
        Ok(handle)
    }

    pub fn framebuffer(&mut self, desc: &FramebufferDescriptor) -> BackendResult<FramebufferHandle> {
        let handle = self.device.create_framebuffer(desc)?;
        self.objects.push(DeviceObject::Framebuffer(handle));
        Ok(handle)
    }

    pub fn buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let handle = self.device.create_buffer(desc)?;
        self.objects.push(DeviceObject::Buffer(handle));
        Ok(handle)
    }

    pub fn sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let handle = self.device.create_sampler(desc)?;
        self.objects.push(DeviceObject::Sampler(handle));
        Ok(handle)
    }

    pub fn semaphore(&mut self, kind: SemaphoreKind) -> BackendResult<SemaphoreHandle> {
        let handle = self.device.create_semaphore(kind)?;
        self.objects.push(DeviceObject::Semaphore(handle));
        Ok(handle)
    }

    pub fn fence(&mut self, signaled: bool) -> BackendResult<FenceHandle> {
        let handle = self.device.create_fence(signaled)?;
        self.objects.push(DeviceObject::Fence(handle));
        Ok(handle)
    }

    pub fn command_buffer(&mut self) -> BackendResult<CommandBufferHandle> {
        let handle = self.device.allocate_command_buffer()?;
        self.objects.push(DeviceObject::CommandBuffer(handle));
        Ok(handle)
    }

    /// Keep everything created so far.
    pub fn finish(mut self) {
        self.objects.clear();
    }
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        if !self.objects.is_empty() {
            log::debug!(
                "{}: rolling back {} partially created objects",
                self.device.name(),
                self.objects.len()
            );
        }
        for object in self.objects.drain(..).rev() {
            object.destroy(self.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyDevice;

    #[test]
    fn test_rollback_on_drop() {
        let device = DummyDevice::new();
        {
            let mut guard = CreationGuard::new(&device);
            guard.semaphore(SemaphoreKind::Binary).unwrap();
            guard.fence(false).unwrap();
            guard.command_buffer().unwrap();
        }
        assert_eq!(device.live_sync_objects(), 0);
    }

    #[test]
    fn test_finish_keeps_objects() {
        let device = DummyDevice::new();
        let mut guard = CreationGuard::new(&device);
        guard.semaphore(SemaphoreKind::Binary).unwrap();
        guard.finish();
        assert_eq!(device.live_sync_objects(), 1);
    }
}
