//! Texture samplers

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::*;
use crate::resources::DescriptorCache;

struct SamplerInner {
    device: Arc<dyn GpuDevice>,
    descriptors: Arc<Mutex<DescriptorCache>>,
    handle: SamplerHandle,
    desc: SamplerDescriptor,
}

impl Drop for SamplerInner {
    fn drop(&mut self) {
        self.descriptors
            .lock()
            .forget(DescriptorBinding::Sampler(self.handle), self.device.as_ref());
        self.device.destroy_sampler(self.handle);
    }
}

/// Shared handle to a device sampler.
#[derive(Clone)]
pub struct Sampler {
    inner: Arc<SamplerInner>,
}

impl Sampler {
    pub(crate) fn new(
        device: Arc<dyn GpuDevice>,
        descriptors: Arc<Mutex<DescriptorCache>>,
        desc: &SamplerDescriptor,
    ) -> BackendResult<Self> {
        let handle = device.create_sampler(desc)?;
        Ok(Self {
            inner: Arc::new(SamplerInner {
                device,
                descriptors,
                handle,
                desc: desc.clone(),
            }),
        })
    }

    pub fn handle(&self) -> SamplerHandle {
        self.inner.handle
    }

    pub fn descriptor(&self) -> &SamplerDescriptor {
        &self.inner.desc
    }

    /// Whether draws with this sampler need the border-color pipeline.
    pub fn uses_border_color(&self) -> bool {
        self.inner.desc.uses_border_color()
    }
}

impl fmt::Debug for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sampler")
            .field("handle", &self.inner.handle)
            .field("desc", &self.inner.desc)
            .finish()
    }
}

impl PartialEq for Sampler {
    fn eq(&self, other: &Self) -> bool {
        self.inner.handle == other.inner.handle
    }
}
