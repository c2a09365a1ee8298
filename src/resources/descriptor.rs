//! Descriptor set cache
//!
//! Draws bind a sampler set and a texture set. Sets are created on first use,
//! keyed by what they bind, and freed once they have not been used for a
//! while. Resources forget their sets when they are destroyed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::backend::{BackendResult, DescriptorBinding, DescriptorSetHandle, GpuDevice};

#[derive(Debug, Clone, Copy)]
struct CachedSet {
    set: DescriptorSetHandle,
    last_access: Instant,
}

#[derive(Debug, Default)]
pub struct DescriptorCache {
    entries: HashMap<DescriptorBinding, CachedSet>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set binding `binding`, created on first use. Refreshes its access time.
    pub fn get_or_create(
        &mut self,
        binding: DescriptorBinding,
        device: &dyn GpuDevice,
    ) -> BackendResult<DescriptorSetHandle> {
        let now = Instant::now();
        if let Some(cached) = self.entries.get_mut(&binding) {
            cached.last_access = now;
            return Ok(cached.set);
        }

        let set = device.create_descriptor_set(&binding)?;
        self.entries.insert(
            binding,
            CachedSet {
                set,
                last_access: now,
            },
        );
        Ok(set)
    }

    /// Destroy the set for `binding`, if any.
    pub fn forget(&mut self, binding: DescriptorBinding, device: &dyn GpuDevice) {
        if let Some(cached) = self.entries.remove(&binding) {
            device.destroy_descriptor_set(cached.set);
        }
    }

    /// Destroy every set last used more than `age` before `now`.
    ///
    /// Returns the number of sets destroyed.
    pub fn evict_older_than(&mut self, age: Duration, now: Instant, device: &dyn GpuDevice) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, cached| {
            let keep = now.saturating_duration_since(cached.last_access) <= age;
            if !keep {
                device.destroy_descriptor_set(cached.set);
            }
            keep
        });
        let evicted = before - self.entries.len();
        if evicted > 0 {
            log::debug!("Evicted {} unused descriptor sets", evicted);
        }
        evicted
    }

    pub fn clear(&mut self, device: &dyn GpuDevice) {
        for (_, cached) in self.entries.drain() {
            device.destroy_descriptor_set(cached.set);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
