//! Per-frame geometry buffer.
//!
//! Draws append their indices, vertices, texture layer weights and instance
//! transforms into CPU-side sections. At submission time the sections are
//! packed into one staging buffer and copied into a device buffer laid out as
//!
//! ```text
//! [ indices | vertices | layer weights | transforms ]
//! ```
//!
//! Device buffers grow to fit and are reused across frames; the owner makes
//! sure the GPU no longer reads them before [`MeshBuffer::upload`] runs again.

use glam::Mat4;

use crate::backend::*;

/// Default upper bound on the packed size of one frame's geometry.
pub const DEFAULT_MESH_BUFFER_CAPACITY: u64 = 64 * 1024 * 1024;

/// Element offsets of one pushed mesh inside each section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeshOffsets {
    pub first_index: u32,
    pub vertex_offset: u32,
    pub weight_offset: u32,
    pub transform_offset: u32,
}

/// Byte offsets of each section inside the packed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeometryLayout {
    pub index_offset: u64,
    pub vertex_offset: u64,
    pub weight_offset: u64,
    pub transform_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
struct DeviceBuffer {
    handle: BufferHandle,
    size: u64,
}

#[derive(Debug)]
pub struct MeshBuffer {
    label: String,
    capacity: u64,
    indices: Vec<u32>,
    vertices: Vec<Vertex>,
    weights: Vec<f32>,
    transforms: Vec<Mat4>,
    staging: Option<DeviceBuffer>,
    geometry: Option<DeviceBuffer>,
}

fn align(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

impl MeshBuffer {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_capacity(label, DEFAULT_MESH_BUFFER_CAPACITY)
    }

    pub fn with_capacity(label: impl Into<String>, capacity: u64) -> Self {
        Self {
            label: label.into(),
            capacity,
            indices: Vec::new(),
            vertices: Vec::new(),
            weights: Vec::new(),
            transforms: Vec::new(),
            staging: None,
            geometry: None,
        }
    }

    /// Append a mesh. Returns `None` if it does not fit in the buffer.
    ///
    /// An empty `transforms` slice pushes the identity so every draw has at
    /// least one instance transform.
    pub fn push_mesh(
        &mut self,
        indices: &[u32],
        vertices: &[Vertex],
        weights: &[f32],
        transforms: &[Mat4],
    ) -> Option<MeshOffsets> {
        let transform_count = transforms.len().max(1);
        let layout = Self::layout_for(
            self.indices.len() + indices.len(),
            self.vertices.len() + vertices.len(),
            self.weights.len() + weights.len(),
            self.transforms.len() + transform_count,
        );
        if layout.size > self.capacity {
            log::warn!(
                "{}: mesh of {} vertices does not fit ({} > {} bytes)",
                self.label,
                vertices.len(),
                layout.size,
                self.capacity
            );
            return None;
        }

        let offsets = MeshOffsets {
            first_index: self.indices.len() as u32,
            vertex_offset: self.vertices.len() as u32,
            weight_offset: self.weights.len() as u32,
            transform_offset: self.transforms.len() as u32,
        };

        self.indices.extend_from_slice(indices);
        self.vertices.extend_from_slice(vertices);
        self.weights.extend_from_slice(weights);
        if transforms.is_empty() {
            self.transforms.push(Mat4::IDENTITY);
        } else {
            self.transforms.extend_from_slice(transforms);
        }
        Some(offsets)
    }

    fn layout_for(indices: usize, vertices: usize, weights: usize, transforms: usize) -> GeometryLayout {
        let index_offset = 0;
        let vertex_offset = align(index_offset + (indices * 4) as u64, 16);
        let weight_offset = align(
            vertex_offset + (vertices * std::mem::size_of::<Vertex>()) as u64,
            16,
        );
        let transform_offset = align(weight_offset + (weights * 4) as u64, 16);
        let size = transform_offset + (transforms * std::mem::size_of::<Mat4>()) as u64;
        GeometryLayout {
            index_offset,
            vertex_offset,
            weight_offset,
            transform_offset,
            size,
        }
    }

    pub fn layout(&self) -> GeometryLayout {
        Self::layout_for(
            self.indices.len(),
            self.vertices.len(),
            self.weights.len(),
            self.transforms.len(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// Forget the CPU-side data; device buffers are kept for reuse.
    pub fn clear(&mut self) {
        self.indices.clear();
        self.vertices.clear();
        self.weights.clear();
        self.transforms.clear();
    }

    /// Device buffer the last upload copied into.
    pub fn geometry_buffer(&self) -> Option<BufferHandle> {
        self.geometry.map(|b| b.handle)
    }

    fn ensure(
        device: &dyn GpuDevice,
        slot: &mut Option<DeviceBuffer>,
        label: String,
        size: u64,
        usage: BufferUsage,
    ) -> BackendResult<BufferHandle> {
        if let Some(buffer) = slot {
            if buffer.size >= size {
                return Ok(buffer.handle);
            }
            device.destroy_buffer(buffer.handle);
            *slot = None;
        }

        // Grow geometrically so a slowly growing scene does not reallocate
        // every frame.
        let size = size.next_power_of_two().max(1024);
        let handle = device.create_buffer(&BufferDescriptor {
            label: Some(label),
            size,
            usage,
        })?;
        *slot = Some(DeviceBuffer { handle, size });
        Ok(handle)
    }

    /// Pack the sections into the staging buffer and record the copy into the
    /// device buffer.
    ///
    /// Returns the device buffer to bind, or `None` if nothing was pushed.
    pub fn upload(
        &mut self,
        device: &dyn GpuDevice,
        commands: &mut CommandList,
    ) -> BackendResult<Option<BufferHandle>> {
        if self.is_empty() {
            return Ok(None);
        }

        let layout = self.layout();
        let mut packed = vec![0u8; layout.size as usize];
        let sections: [(u64, &[u8]); 4] = [
            (layout.index_offset, bytemuck::cast_slice(&self.indices)),
            (layout.vertex_offset, bytemuck::cast_slice(&self.vertices)),
            (layout.weight_offset, bytemuck::cast_slice(&self.weights)),
            (layout.transform_offset, bytemuck::cast_slice(&self.transforms)),
        ];
        for (offset, bytes) in sections {
            let start = offset as usize;
            packed[start..start + bytes.len()].copy_from_slice(bytes);
        }

        let staging = Self::ensure(
            device,
            &mut self.staging,
            format!("{} staging", self.label),
            layout.size,
            BufferUsage::TRANSFER_SRC | BufferUsage::HOST_VISIBLE,
        )?;
        let geometry = Self::ensure(
            device,
            &mut self.geometry,
            format!("{} geometry", self.label),
            layout.size,
            BufferUsage::VERTEX
                | BufferUsage::INDEX
                | BufferUsage::STORAGE
                | BufferUsage::TRANSFER_DST,
        )?;

        device.write_buffer(staging, 0, &packed)?;
        commands.push(Command::CopyBuffer {
            src: staging,
            dst: geometry,
            size: layout.size,
        });

        log::trace!(
            "{}: uploading {} indices, {} vertices ({} bytes)",
            self.label,
            self.indices.len(),
            self.vertices.len(),
            layout.size
        );
        Ok(Some(geometry))
    }

    /// Release the device buffers.
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        for buffer in [self.staging.take(), self.geometry.take()].into_iter().flatten() {
            device.destroy_buffer(buffer.handle);
        }
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec2;

    fn triangle() -> Vec<Vertex> {
        vec![
            Vertex::new(Vec2::ZERO, Vec2::ZERO, [1.0; 4]),
            Vertex::new(Vec2::X, Vec2::X, [1.0; 4]),
            Vertex::new(Vec2::Y, Vec2::Y, [1.0; 4]),
        ]
    }

    #[test]
    fn test_offsets_accumulate() {
        let mut buffer = MeshBuffer::new("test");
        let first = buffer
            .push_mesh(&[0, 1, 2], &triangle(), &[], &[])
            .unwrap();
        let second = buffer
            .push_mesh(&[0, 1, 2], &triangle(), &[], &[Mat4::IDENTITY; 2])
            .unwrap();

        assert_eq!(first, MeshOffsets::default());
        assert_eq!(second.first_index, 3);
        assert_eq!(second.vertex_offset, 3);
        assert_eq!(second.transform_offset, 1);
        assert_eq!(buffer.layout().size % 4, 0);
    }

    #[test]
    fn test_capacity_limit() {
        let mut buffer = MeshBuffer::with_capacity("small", 64);
        assert!(buffer.push_mesh(&[0, 1, 2], &triangle(), &[], &[]).is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_upload_copies_packed_sections() {
        let device = DummyDevice::new();
        let mut buffer = MeshBuffer::new("test");
        buffer.push_mesh(&[0, 1, 2], &triangle(), &[], &[]).unwrap();

        let mut commands = CommandList::new();
        let geometry = buffer.upload(&device, &mut commands).unwrap().unwrap();
        assert_eq!(commands.len(), 1);
        match commands.iter().next() {
            Some(Command::CopyBuffer { dst, size, .. }) => {
                assert_eq!(*dst, geometry);
                assert_eq!(*size, buffer.layout().size);
            }
            other => panic!("unexpected command {:?}", other),
        };
    }

    #[test]
    fn test_upload_empty_records_nothing() {
        let device = DummyDevice::new();
        let mut buffer = MeshBuffer::new("test");
        let mut commands = CommandList::new();
        assert_eq!(buffer.upload(&device, &mut commands).unwrap(), None);
        assert!(commands.is_empty());
    }

    #[test]
    fn test_buffers_are_reused_after_clear() {
        let device = DummyDevice::new();
        let mut buffer = MeshBuffer::new("test");
        buffer.push_mesh(&[0, 1, 2], &triangle(), &[], &[]).unwrap();
        let first = buffer.upload(&device, &mut CommandList::new()).unwrap();

        buffer.clear();
        buffer.push_mesh(&[0, 1, 2], &triangle(), &[], &[]).unwrap();
        let second = buffer.upload(&device, &mut CommandList::new()).unwrap();
        assert_eq!(first, second);
    }
}
