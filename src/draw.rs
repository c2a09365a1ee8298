//! Draw recording shared by windows and render targets.
//!
//! A draw is validated, its geometry appended to a [`MeshBuffer`], and the
//! commands it needs appended to a [`DrawRecorder`]. Pipeline, sampler,
//! texture and line width bindings are only re-emitted when they change; the
//! cache is reset at frame end and at render-target `begin_render`.

use std::borrow::Cow;

use glam::Mat4;

use crate::backend::*;
use crate::error::{RenderError, RenderResult};
use crate::mesh_buffer::{GeometryLayout, MeshBuffer};
use crate::render_target::DependencyInfo;
use crate::resources::MeshType;

/// Borrowed geometry of one draw.
///
/// `texture_layer_weights` holds `layer_count` weights per vertex, or nothing
/// for single-layer textures. Each entry of `transformations` draws one
/// instance; none draws a single untransformed instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrawGeometry<'a> {
    pub indices: &'a [u32],
    pub vertices: &'a [Vertex],
    pub texture_layer_weights: &'a [f32],
    pub transformations: &'a [Mat4],
}

impl<'a> DrawGeometry<'a> {
    pub fn new(indices: &'a [u32], vertices: &'a [Vertex]) -> Self {
        Self {
            indices,
            vertices,
            ..Default::default()
        }
    }

    pub fn with_texture_layer_weights(mut self, weights: &'a [f32]) -> Self {
        self.texture_layer_weights = weights;
        self
    }

    pub fn with_transformations(mut self, transformations: &'a [Mat4]) -> Self {
        self.transformations = transformations;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Primitive {
    Triangles { filled: bool },
    Lines,
    Points,
}

impl Primitive {
    pub(crate) fn from_mesh_type(mesh_type: MeshType) -> Self {
        match mesh_type {
            MeshType::TriangleFilled => Primitive::Triangles { filled: true },
            MeshType::TriangleWireframe => Primitive::Triangles { filled: false },
            MeshType::Line => Primitive::Lines,
            MeshType::Point => Primitive::Points,
        }
    }

    fn indices_per_primitive(&self) -> usize {
        match self {
            Primitive::Triangles { .. } => 3,
            Primitive::Lines => 2,
            Primitive::Points => 1,
        }
    }

    fn topology(&self) -> PrimitiveTopology {
        match self {
            Primitive::Triangles { .. } => PrimitiveTopology::TriangleList,
            Primitive::Lines => PrimitiveTopology::LineList,
            Primitive::Points => PrimitiveTopology::PointList,
        }
    }

    fn polygon_mode(&self) -> PolygonMode {
        match self {
            Primitive::Triangles { filled: false } => PolygonMode::Line,
            _ => PolygonMode::Fill,
        }
    }

    fn uses_line_width(&self) -> bool {
        matches!(self, Primitive::Lines | Primitive::Triangles { filled: false })
    }
}

/// Descriptor sets and dependency a draw resolved its texture and sampler to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DrawBindings {
    pub sampler_set: DescriptorSetHandle,
    pub texture_set: DescriptorSetHandle,
    pub border_color: bool,
    /// Set when the texture is a render target that must render first.
    pub dependency: Option<DependencyInfo>,
}

/// Where recorded draws will be executed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordTarget {
    pub render_pass: RenderPassHandle,
    pub samples: Multisamples,
}

/// Start of a render pass over a whole attachment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PassBegin {
    pub render_pass: RenderPassHandle,
    pub framebuffer: FramebufferHandle,
    pub extent: Extent2d,
    pub clear_color: [f32; 4],
}

#[derive(Debug, Default)]
pub(crate) struct BindingCache {
    pipeline: Option<PipelineSettings>,
    sampler: Option<DescriptorSetHandle>,
    texture: Option<DescriptorSetHandle>,
    line_width: Option<f32>,
}

impl BindingCache {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Check `geometry` against `primitive` and produce the index list to draw.
fn validate<'a>(primitive: Primitive, geometry: &DrawGeometry<'a>) -> RenderResult<Cow<'a, [u32]>> {
    let vertex_count = geometry.vertices.len();

    let indices: Cow<'a, [u32]> = match primitive {
        Primitive::Points => Cow::Owned((0..vertex_count as u32).collect()),
        _ => Cow::Borrowed(geometry.indices),
    };

    let per_primitive = primitive.indices_per_primitive();
    if indices.len() % per_primitive != 0 {
        return Err(RenderError::invalid(format!(
            "{} indices do not form whole primitives of {}",
            indices.len(),
            per_primitive
        )));
    }
    if let Some(index) = indices.iter().find(|&&i| i as usize >= vertex_count) {
        return Err(RenderError::invalid(format!(
            "index {} out of range for {} vertices",
            index, vertex_count
        )));
    }
    if !geometry.texture_layer_weights.is_empty()
        && geometry.texture_layer_weights.len() % vertex_count != 0
    {
        return Err(RenderError::invalid(format!(
            "{} texture layer weights for {} vertices",
            geometry.texture_layer_weights.len(),
            vertex_count
        )));
    }
    Ok(indices)
}

/// Draw commands of one window frame or render-target swap buffer.
#[derive(Debug, Default)]
pub(crate) struct DrawRecorder {
    commands: CommandList,
    bindings: BindingCache,
}

impl DrawRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget recorded draws and cached bindings.
    pub fn reset(&mut self) {
        self.commands.clear();
        self.bindings.reset();
    }

    pub fn reset_bindings(&mut self) {
        self.bindings.reset();
    }

    pub fn draw_count(&self) -> usize {
        self.commands.count_draws()
    }

    /// Append one draw. Empty geometry records nothing.
    pub fn record(
        &mut self,
        target: RecordTarget,
        mesh: &mut MeshBuffer,
        primitive: Primitive,
        geometry: DrawGeometry<'_>,
        bindings: &DrawBindings,
        line_width: f32,
    ) -> RenderResult<()> {
        if geometry.vertices.is_empty() {
            return Ok(());
        }
        let indices = validate(primitive, &geometry)?;
        if indices.is_empty() {
            return Ok(());
        }

        let layer_count = (geometry.texture_layer_weights.len() / geometry.vertices.len()) as u32;
        let offsets = mesh
            .push_mesh(
                &indices,
                geometry.vertices,
                geometry.texture_layer_weights,
                geometry.transformations,
            )
            .ok_or_else(|| RenderError::invalid("geometry buffer is full"))?;

        let pipeline = PipelineSettings {
            render_pass: target.render_pass,
            topology: primitive.topology(),
            polygon_mode: primitive.polygon_mode(),
            samples: target.samples,
            multitextured: layer_count > 1,
            border_color: bindings.border_color,
        };
        if self.bindings.pipeline != Some(pipeline) {
            self.commands.push(Command::BindPipeline(pipeline));
            self.bindings.pipeline = Some(pipeline);
        }
        if self.bindings.sampler != Some(bindings.sampler_set) {
            self.commands.push(Command::BindDescriptorSet {
                index: 0,
                set: bindings.sampler_set,
            });
            self.bindings.sampler = Some(bindings.sampler_set);
        }
        if self.bindings.texture != Some(bindings.texture_set) {
            self.commands.push(Command::BindDescriptorSet {
                index: 1,
                set: bindings.texture_set,
            });
            self.bindings.texture = Some(bindings.texture_set);
        }
        if primitive.uses_line_width() && self.bindings.line_width != Some(line_width) {
            self.commands.push(Command::SetLineWidth(line_width));
            self.bindings.line_width = Some(line_width);
        }

        self.commands.push(Command::DrawIndexed {
            index_count: indices.len() as u32,
            instance_count: geometry.transformations.len().max(1) as u32,
            constants: DrawConstants {
                transformation_offset: offsets.transform_offset,
                index_offset: offsets.first_index,
                index_count: indices.len() as u32,
                vertex_offset: offsets.vertex_offset,
                texture_layer_weight_offset: offsets.weight_offset,
                texture_layer_count: layer_count,
            },
        });
        Ok(())
    }

    /// Wrap the recorded draws in a render pass.
    pub fn build_render_pass(
        &self,
        begin: PassBegin,
        geometry: Option<(BufferHandle, GeometryLayout)>,
    ) -> CommandList {
        let mut commands = CommandList::new();
        commands.push(Command::BeginRenderPass {
            render_pass: begin.render_pass,
            framebuffer: begin.framebuffer,
            extent: begin.extent,
            clear_color: begin.clear_color,
        });
        commands.push(Command::SetViewport {
            extent: begin.extent,
        });
        if let Some((buffer, layout)) = geometry {
            commands.push(Command::BindGeometry {
                buffer,
                index_offset: layout.index_offset,
                vertex_offset: layout.vertex_offset,
            });
            commands.extend(&self.commands);
        }
        commands.push(Command::EndRenderPass);
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec2;

    fn quad() -> (Vec<u32>, Vec<Vertex>) {
        let vertices = vec![
            Vertex::new(Vec2::ZERO, Vec2::ZERO, [1.0; 4]),
            Vertex::new(Vec2::X, Vec2::X, [1.0; 4]),
            Vertex::new(Vec2::ONE, Vec2::ONE, [1.0; 4]),
            Vertex::new(Vec2::Y, Vec2::Y, [1.0; 4]),
        ];
        (vec![0, 1, 2, 0, 2, 3], vertices)
    }

    fn setup() -> (DummyDevice, RecordTarget, DrawBindings) {
        let device = DummyDevice::new();
        let render_pass = device
            .create_render_pass(&RenderPassDescriptor {
                label: None,
                format: TextureFormat::Bgra8Unorm,
                samples: Multisamples::X1,
                final_layout: FinalLayout::Present,
            })
            .unwrap();
        let set = device
            .create_descriptor_set(&DescriptorBinding::Sampler(
                device.create_sampler(&SamplerDescriptor::default()).unwrap(),
            ))
            .unwrap();
        let bindings = DrawBindings {
            sampler_set: set,
            texture_set: set,
            border_color: false,
            dependency: None,
        };
        (
            device,
            RecordTarget {
                render_pass,
                samples: Multisamples::X1,
            },
            bindings,
        )
    }

    #[test]
    fn test_bindings_emitted_once() {
        let (_device, target, bindings) = setup();
        let (indices, vertices) = quad();
        let mut recorder = DrawRecorder::new();
        let mut mesh = MeshBuffer::new("test");

        for _ in 0..3 {
            recorder
                .record(
                    target,
                    &mut mesh,
                    Primitive::Triangles { filled: true },
                    DrawGeometry::new(&indices, &vertices),
                    &bindings,
                    1.0,
                )
                .unwrap();
        }

        let binds = recorder
            .commands
            .iter()
            .filter(|c| matches!(c, Command::BindPipeline(_) | Command::BindDescriptorSet { .. }))
            .count();
        assert_eq!(binds, 3);
        assert_eq!(recorder.draw_count(), 3);
    }

    #[test]
    fn test_line_width_only_on_change() {
        let (_device, target, bindings) = setup();
        let (_, vertices) = quad();
        let lines = [0, 1, 1, 2];
        let mut recorder = DrawRecorder::new();
        let mut mesh = MeshBuffer::new("test");

        for width in [2.0, 2.0, 3.0] {
            recorder
                .record(
                    target,
                    &mut mesh,
                    Primitive::Lines,
                    DrawGeometry::new(&lines, &vertices),
                    &bindings,
                    width,
                )
                .unwrap();
        }
        let widths = recorder
            .commands
            .iter()
            .filter(|c| matches!(c, Command::SetLineWidth(_)))
            .count();
        assert_eq!(widths, 2);
    }

    #[test]
    fn test_invalid_geometry_rejected() {
        let (_device, target, bindings) = setup();
        let (_, vertices) = quad();
        let mut recorder = DrawRecorder::new();
        let mut mesh = MeshBuffer::new("test");

        let out_of_range = recorder.record(
            target,
            &mut mesh,
            Primitive::Triangles { filled: true },
            DrawGeometry::new(&[0, 1, 7], &vertices),
            &bindings,
            1.0,
        );
        assert!(matches!(out_of_range, Err(RenderError::InvalidParameter(_))));

        let partial = recorder.record(
            target,
            &mut mesh,
            Primitive::Lines,
            DrawGeometry::new(&[0, 1, 2], &vertices),
            &bindings,
            1.0,
        );
        assert!(partial.is_err());
        assert!(mesh.is_empty());
        assert_eq!(recorder.draw_count(), 0);
    }

    #[test]
    fn test_points_generate_indices() {
        let (_device, target, bindings) = setup();
        let (_, vertices) = quad();
        let mut recorder = DrawRecorder::new();
        let mut mesh = MeshBuffer::new("test");

        recorder
            .record(
                target,
                &mut mesh,
                Primitive::Points,
                DrawGeometry::new(&[], &vertices),
                &bindings,
                1.0,
            )
            .unwrap();
        assert_eq!(mesh.index_count(), 4);
    }

    #[test]
    fn test_multitexture_pipeline() {
        let (_device, target, bindings) = setup();
        let (indices, vertices) = quad();
        let weights = [0.5f32; 8];
        let mut recorder = DrawRecorder::new();
        let mut mesh = MeshBuffer::new("test");

        recorder
            .record(
                target,
                &mut mesh,
                Primitive::Triangles { filled: true },
                DrawGeometry::new(&indices, &vertices).with_texture_layer_weights(&weights),
                &bindings,
                1.0,
            )
            .unwrap();
        let multitextured = recorder.commands.iter().any(|c| {
            matches!(c, Command::BindPipeline(settings) if settings.multitextured)
        });
        assert!(multitextured);
    }
}
