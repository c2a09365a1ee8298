//! 2D mesh data structures and generation

use glam::{Mat4, Vec2};

use crate::backend::types::Vertex;
use crate::resources::{Sampler, Texture};

/// How a mesh's indices are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MeshType {
    /// Every 3 indices form a filled triangle.
    #[default]
    TriangleFilled,
    /// Every 3 indices form a triangle; only its edges are drawn.
    TriangleWireframe,
    /// Every 2 indices form a line.
    Line,
    /// Each vertex is a point; indices are ignored.
    Point,
}

/// A mesh with vertex and index data plus how to draw it.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    /// `layer_count` weights per vertex; empty for single-layer textures.
    pub texture_layer_weights: Vec<f32>,
    pub mesh_type: MeshType,
    pub line_width: f32,
    pub texture: Option<Texture>,
    pub sampler: Option<Sampler>,
}

impl Mesh {
    pub fn new(mesh_type: MeshType) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            texture_layer_weights: Vec::new(),
            mesh_type,
            line_width: 1.0,
            texture: None,
            sampler: None,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn with_texture(mut self, texture: Texture) -> Self {
        self.texture = Some(texture);
        self
    }

    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_color(mut self, color: [f32; 4]) -> Self {
        for vertex in &mut self.vertices {
            vertex.color = color;
        }
        self
    }

    /// Apply `transform` to every vertex position.
    pub fn transform(&mut self, transform: Mat4) {
        for vertex in &mut self.vertices {
            vertex.position = transform.transform_point3(vertex.position.extend(0.0)).truncate();
        }
    }

    /// Axis aligned rectangle from `min` to `max`, UVs covering 0..1.
    pub fn rectangle(min: Vec2, max: Vec2, filled: bool) -> Self {
        let corners = [
            (Vec2::new(min.x, min.y), Vec2::new(0.0, 0.0)),
            (Vec2::new(max.x, min.y), Vec2::new(1.0, 0.0)),
            (Vec2::new(max.x, max.y), Vec2::new(1.0, 1.0)),
            (Vec2::new(min.x, max.y), Vec2::new(0.0, 1.0)),
        ];

        let mut mesh = if filled {
            let mut mesh = Mesh::new(MeshType::TriangleFilled);
            mesh.indices = vec![0, 1, 2, 0, 2, 3];
            mesh
        } else {
            let mut mesh = Mesh::new(MeshType::Line);
            mesh.indices = vec![0, 1, 1, 2, 2, 3, 3, 0];
            mesh
        };
        mesh.vertices = corners
            .iter()
            .map(|(position, uv)| Vertex::new(*position, *uv, [1.0; 4]))
            .collect();
        mesh
    }

    /// Ellipse inscribed in the rectangle `min`..`max`, approximated with
    /// `edge_count` edges.
    pub fn ellipse(min: Vec2, max: Vec2, filled: bool, edge_count: u32) -> Self {
        let edge_count = edge_count.max(3);
        let center = (min + max) * 0.5;
        let radius = (max - min) * 0.5;

        let mut mesh = Mesh::new(if filled {
            MeshType::TriangleFilled
        } else {
            MeshType::Line
        });

        if filled {
            mesh.vertices
                .push(Vertex::new(center, Vec2::splat(0.5), [1.0; 4]));
        }
        let first_rim = mesh.vertices.len() as u32;
        for i in 0..edge_count {
            let angle = i as f32 / edge_count as f32 * std::f32::consts::TAU;
            let direction = Vec2::new(angle.cos(), angle.sin());
            mesh.vertices.push(Vertex::new(
                center + direction * radius,
                direction * 0.5 + Vec2::splat(0.5),
                [1.0; 4],
            ));
        }

        for i in 0..edge_count {
            let current = first_rim + i;
            let next = first_rim + (i + 1) % edge_count;
            if filled {
                mesh.indices.extend_from_slice(&[0, current, next]);
            } else {
                mesh.indices.extend_from_slice(&[current, next]);
            }
        }
        mesh
    }

    /// Connected line strip through `points`.
    pub fn line_strip(points: &[Vec2], closed: bool) -> Self {
        let mut mesh = Mesh::new(MeshType::Line);
        mesh.vertices = points
            .iter()
            .map(|p| Vertex::new(*p, Vec2::ZERO, [1.0; 4]))
            .collect();

        let count = points.len() as u32;
        for i in 1..count {
            mesh.indices.extend_from_slice(&[i - 1, i]);
        }
        if closed && count > 2 {
            mesh.indices.extend_from_slice(&[count - 1, 0]);
        }
        mesh
    }

    /// A point per position.
    pub fn points(positions: &[Vec2], point_size: f32) -> Self {
        let mut mesh = Mesh::new(MeshType::Point);
        mesh.vertices = positions
            .iter()
            .map(|p| Vertex {
                point_size,
                ..Vertex::new(*p, Vec2::ZERO, [1.0; 4])
            })
            .collect();
        mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rectangle() {
        let filled = Mesh::rectangle(Vec2::ZERO, Vec2::new(10.0, 5.0), true);
        assert_eq!(filled.vertex_count(), 4);
        assert_eq!(filled.index_count(), 6);
        assert_eq!(filled.mesh_type, MeshType::TriangleFilled);

        let outline = Mesh::rectangle(Vec2::ZERO, Vec2::new(10.0, 5.0), false);
        assert_eq!(outline.index_count(), 8);
        assert_eq!(outline.mesh_type, MeshType::Line);
    }

    #[test]
    fn test_ellipse_indices_in_range() {
        for filled in [true, false] {
            let mesh = Mesh::ellipse(Vec2::ZERO, Vec2::splat(2.0), filled, 16);
            let count = mesh.vertex_count() as u32;
            assert!(mesh.indices.iter().all(|&i| i < count));
        }
    }

    #[test]
    fn test_line_strip() {
        let points = [Vec2::ZERO, Vec2::X, Vec2::ONE];
        assert_eq!(Mesh::line_strip(&points, false).index_count(), 4);
        assert_eq!(Mesh::line_strip(&points, true).index_count(), 6);
    }

    #[test]
    fn test_transform() {
        let mut mesh = Mesh::rectangle(Vec2::ZERO, Vec2::ONE, true);
        mesh.transform(Mat4::from_translation(glam::Vec3::new(2.0, 3.0, 0.0)));
        assert_eq!(mesh.vertices[0].position, Vec2::new(2.0, 3.0));
    }
}
