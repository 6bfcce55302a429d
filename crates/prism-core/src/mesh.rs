//! CPU-side mesh data supplied by the asset pipeline.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::{PrismError, Result};

/// Primitive assembly mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PrimitiveTopology {
    /// Independent points.
    PointList,
    /// Independent line segments.
    LineList,
    /// Connected line strip.
    LineStrip,
    /// Independent triangles.
    #[default]
    TriangleList,
    /// Connected triangle strip.
    TriangleStrip,
}

/// GPU vertex layout shared by every mesh (slot 0).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    /// Size of one vertex in bytes.
    pub const STRIDE: u32 = std::mem::size_of::<Self>() as u32;

    /// Creates a vertex.
    #[must_use]
    pub fn new(position: Vec3, normal: Vec3, uv: [f32; 2]) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            uv,
        }
    }
}

/// Mesh data: vertices, optional skin weights and indices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    /// Four bone weights per vertex, present for skinned meshes.
    pub skin_weights: Option<Vec<[f32; 4]>>,
    pub indices: Vec<u32>,
    pub topology: PrimitiveTopology,
}

impl MeshData {
    /// Creates an empty triangle-list mesh.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of vertices.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of triangles, for triangle lists.
    #[must_use]
    pub fn triangle_count(&self) -> usize {
        match self.topology {
            PrimitiveTopology::TriangleList => self.indices.len() / 3,
            PrimitiveTopology::TriangleStrip => self.indices.len().saturating_sub(2),
            _ => 0,
        }
    }

    /// Whether the mesh carries skin weights.
    #[must_use]
    pub fn is_skinned(&self) -> bool {
        self.skin_weights.is_some()
    }

    /// Checks that indices and skin weights agree with the vertex list.
    pub fn validate(&self, name: &str) -> Result<()> {
        let count = self.vertices.len();
        if let Some(index) = self.indices.iter().find(|&&i| i as usize >= count) {
            return Err(PrismError::InvalidMesh(
                name.to_string(),
                format!("index {index} out of range for {count} vertices"),
            ));
        }
        if let Some(weights) = &self.skin_weights {
            if weights.len() != count {
                return Err(PrismError::InvalidMesh(
                    name.to_string(),
                    format!("{} skin weights for {count} vertices", weights.len()),
                ));
            }
        }
        if self.topology == PrimitiveTopology::TriangleList && self.indices.len() % 3 != 0 {
            return Err(PrismError::InvalidMesh(
                name.to_string(),
                format!("{} indices is not a whole number of triangles", self.indices.len()),
            ));
        }
        Ok(())
    }

    /// Appends a planar convex polygon as a triangle fan with a shared face normal.
    pub(crate) fn push_face(&mut self, corners: &[Vec3], uvs: &[[f32; 2]]) {
        let normal = (corners[1] - corners[0])
            .cross(corners[2] - corners[0])
            .normalize_or_zero();
        let base = self.vertices.len() as u32;
        for (corner, uv) in corners.iter().zip(uvs) {
            self.vertices.push(Vertex::new(*corner, normal, *uv));
        }
        for i in 1..corners.len() as u32 - 1 {
            self.indices.extend_from_slice(&[base, base + i, base + i + 1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_stride() {
        assert_eq!(Vertex::STRIDE, 32);
    }

    #[test]
    fn test_push_face_fans_quad() {
        let mut mesh = MeshData::new();
        mesh.push_face(
            &[
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            &[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]],
        );
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.indices, vec![0, 1, 2, 0, 2, 3]);
        assert_eq!(mesh.vertices[0].normal, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_validate_rejects_out_of_range_index() {
        let mut mesh = MeshData::new();
        mesh.vertices.push(Vertex::new(Vec3::ZERO, Vec3::Y, [0.0, 0.0]));
        mesh.indices = vec![0, 0, 3];
        assert!(mesh.validate("broken").is_err());
    }

    #[test]
    fn test_validate_rejects_mismatched_skin_weights() {
        let mut mesh = MeshData::new();
        mesh.vertices.push(Vertex::new(Vec3::ZERO, Vec3::Y, [0.0, 0.0]));
        mesh.skin_weights = Some(vec![]);
        assert!(mesh.validate("skinned").is_err());
    }
}
