//! Procedural meshes for the built-in primitive shapes.
//!
//! All shapes fit the unit cube centred on the origin; instances scale them
//! through their size vector.

use std::f32::consts::TAU;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::mesh::{MeshData, Vertex};

/// Built-in primitive shapes that every world can draw without assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveShape {
    Cube,
    Sphere,
    Cylinder,
    Wedge,
}

impl PrimitiveShape {
    /// All shapes in draw order.
    pub const ALL: [PrimitiveShape; 4] = [
        PrimitiveShape::Cube,
        PrimitiveShape::Sphere,
        PrimitiveShape::Cylinder,
        PrimitiveShape::Wedge,
    ];

    /// Stable geometry name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveShape::Cube => "primitive:cube",
            PrimitiveShape::Sphere => "primitive:sphere",
            PrimitiveShape::Cylinder => "primitive:cylinder",
            PrimitiveShape::Wedge => "primitive:wedge",
        }
    }

    /// Generates the mesh for this shape.
    #[must_use]
    pub fn mesh(self) -> MeshData {
        match self {
            PrimitiveShape::Cube => cube(),
            PrimitiveShape::Sphere => sphere(16, 12),
            PrimitiveShape::Cylinder => cylinder(16),
            PrimitiveShape::Wedge => wedge(),
        }
    }
}

const QUAD_UVS: [[f32; 2]; 4] = [[0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]];

/// Unit cube, 24 vertices so each face has its own normal.
#[must_use]
pub fn cube() -> MeshData {
    let mut mesh = MeshData::new();
    let h = 0.5;
    let faces = [
        // +Z, -Z, -X, +X, +Y, -Y
        [[-h, -h, h], [h, -h, h], [h, h, h], [-h, h, h]],
        [[h, -h, -h], [-h, -h, -h], [-h, h, -h], [h, h, -h]],
        [[-h, -h, -h], [-h, -h, h], [-h, h, h], [-h, h, -h]],
        [[h, -h, h], [h, -h, -h], [h, h, -h], [h, h, h]],
        [[-h, h, h], [h, h, h], [h, h, -h], [-h, h, -h]],
        [[-h, -h, -h], [h, -h, -h], [h, -h, h], [-h, -h, h]],
    ];
    for face in faces {
        let corners = face.map(Vec3::from_array);
        mesh.push_face(&corners, &QUAD_UVS);
    }
    mesh
}

/// UV sphere of diameter 1.
#[must_use]
pub fn sphere(longitude_segments: u32, latitude_segments: u32) -> MeshData {
    let mut mesh = MeshData::new();
    let long_segs = longitude_segments.max(3);
    let lat_segs = latitude_segments.max(2);

    for lat in 0..=lat_segs {
        let theta = lat as f32 * std::f32::consts::PI / lat_segs as f32;
        for long in 0..=long_segs {
            let phi = long as f32 * TAU / long_segs as f32;
            let normal = Vec3::new(theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin());
            let uv = [long as f32 / long_segs as f32, lat as f32 / lat_segs as f32];
            mesh.vertices.push(Vertex::new(normal * 0.5, normal, uv));
        }
    }

    let row = long_segs + 1;
    for lat in 0..lat_segs {
        for long in 0..long_segs {
            let a = lat * row + long;
            let b = a + row;
            mesh.indices.extend_from_slice(&[a, a + 1, b, b, a + 1, b + 1]);
        }
    }
    mesh
}

/// Cylinder of diameter 1 and height 1 along the Y axis.
#[must_use]
pub fn cylinder(segments: u32) -> MeshData {
    let mut mesh = MeshData::new();
    let segs = segments.max(3);
    let ring = |i: u32, y: f32| {
        let phi = i as f32 * TAU / segs as f32;
        Vec3::new(phi.cos() * 0.5, y, -phi.sin() * 0.5)
    };

    for i in 0..segs {
        let u0 = i as f32 / segs as f32;
        let u1 = (i + 1) as f32 / segs as f32;
        let (b0, b1) = (ring(i, -0.5), ring(i + 1, -0.5));
        let (t0, t1) = (ring(i, 0.5), ring(i + 1, 0.5));
        let base = mesh.vertices.len() as u32;
        for (position, u, v) in [(b0, u0, 1.0), (b1, u1, 1.0), (t1, u1, 0.0), (t0, u0, 0.0)] {
            let normal = Vec3::new(position.x, 0.0, position.z).normalize_or_zero();
            mesh.vertices.push(Vertex::new(position, normal, [u, v]));
        }
        mesh.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    let cap_uv = |p: Vec3| [p.x + 0.5, p.z + 0.5];
    let top: Vec<Vec3> = (0..segs).map(|i| ring(i, 0.5)).collect();
    let top_uvs: Vec<[f32; 2]> = top.iter().map(|p| cap_uv(*p)).collect();
    mesh.push_face(&top, &top_uvs);

    let bottom: Vec<Vec3> = (0..segs).rev().map(|i| ring(i, -0.5)).collect();
    let bottom_uvs: Vec<[f32; 2]> = bottom.iter().map(|p| cap_uv(*p)).collect();
    mesh.push_face(&bottom, &bottom_uvs);
    mesh
}

/// Unit wedge: a cube cut diagonally from the top of the back face to the
/// bottom of the front face.
#[must_use]
pub fn wedge() -> MeshData {
    let mut mesh = MeshData::new();
    let h = 0.5;
    let v = |x: f32, y: f32, z: f32| Vec3::new(x, y, z);

    // bottom
    mesh.push_face(
        &[v(-h, -h, -h), v(h, -h, -h), v(h, -h, h), v(-h, -h, h)],
        &QUAD_UVS,
    );
    // back
    mesh.push_face(
        &[v(h, -h, -h), v(-h, -h, -h), v(-h, h, -h), v(h, h, -h)],
        &QUAD_UVS,
    );
    // slope
    mesh.push_face(
        &[v(-h, -h, h), v(h, -h, h), v(h, h, -h), v(-h, h, -h)],
        &QUAD_UVS,
    );
    // sides
    mesh.push_face(
        &[v(-h, -h, -h), v(-h, -h, h), v(-h, h, -h)],
        &[[0.0, 1.0], [1.0, 1.0], [0.0, 0.0]],
    );
    mesh.push_face(
        &[v(h, -h, h), v(h, -h, -h), v(h, h, -h)],
        &[[0.0, 1.0], [1.0, 1.0], [1.0, 0.0]],
    );
    mesh
}
