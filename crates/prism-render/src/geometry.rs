//! Shared mesh geometry with lazily created GPU buffers.

use std::sync::Mutex;

use prism_core::{MeshData, PrimitiveShape, PrimitiveTopology, Vertex};

use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::gpu::{BufferDescriptor, BufferId, BufferUsage, GpuDevice};
use crate::sync::lock;

/// GPU buffers of a [`Geometry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryBuffers {
    pub vertices: BufferId,
    /// Present for skinned meshes. Not read by the world shader.
    pub skin_weights: Option<BufferId>,
    pub indices: BufferId,
    pub index_count: u32,
}

/// An immutable mesh identified by name.
///
/// Buffers are created and uploaded on first use by a render object.
#[derive(Debug)]
pub struct Geometry {
    name: String,
    mesh: MeshData,
    buffers: Mutex<Option<GeometryBuffers>>,
}

impl Geometry {
    /// Validates `mesh` and wraps it.
    pub fn new(name: impl Into<String>, mesh: MeshData) -> RenderResult<Self> {
        let name = name.into();
        mesh.validate(&name)?;
        Ok(Self {
            name,
            mesh,
            buffers: Mutex::new(None),
        })
    }

    /// Built-in primitive shape.
    pub fn primitive(shape: PrimitiveShape) -> Self {
        Self {
            name: shape.name().to_string(),
            mesh: shape.mesh(),
            buffers: Mutex::new(None),
        }
    }

    /// Registry key.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mesh(&self) -> &MeshData {
        &self.mesh
    }

    pub fn topology(&self) -> PrimitiveTopology {
        self.mesh.topology
    }

    pub fn index_count(&self) -> u32 {
        self.mesh.indices.len() as u32
    }

    /// Whether GPU buffers exist.
    pub fn is_uploaded(&self) -> bool {
        lock(&self.buffers).is_some()
    }

    /// GPU buffers, creating and uploading them on first call.
    pub fn buffers(&self, ctx: &mut RenderContext<'_>) -> RenderResult<GeometryBuffers> {
        let mut slot = lock(&self.buffers);
        if let Some(buffers) = *slot {
            return Ok(buffers);
        }

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&self.mesh.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&self.mesh.indices);
        let vertices = self.upload(ctx, "vertices", BufferUsage::Vertex, vertex_bytes)?;
        let indices = match self.upload(ctx, "indices", BufferUsage::Index, index_bytes) {
            Ok(id) => id,
            Err(err) => {
                ctx.device().destroy_buffer(vertices);
                return Err(err);
            }
        };
        let skin_weights = match &self.mesh.skin_weights {
            Some(weights) => {
                let bytes: &[u8] = bytemuck::cast_slice(weights);
                match self.upload(ctx, "skin weights", BufferUsage::Vertex, bytes) {
                    Ok(id) => Some(id),
                    Err(err) => {
                        ctx.device().destroy_buffer(vertices);
                        ctx.device().destroy_buffer(indices);
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        let buffers = GeometryBuffers {
            vertices,
            skin_weights,
            indices,
            index_count: self.index_count(),
        };
        *slot = Some(buffers);
        Ok(buffers)
    }

    fn upload(
        &self,
        ctx: &mut RenderContext<'_>,
        what: &str,
        usage: BufferUsage,
        bytes: &[u8],
    ) -> RenderResult<BufferId> {
        let label = format!("{} {what}", self.name);
        // Zero-sized buffers are invalid; keep at least one element.
        let size = (bytes.len() as u64).max(u64::from(Vertex::STRIDE));
        let id = ctx.device().create_buffer(&BufferDescriptor {
            label: &label,
            size,
            usage,
        })?;
        if !bytes.is_empty() {
            if let Err(err) = ctx.commands.write_buffer(id, bytes) {
                ctx.device().destroy_buffer(id);
                return Err(err);
            }
        }
        Ok(id)
    }

    /// Destroys the GPU buffers; the next draw uploads again.
    pub fn release(&self, device: &dyn GpuDevice) {
        if let Some(buffers) = lock(&self.buffers).take() {
            device.destroy_buffer(buffers.vertices);
            device.destroy_buffer(buffers.indices);
            if let Some(weights) = buffers.skin_weights {
                device.destroy_buffer(weights);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordingContext;
    use crate::context::FrameBindings;
    use prism_core::Vec3;

    #[test]
    fn test_buffers_are_created_once() {
        let mut commands = RecordingContext::new(8, 8);
        let device = commands.recording_device().clone();
        let mut ctx = RenderContext::new(&mut commands, FrameBindings::default());

        let cube = Geometry::primitive(PrimitiveShape::Cube);
        let first = cube.buffers(&mut ctx).unwrap();
        let second = cube.buffers(&mut ctx).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.index_count, 36);
        assert_eq!(device.buffers_created(), 2);

        let uploaded = device.buffer_contents(first.indices).unwrap();
        assert_eq!(uploaded.len(), 36 * 4);
    }

    #[test]
    fn test_skinned_mesh_uploads_weights() {
        let mut commands = RecordingContext::new(8, 8);
        let mut ctx = RenderContext::new(&mut commands, FrameBindings::default());

        let mut mesh = MeshData::new();
        mesh.vertices = vec![
            Vertex::new(Vec3::ZERO, Vec3::Y, [0.0, 0.0]),
            Vertex::new(Vec3::X, Vec3::Y, [1.0, 0.0]),
            Vertex::new(Vec3::Z, Vec3::Y, [0.0, 1.0]),
        ];
        mesh.indices = vec![0, 1, 2];
        mesh.skin_weights = Some(vec![[1.0, 0.0, 0.0, 0.0]; 3]);
        let geometry = Geometry::new("skinned", mesh).unwrap();

        let buffers = geometry.buffers(&mut ctx).unwrap();
        assert!(buffers.skin_weights.is_some());
    }

    #[test]
    fn test_invalid_mesh_is_rejected() {
        let mut mesh = MeshData::new();
        mesh.indices = vec![0, 1, 2];
        assert!(Geometry::new("broken", mesh).is_err());
    }

    #[test]
    fn test_release_destroys_buffers() {
        let mut commands = RecordingContext::new(8, 8);
        let device = commands.recording_device().clone();
        let mut ctx = RenderContext::new(&mut commands, FrameBindings::default());

        let sphere = Geometry::primitive(PrimitiveShape::Sphere);
        sphere.buffers(&mut ctx).unwrap();
        assert!(sphere.is_uploaded());
        sphere.release(device.as_ref());
        assert!(!sphere.is_uploaded());
        assert_eq!(device.live_buffers(), 0);
    }
}
