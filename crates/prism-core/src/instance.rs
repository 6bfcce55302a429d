//! Per-instance render record.

use glam::{Mat4, Vec3, Vec4};

/// Packed per-instance data uploaded to the instance buffer (slot 1).
///
/// Layout matches the `I_*` inputs of the world shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRenderData {
    /// Model matrix, column-major.
    pub model: [[f32; 4]; 4],
    /// Scale applied to the unit geometry (w unused).
    pub size: [f32; 4],
    /// Linear RGBA colour.
    pub colour: [f32; 4],
    /// Packed material index, see [`crate::Material::packed_index`].
    pub material_index: u32,
    pub _padding: [u32; 3],
}

impl InstanceRenderData {
    /// Size of one record in bytes.
    pub const STRIDE: usize = std::mem::size_of::<Self>();

    /// Creates a record from a transform, size, colour and material index.
    #[must_use]
    pub fn new(model: Mat4, size: Vec3, colour: Vec4, material_index: u32) -> Self {
        Self {
            model: model.to_cols_array_2d(),
            size: size.extend(0.0).to_array(),
            colour: colour.to_array(),
            material_index,
            _padding: [0; 3],
        }
    }

    /// Returns the model matrix.
    #[must_use]
    pub fn model_matrix(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.model)
    }

    /// Returns the record as raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

impl Default for InstanceRenderData {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, Vec3::ONE, Vec4::ONE, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride() {
        assert_eq!(InstanceRenderData::STRIDE, 112);
        assert_eq!(InstanceRenderData::STRIDE % 16, 0);
    }

    #[test]
    fn test_new_preserves_fields() {
        let model = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let data = InstanceRenderData::new(model, Vec3::splat(2.0), Vec4::new(1.0, 0.0, 0.0, 1.0), 9);
        assert_eq!(data.model_matrix(), model);
        assert_eq!(data.size, [2.0, 2.0, 2.0, 0.0]);
        assert_eq!(data.material_index, 9);
        assert_eq!(data.as_bytes().len(), 112);
    }
}
