//! Typed constant buffers and the constant blocks the shaders read.
//!
//! Slots: 0 camera, 1 lighting, 2 shadow receiver, 3 post-process.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use prism_core::LightingSettings;

use crate::camera::Camera;
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::gpu::{BufferDescriptor, BufferId, BufferUsage, GpuDevice};

/// Slot of [`CameraConstants`].
pub const CAMERA_SLOT: u32 = 0;
/// Slot of [`LightingConstants`].
pub const LIGHTING_SLOT: u32 = 1;
/// Slot of [`ShadowReceiverConstants`].
pub const SHADOW_RECEIVER_SLOT: u32 = 2;
/// Slot of [`PostProcessConstants`].
pub const POST_PROCESS_SLOT: u32 = 3;

/// A CPU value of type `T` mirrored into a GPU constant buffer.
///
/// The GPU buffer is created by [`ConstantBuffer::bind_to_device`] (or by
/// the first [`ConstantBuffer::update`]) and is `max(16, size_of::<T>())`
/// rounded up to 16 bytes. After [`ConstantBuffer::dispose`], updates and
/// binds do nothing.
#[derive(Debug)]
pub struct ConstantBuffer<T: Pod> {
    label: String,
    value: T,
    buffer: Option<BufferId>,
    disposed: bool,
}

impl<T: Pod> ConstantBuffer<T> {
    /// GPU size in bytes.
    pub const SIZE: u64 = padded_size(std::mem::size_of::<T>());

    pub fn new(label: impl Into<String>, value: T) -> Self {
        Self {
            label: label.into(),
            value,
            buffer: None,
            disposed: false,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
    }

    /// The GPU buffer, once created and until disposed.
    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Creates the GPU buffer. Calling it again, or after dispose, is a no-op.
    pub fn bind_to_device(&mut self, device: &dyn GpuDevice) -> RenderResult<()> {
        if self.buffer.is_some() || self.disposed {
            return Ok(());
        }
        self.buffer = Some(device.create_buffer(&BufferDescriptor {
            label: &self.label,
            size: Self::SIZE,
            usage: BufferUsage::Constant,
        })?);
        Ok(())
    }

    /// Uploads the current value, replacing the whole buffer.
    pub fn update(&mut self, ctx: &mut RenderContext<'_>) -> RenderResult<()> {
        if self.disposed {
            return Ok(());
        }
        self.bind_to_device(ctx.device())?;
        let Some(buffer) = self.buffer else {
            return Ok(());
        };

        let mut bytes = vec![0u8; Self::SIZE as usize];
        let value = bytemuck::bytes_of(&self.value);
        bytes[..value.len()].copy_from_slice(value);
        ctx.commands.write_buffer(buffer, &bytes)
    }

    /// Binds the buffer to `slot`.
    pub fn bind(&self, ctx: &mut RenderContext<'_>, slot: u32) {
        if let Some(buffer) = self.buffer {
            ctx.commands.set_constant_buffer(slot, buffer);
        }
    }

    /// Destroys the GPU buffer. Later calls are no-ops.
    pub fn dispose(&mut self, device: &dyn GpuDevice) {
        if let Some(buffer) = self.buffer.take() {
            device.destroy_buffer(buffer);
        }
        self.disposed = true;
    }
}

const fn padded_size(size: usize) -> u64 {
    let size = size as u64;
    let rounded = size.div_ceil(16) * 16;
    if rounded < 16 {
        16
    } else {
        rounded
    }
}

/// Camera block (slot 0). Also carries a cascade matrix during shadow passes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraConstants {
    pub view: [[f32; 4]; 4],
    pub view_proj: [[f32; 4]; 4],
    pub inv_view_proj: [[f32; 4]; 4],
    pub position: [f32; 4],
}

impl CameraConstants {
    pub fn from_camera(camera: &Camera) -> Self {
        Self::from_matrices(
            camera.view_matrix(),
            camera.view_projection_matrix(),
            camera.position,
        )
    }

    /// Block for an arbitrary view and view-projection (shadow cascades).
    pub fn from_matrices(view: Mat4, view_proj: Mat4, position: Vec3) -> Self {
        Self {
            view: view.to_cols_array_2d(),
            view_proj: view_proj.to_cols_array_2d(),
            inv_view_proj: view_proj.inverse().to_cols_array_2d(),
            position: position.extend(1.0).to_array(),
        }
    }
}

impl Default for CameraConstants {
    fn default() -> Self {
        Self::from_matrices(Mat4::IDENTITY, Mat4::IDENTITY, Vec3::ZERO)
    }
}

/// Lighting block (slot 1).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightingConstants {
    /// xyz: direction the light travels, w: intensity.
    pub sun_direction: [f32; 4],
    pub sun_colour: [f32; 4],
    pub ambient: [f32; 4],
    pub sky_zenith: [f32; 4],
    pub sky_horizon: [f32; 4],
    /// rgb: colour, a: density.
    pub haze: [f32; 4],
}

impl From<&LightingSettings> for LightingConstants {
    fn from(settings: &LightingSettings) -> Self {
        let rgb = |c: Vec3| c.extend(1.0).to_array();
        Self {
            sun_direction: settings
                .light_direction()
                .extend(settings.sun_intensity)
                .to_array(),
            sun_colour: rgb(settings.sun_colour),
            ambient: rgb(settings.ambient),
            sky_zenith: rgb(settings.sky_zenith),
            sky_horizon: rgb(settings.sky_horizon),
            haze: settings
                .haze_colour
                .extend(settings.haze_density)
                .to_array(),
        }
    }
}

impl Default for LightingConstants {
    fn default() -> Self {
        Self::from(&LightingSettings::default())
    }
}

/// Shadow receiver block (slot 2).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ShadowReceiverConstants {
    /// World to shadow-texture space of the first cascade's light view.
    pub global_matrix: [[f32; 4]; 4],
    /// View-space far distance of each cascade.
    pub splits: [f32; 4],
    pub offsets: [[f32; 4]; 4],
    pub scales: [[f32; 4]; 4],
    /// x: cascade count, y: depth bias, z: enabled, w: map size.
    pub params: [f32; 4],
}

impl Default for ShadowReceiverConstants {
    fn default() -> Self {
        Self {
            global_matrix: Mat4::IDENTITY.to_cols_array_2d(),
            splits: [0.0; 4],
            offsets: [[0.0; 4]; 4],
            scales: [[1.0; 4]; 4],
            params: [0.0; 4],
        }
    }
}

/// Post-process block (slot 3).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PostProcessConstants {
    /// x: strength, y: inner radius, z: softness.
    pub vignette: [f32; 4],
}

impl PostProcessConstants {
    pub fn vignette(strength: f32, radius: f32, softness: f32) -> Self {
        Self {
            vignette: [strength, radius, softness, 0.0],
        }
    }
}

impl Default for PostProcessConstants {
    fn default() -> Self {
        Self::vignette(0.35, 0.55, 0.45)
    }
}
