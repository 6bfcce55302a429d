//! Cascaded shadow maps.
//!
//! Each frame the camera's view range is divided into up to four slices.
//! Every slice gets a light-space orthographic camera fitted around its
//! bounding sphere, with the projection origin snapped to whole shadow-map
//! texels so shadows stay still while the camera moves. Casters are drawn
//! into one layer of a depth array per cascade; receivers read the layers
//! through one constant block.

use glam::{Mat4, Vec2, Vec3};
use prism_core::{CascadePartition, ShadowOptions, MAX_CASCADES};

use crate::camera::{Camera, CameraId};
use crate::constant_buffer::{
    CameraConstants, ConstantBuffer, ShadowReceiverConstants, CAMERA_SLOT,
};
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::gpu::{DepthTargetId, GpuDevice, RenderTarget};
use crate::world_renderer::WorldRenderer;

/// Progress through one shadow update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CascadeStage {
    #[default]
    Idle,
    SplitsComputed,
    /// Cascade `i` is fitted and its depth is being rendered.
    CascadeFitted(usize),
    ReceiverDataUploaded,
}

/// Light-space camera of one cascade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cascade {
    /// View depth where the cascade starts.
    pub near_depth: f32,
    /// View depth where the cascade ends.
    pub far_depth: f32,
    /// Bounding sphere of the frustum slice.
    pub center: Vec3,
    pub radius: f32,
    /// Light camera position.
    pub eye: Vec3,
    pub view: Mat4,
    /// Orthographic projection including the texel snap.
    pub projection: Mat4,
    pub view_projection: Mat4,
    /// Clip-space translation folded into the projection.
    pub snap: Vec2,
}

/// Maps clip space to shadow texture space (u right, v down, depth kept).
fn texture_scale_bias() -> Mat4 {
    Mat4::from_cols_array(&[
        0.5, 0.0, 0.0, 0.0, //
        0.0, -0.5, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.5, 0.5, 0.0, 1.0,
    ])
}

/// Far end of every cascade as a distance from the near plane.
///
/// Values are non-decreasing and lie in `[0, far - near]`. Computed
/// partitions blend uniform and logarithmic splits by the partition's lambda
/// and always end at `far - near`.
pub fn split_distances(
    partition: CascadePartition,
    count: usize,
    near: f32,
    far: f32,
) -> Vec<f32> {
    let count = count.clamp(1, MAX_CASCADES);
    let near = near.max(1e-4);
    let range = (far - near).max(0.0);
    let far = near + range;

    let mut splits = Vec::with_capacity(count);
    let mut previous = 0.0f32;
    for i in 0..count {
        let distance = match partition {
            CascadePartition::Manual { fractions } => fractions[i].clamp(0.0, 1.0) * range,
            _ if i + 1 == count => range,
            _ => {
                let lambda = partition.lambda().unwrap_or(1.0);
                let p = (i + 1) as f32 / count as f32;
                let uniform = near + range * p;
                let logarithmic = near * (far / near).powf(p);
                uniform + (logarithmic - uniform) * lambda - near
            }
        };
        let distance = distance.clamp(previous, range);
        splits.push(distance);
        previous = distance;
    }
    splits
}

/// Clip-space translation that moves the world origin onto a texel corner.
pub fn texel_snap(shadow_matrix: Mat4, map_size: u32) -> Vec2 {
    let half = map_size as f32 * 0.5;
    let origin = shadow_matrix.project_point3(Vec3::ZERO).truncate() * half;
    (origin.round() - origin) / half
}

/// Fits a light camera around the part of the view frustum between
/// `near_fraction` and `far_fraction` of each corner ray.
///
/// `corners` are the camera frustum corners, near plane first.
pub fn fit_cascade(
    corners: &[Vec3; 8],
    near_fraction: f32,
    far_fraction: f32,
    light_direction: Vec3,
    map_size: u32,
    caster_extension: f32,
) -> Cascade {
    let mut slice = [Vec3::ZERO; 8];
    for j in 0..4 {
        let ray = corners[j + 4] - corners[j];
        slice[j] = corners[j] + ray * near_fraction;
        slice[j + 4] = corners[j] + ray * far_fraction;
    }

    let center = slice.iter().copied().sum::<Vec3>() / 8.0;
    let radius = slice
        .iter()
        .map(|corner| corner.distance(center))
        .fold(0.0f32, f32::max);
    // Whole sixteenths keep the projection size stable under small motion.
    let radius = ((radius * 16.0).ceil() / 16.0).max(1.0 / 16.0);

    let light = light_direction.try_normalize().unwrap_or(Vec3::NEG_Y);
    let up = if light.y.abs() > 0.99 { Vec3::Z } else { Vec3::Y };
    let eye = center - light * (radius + caster_extension);
    let view = Mat4::look_at_rh(eye, center, up);
    let mut projection = Mat4::orthographic_rh(
        -radius,
        radius,
        -radius,
        radius,
        0.0,
        2.0 * radius + caster_extension,
    );

    let snap = texel_snap(projection * view, map_size);
    projection.w_axis.x += snap.x;
    projection.w_axis.y += snap.y;

    Cascade {
        near_depth: 0.0,
        far_depth: 0.0,
        center,
        radius,
        eye,
        view,
        projection,
        view_projection: projection * view,
        snap,
    }
}

/// Packs the receiver block for `cascades`.
///
/// The global matrix is the first cascade's texture-space matrix; every
/// cascade's texture coordinates are `(global + offset) * scale`.
pub fn receiver_constants(cascades: &[Cascade], options: &ShadowOptions) -> ShadowReceiverConstants {
    let mut constants = ShadowReceiverConstants::default();
    let Some(first) = cascades.first() else {
        return constants;
    };

    let bias = texture_scale_bias();
    let global = bias * first.view_projection;
    constants.global_matrix = global.to_cols_array_2d();
    for (i, cascade) in cascades.iter().enumerate().take(MAX_CASCADES) {
        let to_world = (bias * cascade.view_projection).inverse();
        let low = global.project_point3(to_world.project_point3(Vec3::ZERO));
        let high = global.project_point3(to_world.project_point3(Vec3::ONE));
        constants.offsets[i] = (-low).extend(0.0).to_array();
        constants.scales[i] = (Vec3::ONE / (high - low)).extend(1.0).to_array();
        constants.splits[i] = cascade.far_depth;
    }
    constants.params = [
        cascades.len().min(MAX_CASCADES) as f32,
        options.depth_bias,
        1.0,
        options.map_size as f32,
    ];
    constants
}

/// What cached splits were computed for: the camera and its depth range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SplitKey {
    camera: CameraId,
    near: u32,
    far: u32,
}

impl SplitKey {
    fn of(camera: &Camera) -> Self {
        Self {
            camera: camera.id(),
            near: camera.near.to_bits(),
            far: camera.far.to_bits(),
        }
    }
}

/// Renders the shadow cascades of one world.
pub struct ShadowCascadeGenerator {
    options: ShadowOptions,
    stage: CascadeStage,
    splits: Vec<f32>,
    /// `far - near` of the camera the splits were computed for.
    split_range: f32,
    split_key: Option<SplitKey>,
    dirty: bool,
    cascades: Vec<Cascade>,
    depth_target: Option<(DepthTargetId, u32, u32)>,
    /// Filterable copy of the depth array. Reserved for variance shadows.
    variance_target: Option<DepthTargetId>,
    cascade_constants: Vec<ConstantBuffer<CameraConstants>>,
    receiver: ConstantBuffer<ShadowReceiverConstants>,
    missing_pass_warned: bool,
}

impl ShadowCascadeGenerator {
    pub fn new(options: ShadowOptions) -> Self {
        let cascade_constants = (0..MAX_CASCADES)
            .map(|i| ConstantBuffer::new(format!("cascade {i} camera"), CameraConstants::default()))
            .collect();
        Self {
            options,
            stage: CascadeStage::Idle,
            splits: Vec::new(),
            split_range: 0.0,
            split_key: None,
            dirty: true,
            cascades: Vec::new(),
            depth_target: None,
            variance_target: None,
            cascade_constants,
            receiver: ConstantBuffer::new("shadow receiver", ShadowReceiverConstants::default()),
            missing_pass_warned: false,
        }
    }

    pub fn options(&self) -> &ShadowOptions {
        &self.options
    }

    /// Replaces the options; splits are recomputed on the next render.
    pub fn set_options(&mut self, options: ShadowOptions) {
        self.options = options;
        self.dirty = true;
    }

    /// Forces split recomputation on the next render.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn stage(&self) -> CascadeStage {
        self.stage
    }

    /// Split distances from the camera near plane.
    pub fn splits(&self) -> &[f32] {
        &self.splits
    }

    /// Cascades of the last render.
    pub fn cascades(&self) -> &[Cascade] {
        &self.cascades
    }

    pub fn depth_target(&self) -> Option<DepthTargetId> {
        self.depth_target.map(|(id, _, _)| id)
    }

    pub fn variance_target(&self) -> Option<DepthTargetId> {
        self.variance_target
    }

    pub fn receiver(&self) -> &ShadowReceiverConstants {
        self.receiver.value()
    }

    /// Creates the constant buffers.
    pub fn bind_to_device(&mut self, device: &dyn GpuDevice) -> RenderResult<()> {
        for constants in &mut self.cascade_constants {
            constants.bind_to_device(device)?;
        }
        self.receiver.bind_to_device(device)
    }

    /// Computes splits unless they are cached for this camera and its
    /// near/far range.
    pub fn compute_splits(&mut self, camera: &Camera) -> &[f32] {
        let key = SplitKey::of(camera);
        if self.dirty || self.split_key != Some(key) {
            self.splits = split_distances(
                self.options.partition,
                self.options.cascade_count,
                camera.near,
                camera.far,
            );
            self.split_range = (camera.far - camera.near).max(0.0);
            self.split_key = Some(key);
            self.dirty = false;
        }
        self.stage = CascadeStage::SplitsComputed;
        &self.splits
    }

    /// Fits every cascade for `camera` without rendering.
    pub fn fit_cascades(&mut self, camera: &Camera, light_direction: Vec3) -> &[Cascade] {
        self.compute_splits(camera);
        let corners = camera.frustum_corners();
        let range = self.split_range.max(f32::EPSILON);

        self.cascades.clear();
        let mut previous = 0.0;
        for &split in &self.splits {
            let mut cascade = fit_cascade(
                &corners,
                (previous / range).min(1.0),
                (split / range).min(1.0),
                light_direction,
                self.options.map_size,
                self.options.caster_extension,
            );
            cascade.near_depth = camera.near + previous;
            cascade.far_depth = camera.near + split;
            self.cascades.push(cascade);
            previous = split;
        }
        &self.cascades
    }

    fn ensure_target(&mut self, device: &dyn GpuDevice) -> RenderResult<DepthTargetId> {
        let size = self.options.map_size;
        let layers = self.options.cascade_count as u32;
        if let Some((id, s, l)) = self.depth_target {
            if s == size && l == layers {
                return Ok(id);
            }
            device.destroy_depth_array(id);
            self.depth_target = None;
        }
        let id = device.create_depth_array(size, layers, "shadow cascades")?;
        log::debug!("shadow cascades: {layers} x {size}px");
        self.depth_target = Some((id, size, layers));
        Ok(id)
    }

    /// Renders every cascade of `world` and uploads the receiver block.
    ///
    /// On success the frame bindings point at the new depth array and
    /// receiver buffer. Without a depth pass the receiver is disabled instead.
    pub fn render(
        &mut self,
        ctx: &mut RenderContext<'_>,
        camera: &Camera,
        world: &WorldRenderer,
        light_direction: Vec3,
    ) -> RenderResult<()> {
        self.stage = CascadeStage::Idle;
        if self.options.filterable {
            return self.convert_to_filterable();
        }
        let Some(depth_pass) = ctx.frame.depth_pass.clone() else {
            if !self.missing_pass_warned {
                self.missing_pass_warned = true;
                log::warn!("depth pass is not loaded; shadows are disabled");
            }
            return self.disable(ctx);
        };

        let target = self.ensure_target(ctx.device())?;
        self.fit_cascades(camera, light_direction);
        ctx.commands.set_shadow_map(None);

        for i in 0..self.cascades.len() {
            self.stage = CascadeStage::CascadeFitted(i);
            let cascade = self.cascades[i];
            ctx.commands.set_render_target(RenderTarget::DepthSlice {
                target,
                layer: i as u32,
            });
            ctx.commands.clear_depth(1.0);
            depth_pass.apply(ctx)?;

            let constants = &mut self.cascade_constants[i];
            constants.set(CameraConstants::from_matrices(
                cascade.view,
                cascade.view_projection,
                cascade.eye,
            ));
            constants.update(ctx)?;
            constants.bind(ctx, CAMERA_SLOT);

            world.draw(ctx, camera, true)?;
        }
        ctx.commands.set_render_target(RenderTarget::Backbuffer);

        self.receiver
            .set(receiver_constants(&self.cascades, &self.options));
        self.receiver.update(ctx)?;
        self.stage = CascadeStage::ReceiverDataUploaded;

        ctx.frame.shadow_receiver = self.receiver.buffer();
        ctx.frame.shadow_map = Some(target);
        self.stage = CascadeStage::Idle;
        Ok(())
    }

    /// Uploads a receiver block with shadows switched off.
    pub fn disable(&mut self, ctx: &mut RenderContext<'_>) -> RenderResult<()> {
        self.receiver.set(ShadowReceiverConstants::default());
        self.receiver.update(ctx)?;
        ctx.frame.shadow_receiver = self.receiver.buffer();
        ctx.frame.shadow_map = None;
        Ok(())
    }

    /// Variance conversion of the depth array. Rejected before any cascade
    /// is recorded.
    fn convert_to_filterable(&mut self) -> RenderResult<()> {
        Err(RenderError::NotSupported("filterable shadow maps"))
    }

    /// Destroys the depth array and constant buffers.
    pub fn release(&mut self, device: &dyn GpuDevice) {
        if let Some((id, _, _)) = self.depth_target.take() {
            device.destroy_depth_array(id);
        }
        if let Some(id) = self.variance_target.take() {
            device.destroy_depth_array(id);
        }
        for constants in &mut self.cascade_constants {
            constants.dispose(device);
        }
        self.receiver.dispose(device);
    }
}
