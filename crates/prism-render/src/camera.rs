//! Scene cameras.

use std::sync::atomic::{AtomicU64, Ordering};

use glam::{Mat4, Vec3};

static NEXT_CAMERA_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a camera. Clones of a camera share its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CameraId(pub u64);

/// Camera projection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProjectionMode {
    /// Perspective projection.
    #[default]
    Perspective,
    /// Orthographic projection.
    Orthographic,
}

/// A 3D camera for viewing the scene.
#[derive(Debug, Clone)]
pub struct Camera {
    id: CameraId,
    /// Camera position in world space.
    pub position: Vec3,
    /// Point the camera is looking at.
    pub target: Vec3,
    /// Up vector.
    pub up: Vec3,
    /// Vertical field of view in radians.
    pub fov: f32,
    /// Aspect ratio (width / height).
    pub aspect_ratio: f32,
    /// Near clipping plane.
    pub near: f32,
    /// Far clipping plane.
    pub far: f32,
    /// Projection mode.
    pub projection_mode: ProjectionMode,
    /// Half height of the view volume in orthographic mode.
    pub ortho_scale: f32,
}

impl Camera {
    /// Creates a new camera with default settings.
    #[must_use]
    pub fn new(aspect_ratio: f32) -> Self {
        Self {
            id: CameraId(NEXT_CAMERA_ID.fetch_add(1, Ordering::Relaxed)),
            position: Vec3::new(0.0, 2.0, 10.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect_ratio,
            near: 0.1,
            far: 500.0,
            projection_mode: ProjectionMode::Perspective,
            ortho_scale: 10.0,
        }
    }

    /// Identity used to cache per-camera data such as shadow splits.
    pub fn id(&self) -> CameraId {
        self.id
    }

    /// Sets the aspect ratio from a viewport size in pixels.
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.aspect_ratio = width.max(1) as f32 / height.max(1) as f32;
    }

    /// Returns the view matrix.
    #[must_use]
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// Returns the projection matrix. Depth maps to `0..1`.
    #[must_use]
    pub fn projection_matrix(&self) -> Mat4 {
        match self.projection_mode {
            ProjectionMode::Perspective => {
                Mat4::perspective_rh(self.fov, self.aspect_ratio, self.near, self.far)
            }
            ProjectionMode::Orthographic => {
                let half_height = self.ortho_scale;
                let half_width = half_height * self.aspect_ratio;
                Mat4::orthographic_rh(
                    -half_width,
                    half_width,
                    -half_height,
                    half_height,
                    self.near,
                    self.far,
                )
            }
        }
    }

    /// Returns the combined view-projection matrix.
    #[must_use]
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// World-space corners of the view frustum: the four near-plane corners
    /// followed by the matching far-plane corners.
    #[must_use]
    pub fn frustum_corners(&self) -> [Vec3; 8] {
        let inverse = self.view_projection_matrix().inverse();
        let mut corners = [Vec3::ZERO; 8];
        for (i, corner) in corners.iter_mut().enumerate() {
            let x = if i & 1 == 0 { -1.0 } else { 1.0 };
            let y = if i & 2 == 0 { -1.0 } else { 1.0 };
            let z = if i < 4 { 0.0 } else { 1.0 };
            *corner = inverse.project_point3(Vec3::new(x, y, z));
        }
        corners
    }

    /// Unit vector from the position toward the target.
    #[must_use]
    pub fn forward(&self) -> Vec3 {
        (self.target - self.position).normalize_or(Vec3::NEG_Z)
    }

    /// Distance along [`forward`](Self::forward) from the camera to `point`.
    ///
    /// Cascade splits are expressed in this view depth.
    pub fn view_depth(&self, point: Vec3) -> f32 {
        (point - self.position).dot(self.forward())
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(16.0 / 9.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_ids_are_unique_and_shared_by_clones() {
        let a = Camera::new(1.0);
        let b = Camera::new(1.0);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_projection_mode_perspective() {
        let camera = Camera::new(1.0);
        let proj = camera.projection_matrix();
        assert!(proj.w_axis.z != 0.0);
    }

    #[test]
    fn test_projection_depth_range_is_zero_to_one() {
        let camera = Camera::new(1.0);
        let proj = camera.projection_matrix();
        let near = proj.project_point3(Vec3::new(0.0, 0.0, -camera.near));
        let far = proj.project_point3(Vec3::new(0.0, 0.0, -camera.far));
        assert!(near.z.abs() < 1e-4);
        assert!((far.z - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_frustum_corners_lie_on_near_and_far_planes() {
        let mut camera = Camera::new(1.5);
        camera.position = Vec3::ZERO;
        camera.target = Vec3::NEG_Z;
        let corners = camera.frustum_corners();
        for corner in &corners[..4] {
            assert!((corner.z + camera.near).abs() < 1e-3);
        }
        for corner in &corners[4..] {
            assert!((corner.z + camera.far).abs() / camera.far < 1e-3);
        }
    }

    #[test]
    fn test_view_depth_along_forward() {
        let mut camera = Camera::new(1.0);
        camera.position = Vec3::new(0.0, 0.0, 5.0);
        camera.target = Vec3::ZERO;
        assert!((camera.view_depth(Vec3::ZERO) - 5.0).abs() < 1e-5);
        assert!((camera.view_depth(Vec3::new(3.0, 1.0, 5.0))).abs() < 1e-5);
    }

    #[test]
    fn test_orthographic_uses_scale_and_aspect() {
        let mut camera = Camera::new(2.0);
        camera.projection_mode = ProjectionMode::Orthographic;
        camera.ortho_scale = 4.0;
        let proj = camera.projection_matrix();
        assert!((proj.x_axis.x - 1.0 / 8.0).abs() < 1e-6);
        assert!((proj.y_axis.y - 1.0 / 4.0).abs() < 1e-6);
    }
}
