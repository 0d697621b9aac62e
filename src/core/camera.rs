//! Camera abstraction consumed by the visibility helpers

use crate::core::types::{Vec3, Vec4, Mat4, Quat};
use crate::math::Frustum;

/// Projection model of a [`Camera`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    /// Perspective projection with vertical field of view in radians
    Perspective { fov_y: f32 },
    /// Orthographic projection; `half_height` is half the visible height in world units
    Orthographic { half_height: f32 },
}

/// Camera with position, rotation, and projection parameters
#[derive(Clone, Debug)]
pub struct Camera {
    /// World position
    pub position: Vec3,
    /// Rotation as quaternion
    pub rotation: Quat,
    /// Projection model
    pub projection: Projection,
    /// Aspect ratio (width / height)
    pub aspect: f32,
    /// Near clip plane
    pub near: f32,
    /// Far clip plane
    pub far: f32,
}

impl Camera {
    /// Create a new perspective camera looking down -Z
    pub fn new(position: Vec3, fov_y_degrees: f32, aspect: f32) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
            projection: Projection::Perspective { fov_y: fov_y_degrees.to_radians() },
            aspect,
            near: 0.01,
            far: 1000.0,
        }
    }

    /// Create an orthographic camera looking down -Z
    pub fn orthographic(position: Vec3, half_height: f32, aspect: f32) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
            projection: Projection::Orthographic { half_height },
            aspect,
            near: 0.01,
            far: 1000.0,
        }
    }

    /// Create camera looking at a target
    pub fn look_at(position: Vec3, target: Vec3, up: Vec3) -> Self {
        let forward = (target - position).normalize();
        let right = forward.cross(up).normalize();
        let up = right.cross(forward);

        let rotation = Quat::from_mat3(&glam::Mat3::from_cols(right, up, -forward));

        Self {
            position,
            rotation,
            projection: Projection::Perspective { fov_y: 60.0_f32.to_radians() },
            aspect: 16.0 / 9.0,
            near: 0.01,
            far: 1000.0,
        }
    }

    /// Get view matrix (world to camera space)
    pub fn view_matrix(&self) -> Mat4 {
        let rotation_matrix = Mat4::from_quat(self.rotation.conjugate());
        let translation_matrix = Mat4::from_translation(-self.position);
        rotation_matrix * translation_matrix
    }

    /// Get projection matrix (camera to clip space)
    pub fn projection_matrix(&self) -> Mat4 {
        match self.projection {
            Projection::Perspective { fov_y } => {
                Mat4::perspective_rh(fov_y, self.aspect, self.near, self.far)
            }
            Projection::Orthographic { half_height } => {
                let half_width = half_height * self.aspect;
                Mat4::orthographic_rh(
                    -half_width, half_width,
                    -half_height, half_height,
                    self.near, self.far,
                )
            }
        }
    }

    /// Get combined view-projection matrix
    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// View frustum of this camera
    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(&self.view_projection())
    }

    /// Project a world-space point to normalized device coordinates.
    ///
    /// Returns `None` for points on or behind the camera plane, where the
    /// perspective divide is meaningless.
    pub fn project(&self, point: Vec3) -> Option<Vec3> {
        let clip = self.view_projection() * Vec4::new(point.x, point.y, point.z, 1.0);
        if clip.w <= f32::EPSILON {
            return None;
        }
        Some(Vec3::new(clip.x / clip.w, clip.y / clip.w, clip.z / clip.w))
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 0.0, 5.0), 60.0, 16.0 / 9.0)
    }
}
