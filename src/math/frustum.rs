//! View frustum for tile culling

use crate::core::types::{Vec3, Vec4, Mat4};
use super::aabb::Aabb;

/// A plane defined by normal and distance from origin
#[derive(Clone, Copy, Debug)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    pub fn new(normal: Vec3, distance: f32) -> Self {
        Self { normal, distance }
    }

    /// Signed distance from point to plane (positive = in front)
    pub fn distance_to_point(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }

    fn from_row(row: Vec4) -> Self {
        let normal = row.truncate();
        let len = normal.length();
        if len > 0.0 {
            Self { normal: normal / len, distance: row.w / len }
        } else {
            Self { normal, distance: row.w }
        }
    }
}

/// View frustum with 6 planes (Near, Far, Left, Right, Top, Bottom)
#[derive(Clone, Copy, Debug)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extract frustum planes from a view-projection matrix (Gribb/Hartmann).
    ///
    /// Assumes glam's `_rh` projections, which map depth to [0, 1]; the near
    /// plane is therefore row2 alone.
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let rows = [vp.row(0), vp.row(1), vp.row(2), vp.row(3)];

        Self {
            planes: [
                Plane::from_row(rows[2]),           // near
                Plane::from_row(rows[3] - rows[2]), // far
                Plane::from_row(rows[3] + rows[0]), // left
                Plane::from_row(rows[3] - rows[0]), // right
                Plane::from_row(rows[3] - rows[1]), // top
                Plane::from_row(rows[3] + rows[1]), // bottom
            ],
        }
    }

    /// Check if AABB intersects frustum (conservative test).
    /// Empty boxes never intersect.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        if aabb.is_empty() {
            return false;
        }
        for plane in &self.planes {
            // Corner most aligned with the plane normal (p-vertex)
            let p = Vec3::new(
                if plane.normal.x >= 0.0 { aabb.max.x } else { aabb.min.x },
                if plane.normal.y >= 0.0 { aabb.max.y } else { aabb.min.y },
                if plane.normal.z >= 0.0 { aabb.max.z } else { aabb.min.z },
            );

            if plane.distance_to_point(p) < 0.0 {
                return false;
            }
        }
        true
    }
}
