//! Axis-aligned bounding box

use crate::core::types::Vec3;

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Inverted box that contains nothing; expanding it by a point yields that point
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    /// Create AABB from center and full size
    pub fn from_center_size(center: Vec3, size: Vec3) -> Self {
        let half = size * 0.5;
        Self {
            min: center - half,
            max: center + half,
        }
    }

    /// True if the box contains no point
    pub fn is_empty(&self) -> bool {
        self.max.x < self.min.x || self.max.y < self.min.y || self.max.z < self.min.z
    }

    /// Expand AABB to include point
    pub fn expand(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Expand AABB to include another box; empty boxes are ignored
    pub fn union_with(&mut self, other: &Aabb) {
        if other.is_empty() {
            return;
        }
        self.expand(other.min);
        self.expand(other.max);
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_expand() {
        let mut aabb = Aabb::empty();
        assert!(aabb.is_empty());

        aabb.expand(Vec3::new(1.0, 2.0, 3.0));
        assert!(!aabb.is_empty());
        assert_eq!(aabb.min, aabb.max);

        aabb.union_with(&Aabb::empty());
        assert_eq!(aabb.min, aabb.max);

        aabb.union_with(&Aabb::new(Vec3::ZERO, Vec3::ONE));
        assert_eq!(aabb.min, Vec3::ZERO);
        assert_eq!(aabb.max, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_flat_box_is_not_empty() {
        let flat = Aabb::from_center_size(Vec3::ZERO, Vec3::new(2.0, 2.0, 0.0));
        assert!(!flat.is_empty());
        assert_eq!(flat.min, Vec3::new(-1.0, -1.0, 0.0));
        assert_eq!(flat.max, Vec3::new(1.0, 1.0, 0.0));
    }
}
