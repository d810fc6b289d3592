// Transform utilities for instance placement
//
// glam::Mat4 already provides transform_point3(), transform_vector3() and inverse().

use crate::Aabb;
use glam::{Mat3, Mat4, Vec3};

/// Extension trait for Mat4 used when placing instances in world space.
pub trait Mat4Ext {
    /// Transform an axis-aligned bounding box.
    /// Computes the bounding box of all 8 transformed corners.
    fn transform_aabb(&self, aabb: &Aabb) -> Aabb;

    /// Inverse-transpose of the upper 3x3, for carrying normals to world space.
    fn normal_matrix(&self) -> Mat3;
}

impl Mat4Ext for Mat4 {
    fn transform_aabb(&self, aabb: &Aabb) -> Aabb {
        if aabb.is_empty() {
            return Aabb::EMPTY;
        }

        let (lo, hi) = (aabb.min(), aabb.max());
        let mut result_min = Vec3::splat(f32::INFINITY);
        let mut result_max = Vec3::splat(f32::NEG_INFINITY);

        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { lo.x } else { hi.x },
                if i & 2 == 0 { lo.y } else { hi.y },
                if i & 4 == 0 { lo.z } else { hi.z },
            );
            let p = self.transform_point3(corner);
            result_min = result_min.min(p);
            result_max = result_max.max(p);
        }

        Aabb::from_points(result_min, result_max)
    }

    fn normal_matrix(&self) -> Mat3 {
        Mat3::from_mat4(*self).inverse().transpose()
    }
}

/// The three matrices an adapter needs to intersect one instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceTransform {
    /// Object to world.
    pub matrix: Mat4,
    /// World to object.
    pub inverse: Mat4,
    /// Object-space normals to world space.
    pub normal: Mat3,
}

impl InstanceTransform {
    pub fn new(matrix: Mat4) -> Self {
        Self {
            matrix,
            inverse: matrix.inverse(),
            normal: matrix.normal_matrix(),
        }
    }

    /// Carry a world-space ray into object space.
    pub fn to_object(&self, origin: Vec3, direction: Vec3) -> (Vec3, Vec3) {
        (
            self.inverse.transform_point3(origin),
            self.inverse.transform_vector3(direction),
        )
    }
}

impl Default for InstanceTransform {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY)
    }
}
