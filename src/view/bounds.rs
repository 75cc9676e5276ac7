//! Axis-aligned bounding volumes used for visibility scoring
//!
//! Octree elements are cubes (corner + edge length); free-standing scene
//! elements carry boxes. Both reduce to a center and a bounding-sphere radius,
//! which is all the conical test needs.

use serde::{Deserialize, Serialize};

use crate::util::vec3::Vec3;

/// Half of sqrt(3): cube edge length to bounding-sphere radius
const HALF_SQRT_THREE: f32 = 0.866_025_4;

/// A volume that can be scored against a conical view
///
/// Implementations are small `Copy` values so the scoring loop is monomorphised
/// per volume type rather than dispatched through a vtable.
pub trait BoundingVolume {
    /// Center of the volume in world space
    fn center(&self) -> Vec3;

    /// Radius of the smallest sphere around `center()` enclosing the volume
    fn bounding_radius(&self) -> f32;

    /// Zero-size or non-finite volumes are never worth sending
    #[inline]
    fn is_degenerate(&self) -> bool {
        let radius = self.bounding_radius();
        !(radius > 0.0 && radius.is_finite() && self.center().is_finite())
    }
}

/// Axis-aligned cube: minimum corner plus edge length
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AACube {
    pub corner: Vec3,
    pub scale: f32,
}

impl AACube {
    #[inline]
    pub fn new(corner: Vec3, scale: f32) -> Self {
        Self { corner, scale }
    }

    /// Cube of edge `2 * half_size` centered on `center`
    #[inline]
    pub fn from_center(center: Vec3, half_size: f32) -> Self {
        Self {
            corner: center - Vec3::splat(half_size),
            scale: half_size * 2.0,
        }
    }

    #[inline]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    #[inline]
    pub fn far_corner(&self) -> Vec3 {
        self.corner + Vec3::splat(self.scale)
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        let far = self.far_corner();
        point.x >= self.corner.x
            && point.y >= self.corner.y
            && point.z >= self.corner.z
            && point.x <= far.x
            && point.y <= far.y
            && point.z <= far.z
    }
}

impl BoundingVolume for AACube {
    #[inline]
    fn center(&self) -> Vec3 {
        self.corner + Vec3::splat(self.scale * 0.5)
    }

    #[inline]
    fn bounding_radius(&self) -> f32 {
        self.scale * HALF_SQRT_THREE
    }
}

/// Axis-aligned box: minimum corner plus per-axis extent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AABox {
    pub corner: Vec3,
    pub scale: Vec3,
}

impl AABox {
    #[inline]
    pub fn new(corner: Vec3, scale: Vec3) -> Self {
        Self { corner, scale }
    }

    /// Largest dimension, used when a box must be treated as a cube
    pub fn largest_dimension(&self) -> f32 {
        self.scale.x.max(self.scale.y).max(self.scale.z)
    }

    /// Smallest cube sharing this box's center that contains the box
    pub fn enclosing_cube(&self) -> AACube {
        AACube::from_center(self.center(), self.largest_dimension() * 0.5)
    }
}

impl BoundingVolume for AABox {
    #[inline]
    fn center(&self) -> Vec3 {
        self.corner + self.scale * 0.5
    }

    #[inline]
    fn bounding_radius(&self) -> f32 {
        self.scale.length() * 0.5
    }

    fn is_degenerate(&self) -> bool {
        // A flat box (one axis zero) is still a real surface worth sending
        let radius = self.bounding_radius();
        !(radius > 0.0
            && radius.is_finite()
            && self.scale.x >= 0.0
            && self.scale.y >= 0.0
            && self.scale.z >= 0.0
            && self.center().is_finite())
    }
}
