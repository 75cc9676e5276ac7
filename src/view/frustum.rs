//! The observer's real perspective frustum
//!
//! This is what a client actually renders with. The server never tests
//! volumes against its six planes; it only converts it into a
//! [`ConicalViewFrustum`](super::conical::ConicalViewFrustum) once per view update.

use serde::{Deserialize, Serialize};

use crate::util::vec3::Vec3;

// ============================================================================
// Defaults
// ============================================================================

/// Vertical field of view in degrees
pub const DEFAULT_FIELD_OF_VIEW_DEGREES: f32 = 45.0;

pub const DEFAULT_ASPECT_RATIO: f32 = 16.0 / 9.0;

pub const DEFAULT_NEAR_CLIP: f32 = 0.08;

/// Half the addressable scene extent
pub const DEFAULT_FAR_CLIP: f32 = 16_384.0;

/// Keyhole radius: everything this close is in view whatever the facing
pub const DEFAULT_CENTER_RADIUS: f32 = 3.0;

/// Perspective frustum as reported by an observer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewFrustum {
    pub position: Vec3,
    /// Unit forward vector
    pub direction: Vec3,
    /// Unit up vector, orthogonal to `direction`
    pub up: Vec3,
    /// Vertical field of view in radians
    pub field_of_view: f32,
    /// Width over height
    pub aspect_ratio: f32,
    pub near_clip: f32,
    pub far_clip: f32,
    /// Keyhole sphere radius around `position`
    pub center_radius: f32,
}

impl Default for ViewFrustum {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            direction: -Vec3::Z,
            up: Vec3::Y,
            field_of_view: DEFAULT_FIELD_OF_VIEW_DEGREES.to_radians(),
            aspect_ratio: DEFAULT_ASPECT_RATIO,
            near_clip: DEFAULT_NEAR_CLIP,
            far_clip: DEFAULT_FAR_CLIP,
            center_radius: DEFAULT_CENTER_RADIUS,
        }
    }
}

impl ViewFrustum {
    /// Frustum at `position` looking along `direction` with default lens settings
    pub fn looking_at(position: Vec3, direction: Vec3) -> Self {
        let direction = direction.normalize();
        let mut frustum = Self {
            position,
            direction,
            ..Self::default()
        };
        frustum.up = frustum.orthogonal_up(Vec3::Y);
        frustum
    }

    /// Unit right vector
    pub fn right(&self) -> Vec3 {
        self.direction.cross(self.up).normalize()
    }

    /// Re-derive an up vector orthogonal to `direction`, falling back to
    /// another axis when `hint` is parallel to the view direction
    fn orthogonal_up(&self, hint: Vec3) -> Vec3 {
        let right = self.direction.cross(hint);
        let right = if right.length_sq() > 1e-8 {
            right
        } else {
            self.direction.cross(Vec3::X)
        };
        right.cross(self.direction).normalize()
    }

    /// World-space corners of the near plane: top-left, top-right,
    /// bottom-left, bottom-right
    pub fn near_corners(&self) -> [Vec3; 4] {
        let half_height = self.near_clip * (self.field_of_view * 0.5).tan();
        let half_width = half_height * self.aspect_ratio;
        let center = self.position + self.direction * self.near_clip;
        let right = self.right() * half_width;
        let up = self.up * half_height;
        [
            center + up - right,
            center + up + right,
            center - up - right,
            center - up + right,
        ]
    }

    /// Half-angle of the narrowest cone around `direction` that contains
    /// the whole rectangular frustum
    pub fn bounding_cone_half_angle(&self) -> f32 {
        self.near_corners()
            .iter()
            .map(|corner| self.direction.angle_between(*corner - self.position))
            .fold(0.0_f32, f32::max)
    }

    /// Finite values, unit-ish direction, sane lens and clip distances
    pub fn is_valid(&self) -> bool {
        self.position.is_finite()
            && self.direction.is_finite()
            && self.up.is_finite()
            && (self.direction.length_sq() - 1.0).abs() < 1e-3
            && self.field_of_view > 0.0
            && self.field_of_view < std::f32::consts::PI
            && self.aspect_ratio > 0.0
            && self.aspect_ratio.is_finite()
            && self.near_clip > 0.0
            && self.far_clip > self.near_clip
            && self.far_clip.is_finite()
            && self.center_radius >= 0.0
            && self.center_radius.is_finite()
    }
}
