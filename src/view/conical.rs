//! Conical approximation of observer view frusta
//!
//! The six-plane frustum test is exact but too slow to run against every
//! candidate volume for every observer on every tick. Instead each frustum is
//! replaced by the narrowest cone that contains it, plus a "keyhole" sphere
//! around the eye. A volume is in view when its bounding sphere touches either
//! shape and lies within the far clip distance.
//!
//! The cone is deliberately looser than the real frustum: sending something
//! slightly out of view costs a little bandwidth, while failing to send
//! something in view is a visible hole.
//!
//! # Performance
//! - `intersects` and `compute_priority` take one sqrt for the distance and
//!   one for the tangent length, and no trig (the cosine-sum identity replaces
//!   an `acos` by cached `cos`/`sin` of the cone angle)
//! - Volume types are generic, so the scoring loop is monomorphised

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::net::protocol::{self, ViewStateError};
use crate::scheduler::queue::{DO_NOT_SEND, WHEN_IN_DOUBT_PRIORITY};
use crate::util::vec3::Vec3;
use crate::view::bounds::BoundingVolume;
use crate::view::frustum::ViewFrustum;

// ============================================================================
// Constants
// ============================================================================

/// Added to the distance before dividing so a volume centered on the eye
/// cannot produce an infinite angular size
pub const ANGULAR_SIZE_EPSILON: f32 = 0.001;

/// Encoded size of one frustum record: position, direction, angle, radius, far clip
pub const SERIALIZED_SIZE: usize = 9 * std::mem::size_of::<f32>();

/// Positions closer than this are the same viewpoint (squared compare)
const POSITION_SIMILAR_ENOUGH: f32 = 0.1;
const POSITION_SIMILAR_ENOUGH_SQ: f32 = POSITION_SIMILAR_ENOUGH * POSITION_SIMILAR_ENOUGH;

/// Directions with a dot product at least this large are the same facing
/// (about 0.8 degrees)
const DIRECTION_SIMILAR_DOT: f32 = 0.9999;

/// Relative tolerance for angle, keyhole radius and far clip
const SCALAR_SIMILAR_RELATIVE: f32 = 0.01;

/// Direction vectors further than this from unit length are rejected on decode
const DIRECTION_LENGTH_TOLERANCE: f32 = 0.01;

/// Errors describing a frustum that must not be used for scoring
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConicalFrustumError {
    #[error("frustum field is NaN or infinite")]
    NonFinite,
    #[error("direction is not a unit vector (length {0})")]
    BadDirection(f32),
    #[error("cone half-angle {0} outside (0, pi)")]
    BadAngle(f32),
    #[error("keyhole radius {0} is negative")]
    NegativeRadius(f32),
    #[error("far clip {far_clip} is inside keyhole radius {radius}")]
    FarClipInsideKeyhole { far_clip: f32, radius: f32 },
    #[error("source frustum has non-finite or out-of-range fields")]
    InvalidFrustum,
}

// ============================================================================
// ConicalViewFrustum
// ============================================================================

/// One observer viewpoint reduced to a cone plus keyhole sphere
///
/// `cos_angle` and `sin_angle` are always derived from `angle` together; they
/// are never set independently and never taken from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "ConicalFrustumRecord", try_from = "ConicalFrustumRecord")]
pub struct ConicalViewFrustum {
    position: Vec3,
    direction: Vec3,
    angle: f32,
    cos_angle: f32,
    sin_angle: f32,
    radius: f32,
    far_clip: f32,
}

impl Default for ConicalViewFrustum {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            direction: -Vec3::Z,
            angle: 0.0,
            cos_angle: 1.0,
            sin_angle: 0.0,
            radius: 0.0,
            far_clip: 0.0,
        }
    }
}

impl ConicalViewFrustum {
    /// Build from explicit cone parameters, validating them
    ///
    /// `direction` is normalized; it must be non-zero.
    pub fn new(
        position: Vec3,
        direction: Vec3,
        angle: f32,
        radius: f32,
        far_clip: f32,
    ) -> Result<Self, ConicalFrustumError> {
        if !position.is_finite()
            || !direction.is_finite()
            || !angle.is_finite()
            || !radius.is_finite()
            || !far_clip.is_finite()
        {
            return Err(ConicalFrustumError::NonFinite);
        }
        let (direction, length) = direction.normalize_with_length();
        if length <= 0.0 {
            return Err(ConicalFrustumError::BadDirection(length));
        }
        if angle <= 0.0 || angle >= std::f32::consts::PI {
            return Err(ConicalFrustumError::BadAngle(angle));
        }
        if radius < 0.0 {
            return Err(ConicalFrustumError::NegativeRadius(radius));
        }
        if far_clip < radius {
            return Err(ConicalFrustumError::FarClipInsideKeyhole { far_clip, radius });
        }

        let (sin_angle, cos_angle) = angle.sin_cos();
        Ok(Self {
            position,
            direction,
            angle,
            cos_angle,
            sin_angle,
            radius,
            far_clip,
        })
    }

    /// Cone bounding a real perspective frustum
    pub fn from_frustum(frustum: &ViewFrustum) -> Self {
        let mut conical = Self::default();
        conical.set(frustum);
        conical
    }

    /// Like [`from_frustum`](Self::from_frustum), but rejects a frustum that
    /// fails [`ViewFrustum::is_valid`] or converts to an unusable cone
    pub fn try_from_frustum(frustum: &ViewFrustum) -> Result<Self, ConicalFrustumError> {
        if !frustum.is_valid() {
            return Err(ConicalFrustumError::InvalidFrustum);
        }
        let cone = Self::from_frustum(frustum);
        Self::new(cone.position, cone.direction, cone.angle, cone.radius, cone.far_clip)
    }

    /// Rebuild this cone from a real frustum
    ///
    /// Position, direction and keyhole radius carry over directly. The
    /// half-angle is the widest angle between the view direction and any
    /// near-plane corner ray, so every point of the rectangular frustum is
    /// inside the cone.
    pub fn set(&mut self, frustum: &ViewFrustum) {
        self.position = frustum.position;
        self.direction = frustum.direction.normalize();
        self.radius = frustum.center_radius.max(0.0);
        self.far_clip = frustum.far_clip.max(self.radius);
        self.set_angle(frustum.bounding_cone_half_angle());
    }

    #[inline]
    fn set_angle(&mut self, angle: f32) {
        self.angle = angle;
        let (sin_angle, cos_angle) = angle.sin_cos();
        self.sin_angle = sin_angle;
        self.cos_angle = cos_angle;
    }

    #[inline]
    pub fn position(&self) -> Vec3 {
        self.position
    }

    #[inline]
    pub fn direction(&self) -> Vec3 {
        self.direction
    }

    #[inline]
    pub fn angle(&self) -> f32 {
        self.angle
    }

    #[inline]
    pub fn cos_angle(&self) -> f32 {
        self.cos_angle
    }

    #[inline]
    pub fn sin_angle(&self) -> f32 {
        self.sin_angle
    }

    #[inline]
    pub fn radius(&self) -> f32 {
        self.radius
    }

    #[inline]
    pub fn far_clip(&self) -> f32 {
        self.far_clip
    }

    /// Cone test for a sphere at `offset` from the eye with the given radius
    ///
    /// A sphere of radius `r` at distance `d` subtends a half-angle `b` with
    /// `cos b = sqrt(d^2 - r^2) / d` and `sin b = r / d`. It touches the cone
    /// when the angle to its center is below `angle + b`, which by
    /// `cos(a + b) = cos a cos b - sin a sin b` becomes the comparison below.
    /// Callers guarantee `distance >= radius`.
    #[inline(always)]
    fn within_cone(&self, offset: Vec3, distance: f32, radius: f32) -> bool {
        offset.dot(self.direction)
            > (distance * distance - radius * radius).sqrt() * self.cos_angle
                - radius * self.sin_angle
    }

    /// Whether the volume's bounding sphere touches the keyhole or the cone
    /// within the far clip distance
    #[inline]
    pub fn intersects<V: BoundingVolume>(&self, volume: &V) -> bool {
        let offset = volume.center() - self.position;
        let distance = offset.length();
        let radius = volume.bounding_radius();

        if distance < self.radius + radius {
            return true;
        }
        if distance > self.far_clip + radius {
            return false;
        }
        self.within_cone(offset, distance, radius)
    }

    /// Score a volume for sending
    ///
    /// - Inside the keyhole: the bounding radius, so large nearby volumes win
    ///   regardless of facing
    /// - Inside the cone: `radius / distance`, an angular-size proxy
    /// - Otherwise, or for degenerate volumes: [`DO_NOT_SEND`]
    #[inline]
    pub fn compute_priority<V: BoundingVolume>(&self, volume: &V) -> f32 {
        if volume.is_degenerate() {
            return DO_NOT_SEND;
        }
        let offset = volume.center() - self.position;
        let distance = offset.length();
        let radius = volume.bounding_radius();

        let priority = if distance < self.radius + radius {
            radius
        } else if distance > self.far_clip + radius {
            DO_NOT_SEND
        } else if self.within_cone(offset, distance, radius) {
            radius / (distance + ANGULAR_SIZE_EPSILON)
        } else {
            DO_NOT_SEND
        };

        if priority.is_finite() {
            priority
        } else {
            DO_NOT_SEND
        }
    }

    /// Angular-size proxy `radius / distance` with no in/out decision
    #[inline]
    pub fn get_angular_size<V: BoundingVolume>(&self, volume: &V) -> f32 {
        if volume.is_degenerate() {
            return 0.0;
        }
        let distance = (volume.center() - self.position).length();
        volume.bounding_radius() / (distance + ANGULAR_SIZE_EPSILON)
    }

    /// Whether re-scoring against `other` would change practically nothing
    pub fn is_very_similar(&self, other: &ConicalViewFrustum) -> bool {
        fn relatively_close(a: f32, b: f32) -> bool {
            let scale = a.abs().max(b.abs());
            scale == 0.0 || (a - b).abs() <= scale * SCALAR_SIMILAR_RELATIVE
        }

        self.position.distance_sq_to(other.position) < POSITION_SIMILAR_ENOUGH_SQ
            && self.direction.dot(other.direction) >= DIRECTION_SIMILAR_DOT
            && relatively_close(self.angle, other.angle)
            && relatively_close(self.radius, other.radius)
            && relatively_close(self.far_clip, other.far_clip)
    }

    /// Append the fixed-layout wire record to `out`
    pub fn serialize(&self, out: &mut Vec<u8>) -> Result<usize, protocol::EncodeError> {
        let bytes = protocol::encode(self)?;
        out.extend_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Decode one wire record, returning the frustum and bytes consumed
    ///
    /// The trig cache is rebuilt from the decoded angle.
    pub fn deserialize(data: &[u8]) -> Result<(Self, usize), ViewStateError> {
        let (record, consumed): (ConicalFrustumRecord, usize) = protocol::decode_prefix(data)?;
        Ok((Self::try_from(record)?, consumed))
    }
}

/// On-the-wire form of [`ConicalViewFrustum`]: the value fields only
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ConicalFrustumRecord {
    position: Vec3,
    direction: Vec3,
    angle: f32,
    radius: f32,
    far_clip: f32,
}

impl From<ConicalViewFrustum> for ConicalFrustumRecord {
    fn from(frustum: ConicalViewFrustum) -> Self {
        Self {
            position: frustum.position,
            direction: frustum.direction,
            angle: frustum.angle,
            radius: frustum.radius,
            far_clip: frustum.far_clip,
        }
    }
}

impl TryFrom<ConicalFrustumRecord> for ConicalViewFrustum {
    type Error = ConicalFrustumError;

    fn try_from(record: ConicalFrustumRecord) -> Result<Self, Self::Error> {
        let length = record.direction.length();
        if length.is_finite() && (length - 1.0).abs() > DIRECTION_LENGTH_TOLERANCE {
            return Err(ConicalFrustumError::BadDirection(length));
        }
        ConicalViewFrustum::new(
            record.position,
            record.direction,
            record.angle,
            record.radius,
            record.far_clip,
        )
    }
}

// ============================================================================
// ConicalView
// ============================================================================

/// All simultaneous viewpoints of one observer (one per eye or camera)
///
/// Empty means no view has been reported yet; scoring then returns
/// [`WHEN_IN_DOUBT_PRIORITY`] so nothing is suppressed before the first report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConicalView {
    views: SmallVec<[ConicalViewFrustum; 2]>,
}

impl ConicalView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from real frusta, one cone each, in the given order
    pub fn set(&mut self, frustums: &[ViewFrustum]) {
        self.views.clear();
        self.views
            .extend(frustums.iter().map(ConicalViewFrustum::from_frustum));
    }

    /// Rebuild from real frusta, leaving the view untouched if any is invalid
    pub fn try_set(&mut self, frustums: &[ViewFrustum]) -> Result<(), ConicalFrustumError> {
        let cones = frustums
            .iter()
            .map(ConicalViewFrustum::try_from_frustum)
            .collect::<Result<SmallVec<[ConicalViewFrustum; 2]>, _>>()?;
        self.views = cones;
        Ok(())
    }

    /// Replace with already-converted cones (as decoded from the wire)
    pub fn set_conical<I>(&mut self, frustums: I)
    where
        I: IntoIterator<Item = ConicalViewFrustum>,
    {
        self.views.clear();
        self.views.extend(frustums);
    }

    pub fn clear(&mut self) {
        self.views.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.views.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConicalViewFrustum> {
        self.views.iter()
    }

    /// Best score across all sub-views
    #[inline]
    pub fn compute_priority<V: BoundingVolume>(&self, volume: &V) -> f32 {
        if self.views.is_empty() {
            return WHEN_IN_DOUBT_PRIORITY;
        }
        self.views
            .iter()
            .map(|view| view.compute_priority(volume))
            .fold(DO_NOT_SEND, f32::max)
    }

    /// Largest angular size across sub-views; 0 with no view
    pub fn get_angular_size<V: BoundingVolume>(&self, volume: &V) -> f32 {
        self.views
            .iter()
            .map(|view| view.get_angular_size(volume))
            .fold(0.0, f32::max)
    }

    /// Visible to any sub-view; everything is visible with no view
    pub fn intersects<V: BoundingVolume>(&self, volume: &V) -> bool {
        self.views.is_empty() || self.views.iter().any(|view| view.intersects(volume))
    }

    /// Pairwise similar with the same number of sub-views
    pub fn is_very_similar(&self, other: &ConicalView) -> bool {
        self.views.len() == other.views.len()
            && self
                .views
                .iter()
                .zip(other.views.iter())
                .all(|(a, b)| a.is_very_similar(b))
    }
}

// ============================================================================
// Tests
// ============================================================================
