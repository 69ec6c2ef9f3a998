//! Core value types shared by the registry, the gate and the cloud handler.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AnchorError, AnchorResult};

/// World-space pose as a 4x4 column-major matrix.
///
/// On the wire this is a flat array of 16 numbers, the same layout the
/// tracking framework uses for `simd_float4x4`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Transform([f32; 16]);

impl Transform {
    /// The identity pose
    pub const IDENTITY: Transform = Transform([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]);

    /// Build from 16 column-major values
    pub fn from_column_major(values: &[f64]) -> AnchorResult<Self> {
        if values.len() != 16 {
            return Err(AnchorError::invalid(format!(
                "transform needs 16 values, got {}",
                values.len()
            )));
        }
        let mut matrix = [0.0f32; 16];
        for (slot, value) in matrix.iter_mut().zip(values) {
            // Finite f64 values outside the f32 range become infinite here.
            let narrowed = *value as f32;
            if !narrowed.is_finite() {
                return Err(AnchorError::invalid(
                    "transform contains a non-finite or out-of-range value",
                ));
            }
            *slot = narrowed;
        }
        Ok(Self(matrix))
    }

    /// Pure translation
    pub fn from_translation(x: f32, y: f32, z: f32) -> Self {
        let mut matrix = Self::IDENTITY.0;
        matrix[12] = x;
        matrix[13] = y;
        matrix[14] = z;
        Self(matrix)
    }

    /// Column-major values
    pub fn as_array(&self) -> &[f32; 16] {
        &self.0
    }

    /// Column-major values widened for serialization
    pub fn to_column_major(&self) -> Vec<f64> {
        self.0.iter().map(|v| f64::from(*v)).collect()
    }

    /// Translation component (fourth column)
    pub fn translation(&self) -> [f32; 3] {
        [self.0[12], self.0[13], self.0[14]]
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl TryFrom<Vec<f64>> for Transform {
    type Error = AnchorError;

    fn try_from(values: Vec<f64>) -> AnchorResult<Self> {
        Self::from_column_major(&values)
    }
}

impl From<Transform> for Vec<f64> {
    fn from(transform: Transform) -> Self {
        transform.to_column_major()
    }
}

/// Kind of anchor the caller asks for.
///
/// Only world/plane anchors are created at this layer; the numeric code is
/// the `type` argument of the `addAnchor` method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnchorKind {
    /// Anchor fixed to a world pose, typically on a detected plane
    Plane,
}

impl AnchorKind {
    /// Numeric code used on the method channel
    pub fn code(self) -> i64 {
        match self {
            AnchorKind::Plane => 0,
        }
    }
}

impl TryFrom<i64> for AnchorKind {
    type Error = AnchorError;

    fn try_from(code: i64) -> AnchorResult<Self> {
        match code {
            0 => Ok(AnchorKind::Plane),
            other => Err(AnchorError::invalid(format!("unsupported anchor type {other}"))),
        }
    }
}

/// Identifier of an anchor inside the tracking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackingAnchorId(Uuid);

impl TrackingAnchorId {
    /// Allocate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TrackingAnchorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrackingAnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Anchor object handed to the tracking session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackingAnchor {
    /// Session-visible identifier, chosen before the anchor is added
    pub id: TrackingAnchorId,
    /// World pose
    pub transform: Transform,
}

impl TrackingAnchor {
    /// New anchor with a freshly allocated identifier
    pub fn new(transform: Transform) -> Self {
        Self {
            id: TrackingAnchorId::new(),
            transform,
        }
    }
}

/// Renderable scene node the tracking session binds to an anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Registered anchor as seen by callers of the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalAnchor {
    /// Caller-assigned name
    pub name: String,
    /// Anchor attached to the tracking session
    pub anchor: TrackingAnchor,
    /// Node the session attached to the anchor
    pub node: NodeId,
}

impl LocalAnchor {
    /// Tracking-session identifier
    pub fn id(&self) -> TrackingAnchorId {
        self.anchor.id
    }

    /// World pose
    pub fn transform(&self) -> Transform {
        self.anchor.transform
    }
}

/// Per-frame update from the tracking session, forwarded to the cloud session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameUpdate {
    /// Frame capture time in seconds, as reported by the tracking session
    pub timestamp: f64,
    /// Camera pose for the frame
    pub camera: Transform,
}
