//! Math kernel
//!
//! Pure, deterministic vector/quaternion/matrix helpers shared by the
//! fusion engine, the planner, and targeting analytics. Nothing in this
//! module holds state or touches the clock.

use nalgebra::{Matrix3, Matrix6};
use serde::{Deserialize, Serialize};

/// 3D vector representation for position, velocity, and acceleration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn magnitude(&self) -> f64 {
        magnitude(*self)
    }

    pub fn normalize(&self) -> Self {
        normalize(*self)
    }
}

/// Quaternion representation for orientation, gimbal-lock free.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }
}

/// Dense 3x3 matrix, used for misalignment and rotation.
pub type M3 = Matrix3<f64>;

/// Dense 6x6 matrix, used for the fused-state covariance.
pub type M6 = Matrix6<f64>;

pub fn identity3() -> M3 {
    M3::identity()
}

pub fn identity6() -> M6 {
    M6::identity()
}

pub fn magnitude(v: Vec3) -> f64 {
    (v.x * v.x + v.y * v.y + v.z * v.z).sqrt()
}

/// Normalizes `v`. Returns the zero vector when `v` has zero magnitude.
pub fn normalize(v: Vec3) -> Vec3 {
    let mag = magnitude(v);
    if mag > 0.0 {
        Vec3::new(v.x / mag, v.y / mag, v.z / mag)
    } else {
        Vec3::zero()
    }
}

pub fn dot(a: Vec3, b: Vec3) -> f64 {
    a.x * b.x + a.y * b.y + a.z * b.z
}

pub fn cross(a: Vec3, b: Vec3) -> Vec3 {
    Vec3::new(
        a.y * b.z - a.z * b.y,
        a.z * b.x - a.x * b.z,
        a.x * b.y - a.y * b.x,
    )
}

pub fn add(a: Vec3, b: Vec3) -> Vec3 {
    Vec3::new(a.x + b.x, a.y + b.y, a.z + b.z)
}

pub fn sub(a: Vec3, b: Vec3) -> Vec3 {
    Vec3::new(a.x - b.x, a.y - b.y, a.z - b.z)
}

pub fn scale(a: Vec3, s: f64) -> Vec3 {
    Vec3::new(a.x * s, a.y * s, a.z * s)
}

pub fn clamp(v: Vec3, lo: Vec3, hi: Vec3) -> Vec3 {
    Vec3::new(
        v.x.clamp(lo.x, hi.x),
        v.y.clamp(lo.y, hi.y),
        v.z.clamp(lo.z, hi.z),
    )
}

/// Builds the quaternion that represents a pure yaw rotation about Z.
pub fn heading_to_quaternion(yaw_rad: f64) -> Quaternion {
    let half = yaw_rad / 2.0;
    Quaternion::new(half.cos(), 0.0, 0.0, half.sin())
}

/// Rotates `v` by the 3x3 matrix `m` (row-major application: `m * v`).
pub fn apply_rotation(v: Vec3, m: &M3) -> Vec3 {
    let out = m * nalgebra::Vector3::new(v.x, v.y, v.z);
    Vec3::new(out.x, out.y, out.z)
}

/// Minimum distance from point `p` to the line segment `[a, b]`.
pub fn point_to_segment_distance(p: Vec3, a: Vec3, b: Vec3) -> f64 {
    let ab = sub(b, a);
    let ab_len_sq = dot(ab, ab);
    if ab_len_sq <= f64::EPSILON {
        return magnitude(sub(p, a));
    }
    let t = (dot(sub(p, a), ab) / ab_len_sq).clamp(0.0, 1.0);
    let closest = add(a, scale(ab, t));
    magnitude(sub(p, closest))
}

/// Converts a 3x3 covariance into the diagonal used by the scalar-per-axis
/// Kalman update (§4.3): callers only ever read `Rii` off this matrix.
pub fn diag3(v: Vec3) -> M3 {
    M3::from_diagonal(&nalgebra::Vector3::new(v.x, v.y, v.z))
}
