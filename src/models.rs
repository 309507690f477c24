//! Core data models for the guidance core
//!
//! Defines every data structure that crosses a subsystem boundary: sensor
//! readings and health, the fused kinematic state, missions and
//! trajectories, payloads, and the environmental/threat context. Logic
//! lives in the subsystem modules; this file only describes shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::math::Quaternion;
use crate::math::{Vec3, M3, M6};

/// A registered sensor modality. `priority` drives steady-state primary
/// selection and `default_weight` scales measurement noise in the fusion
/// update step (§4.3); backup promotion order is tracked separately by
/// `FusionConfig::failover_priority_list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Gps,
    Ins,
    Radar,
    Lidar,
    Visual,
    Ir,
    Wifi,
}

impl SensorKind {
    /// Lower is preferred. Steady-state ranking used to pick
    /// `primary_sensor` among the readings actually applied in a fusion
    /// cycle. This is a distinct concept from
    /// `FusionConfig::failover_priority_list`, which ranks backup
    /// promotion order once the primary stops arriving.
    pub fn priority(self) -> u8 {
        match self {
            SensorKind::Gps => 0,
            SensorKind::Ins => 1,
            SensorKind::Radar => 2,
            SensorKind::Lidar => 3,
            SensorKind::Visual => 4,
            SensorKind::Ir => 5,
            SensorKind::Wifi => 6,
        }
    }

    /// Default measurement weight in [0,1]; higher pulls the fused
    /// estimate harder during the update step.
    pub fn default_weight(self) -> f64 {
        match self {
            SensorKind::Gps => 0.8,
            SensorKind::Ins => 0.9,
            SensorKind::Radar => 0.7,
            SensorKind::Lidar => 0.75,
            SensorKind::Visual => 0.5,
            SensorKind::Ir => 0.45,
            SensorKind::Wifi => 0.3,
        }
    }
}

/// A single sensor measurement, pre- or post-calibration.
///
/// Invariant: `covariance` is symmetric positive semi-definite with a
/// strictly positive diagonal. Readings with `valid = false` are stored
/// (for diagnostics) but never feed the fusion update step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: String,
    pub kind: SensorKind,
    pub position: Vec3,
    pub velocity: Vec3,
    #[serde(with = "matrix3_serde")]
    pub covariance: M3,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    pub valid: bool,
}

impl Reading {
    pub fn new(
        sensor_id: impl Into<String>,
        kind: SensorKind,
        position: Vec3,
        velocity: Vec3,
        covariance: M3,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            kind,
            position,
            velocity,
            covariance,
            timestamp: Utc::now(),
            confidence: 1.0,
            valid: true,
        }
    }
}

/// Per-sensor lifecycle status, transitioned once per second (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Healthy,
    Degraded,
    Failed,
    Calibrating,
    Offline,
}

/// Rolling health record for a registered sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorHealth {
    pub status: SensorStatus,
    pub readings_total: u64,
    pub readings_valid: u64,
    pub anomaly_count: u64,
    pub reading_rate_hz: f64,
    pub error_rate: f64,
    pub noise_level: f64,
    pub last_reading: Option<DateTime<Utc>>,
    pub last_calibrated: Option<DateTime<Utc>>,
}

impl SensorHealth {
    pub fn new() -> Self {
        Self {
            status: SensorStatus::Offline,
            readings_total: 0,
            readings_valid: 0,
            anomaly_count: 0,
            reading_rate_hz: 0.0,
            error_rate: 0.0,
            noise_level: 0.0,
            last_reading: None,
            last_calibrated: None,
        }
    }
}

impl Default for SensorHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-axis bias/scale plus a misalignment rotation, applied to every raw
/// reading before it reaches the fusion update step (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationData {
    pub bias: Vec3,
    pub scale: Vec3,
    #[serde(with = "matrix3_serde")]
    pub misalignment: M3,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl CalibrationData {
    /// Unit scale, zero bias, identity misalignment.
    pub fn identity() -> Self {
        Self {
            bias: Vec3::zero(),
            scale: Vec3::new(1.0, 1.0, 1.0),
            misalignment: crate::math::identity3(),
            valid_from: Utc::now(),
            valid_until: None,
        }
    }

    /// `corrected = (raw - bias) * scale`, then rotated by `misalignment`.
    pub fn apply(&self, raw: Vec3) -> Vec3 {
        let corrected = Vec3::new(
            (raw.x - self.bias.x) * self.scale.x,
            (raw.y - self.bias.y) * self.scale.y,
            (raw.z - self.bias.z) * self.scale.z,
        );
        crate::math::apply_rotation(corrected, &self.misalignment)
    }
}

impl Default for CalibrationData {
    fn default() -> Self {
        Self::identity()
    }
}

/// Best-estimate kinematic state produced by the fusion engine.
///
/// `position`, `velocity`, and `covariance` are always defined —
/// covariance is seeded to `sigma^2 * I6` at construction and never
/// becomes undefined, even before the first reading arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedState {
    pub position: Vec3,
    pub velocity: Vec3,
    pub acceleration: Vec3,
    #[serde(with = "matrix6_serde")]
    pub covariance: M6,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    pub active_sensors: Vec<String>,
    pub primary_sensor: Option<String>,
    pub fusion_quality: f64,
    pub converged: bool,
}

impl FusedState {
    pub fn initial(initial_covariance: f64) -> Self {
        Self {
            position: Vec3::zero(),
            velocity: Vec3::zero(),
            acceleration: Vec3::zero(),
            covariance: M6::identity() * initial_covariance,
            timestamp: Utc::now(),
            confidence: 0.0,
            active_sensors: Vec::new(),
            primary_sensor: None,
            fusion_quality: 0.0,
            converged: false,
        }
    }
}

/// Classification of an anomalous reading (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyKind {
    Spike,
    Noise,
    Drift,
    Dropout,
    Inconsistent,
}

/// A detected anomaly, kept in a bounded ring for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub id: Uuid,
    pub sensor_id: String,
    pub kind: AnomalyKind,
    pub severity: f64,
    pub expected: Vec3,
    pub actual: Vec3,
    pub timestamp: DateTime<Utc>,
    pub reading: Reading,
}

/// Static kinematic/flight envelope plus feature flags for a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadCapabilities {
    pub max_speed: f64,
    pub max_accel: f64,
    pub max_turn_rate: f64,
    pub min_altitude: f64,
    pub max_altitude: f64,
    pub max_range: f64,
    pub max_flight_time_s: f64,
    pub stealth_capable: bool,
    pub supports_prediction: bool,
}

impl Default for PayloadCapabilities {
    fn default() -> Self {
        Self {
            max_speed: 250.0,
            max_accel: 30.0,
            max_turn_rate: 1.5,
            min_altitude: 500.0,
            max_altitude: 12_000.0,
            max_range: 300_000.0,
            max_flight_time_s: 3_600.0,
            stealth_capable: false,
            supports_prediction: true,
        }
    }
}

/// Payload lifecycle status (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadStatus {
    Idle,
    Active,
    Navigating,
    Holding,
    Aborted,
    EmergencyStop,
    Stealth,
}

/// A tracked payload: identity, envelope, and live kinematic state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub id: String,
    pub payload_type: String,
    pub capabilities: PayloadCapabilities,
    pub position: Vec3,
    pub velocity: Vec3,
    pub acceleration: Vec3,
    pub orientation: Quaternion,
    pub armed: bool,
    pub status: PayloadStatus,
    pub fuel: f64,
    pub battery: f64,
    /// 0-100. Treated as "unknown, assume nominal" when 0 (§9 open question).
    pub health: f64,
    pub last_update: DateTime<Utc>,
}

impl Payload {
    pub fn new(id: impl Into<String>, payload_type: impl Into<String>, capabilities: PayloadCapabilities) -> Self {
        Self {
            id: id.into(),
            payload_type: payload_type.into(),
            capabilities,
            position: Vec3::zero(),
            velocity: Vec3::zero(),
            acceleration: Vec3::zero(),
            orientation: Quaternion::identity(),
            armed: false,
            status: PayloadStatus::Idle,
            fuel: 100.0,
            battery: 100.0,
            health: 100.0,
            last_update: Utc::now(),
        }
    }
}

/// A single planned trajectory point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waypoint {
    pub id: Uuid,
    pub position: Vec3,
    pub velocity: Vec3,
    pub timestamp: DateTime<Utc>,
    pub stealth: bool,
}

/// Trajectory lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrajectoryStatus {
    Planned,
    Active,
    Completed,
    Aborted,
}

/// An ordered sequence of waypoints plus derived quality scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub id: Uuid,
    pub waypoints: Vec<Waypoint>,
    pub stealth_score: f64,
    pub confidence: f64,
    pub status: TrajectoryStatus,
    pub created_at: DateTime<Utc>,
}

impl Trajectory {
    pub fn first_waypoint(&self) -> Option<&Waypoint> {
        self.waypoints.first()
    }
}

/// Mission classification. `Rtb` is synthesized by `abort_mission` when
/// `return_to_base = true` (§4.8, §8 scenario 6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "label")]
pub enum MissionType {
    Standard,
    Rtb,
    Other(String),
}

/// Mission lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissionStatus {
    Pending,
    Active,
    Completed,
    Aborted,
}

/// A mission against one payload. Invariant: while `status = Active`,
/// `trajectory` is always `Some`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: Uuid,
    pub payload_id: String,
    pub mission_type: MissionType,
    pub start: Vec3,
    pub target: Vec3,
    pub priority: u32,
    pub stealth_required: bool,
    pub status: MissionStatus,
    pub trajectory: Option<Trajectory>,
    pub abort_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Minimum separation from target (meters) at which a mission is
/// considered complete (§4.4).
pub const MISSION_COMPLETION_RADIUS_M: f64 = 25.0;

/// Ambient weather affecting sensor confidence and targeting quality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherCondition {
    pub wind_speed: f64,
    pub wind_direction: f64,
    pub visibility: f64,
    pub precipitation: f64,
    pub temperature: f64,
    pub turbulence: f64,
    pub icing_risk: f64,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for WeatherCondition {
    /// Calm, clear-air baseline: no wind penalty, no visibility penalty.
    fn default() -> Self {
        Self {
            wind_speed: 0.0,
            wind_direction: 0.0,
            visibility: 10_000.0,
            precipitation: 0.0,
            temperature: 15.0,
            turbulence: 0.0,
            icing_risk: 0.0,
            updated_at: Utc::now(),
        }
    }
}

/// Electronic countermeasure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ECMKind {
    Jamming,
    Spoofing,
    Deception,
}

/// A detected electronic countermeasure emitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ECMThreat {
    pub id: Uuid,
    pub kind: ECMKind,
    pub position: Vec3,
    pub effect_radius: f64,
    pub strength: f64,
    pub band: String,
    pub active: bool,
    pub detected_at: DateTime<Utc>,
}

/// Recomputed-on-demand targeting quality snapshot (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetingMetrics {
    pub payload_id: String,
    pub mission_id: Uuid,
    pub hit_probability: f64,
    pub cep: f64,
    pub terminal_phase: bool,
    pub time_to_impact: f64,
    pub closing_velocity: f64,
    pub cross_track_error: f64,
    pub weather_impact: f64,
    pub ecm_detected: bool,
    pub last_replan_reason: Option<String>,
    pub replan_count: u64,
    pub computed_at: DateTime<Utc>,
}

/// A queued command for the payload controller (§4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub payload_id: String,
    pub command_type: CommandType,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub priority: u32,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Supported payload command types (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    NavigateTo,
    Hold,
    Return,
    Arm,
    Disarm,
    Abort,
    SetSpeed,
    SetAltitude,
    SetHeading,
    EngageStealth,
    DisengageStealth,
    EmergencyStop,
}

/// (De)serializes a `nalgebra::Matrix3<f64>` as a flat column-major array
/// of nine floats, keeping `Reading`/`CalibrationData` JSON readable.
mod matrix3_serde {
    use super::M3;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(m: &M3, s: S) -> Result<S::Ok, S::Error> {
        let flat: Vec<f64> = m.iter().copied().collect();
        flat.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<M3, D::Error> {
        let flat = Vec::<f64>::deserialize(d)?;
        if flat.len() != 9 {
            return Err(serde::de::Error::custom("expected 9 elements for a 3x3 matrix"));
        }
        Ok(M3::from_column_slice(&flat))
    }
}

/// (De)serializes a `nalgebra::Matrix6<f64>` as a flat array of 36 floats.
mod matrix6_serde {
    use super::M6;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(m: &M6, s: S) -> Result<S::Ok, S::Error> {
        let flat: Vec<f64> = m.iter().copied().collect();
        flat.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<M6, D::Error> {
        let flat = Vec::<f64>::deserialize(d)?;
        if flat.len() != 36 {
            return Err(serde::de::Error::custom("expected 36 elements for a 6x6 matrix"));
        }
        Ok(M6::from_column_slice(&flat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_identity_is_noop() {
        let cal = CalibrationData::identity();
        let raw = Vec3::new(1.0, -2.0, 3.5);
        let corrected = cal.apply(raw);
        assert_eq!(corrected.x, raw.x);
        assert_eq!(corrected.y, raw.y);
        assert_eq!(corrected.z, raw.z);
    }

    #[test]
    fn calibration_applies_bias_then_scale() {
        let mut cal = CalibrationData::identity();
        cal.bias = Vec3::new(1.0, 0.0, 0.0);
        cal.scale = Vec3::new(2.0, 1.0, 1.0);
        let corrected = cal.apply(Vec3::new(3.0, 0.0, 0.0));
        assert_eq!(corrected.x, 4.0); // (3 - 1) * 2
    }

    #[test]
    fn fused_state_initial_covariance_is_seeded() {
        let state = FusedState::initial(100.0);
        assert_eq!(state.covariance[(0, 0)], 100.0);
        assert_eq!(state.covariance[(5, 5)], 100.0);
    }

    #[test]
    fn reading_json_roundtrip() {
        let reading = Reading::new(
            "gps-1",
            SensorKind::Gps,
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::zero(),
            crate::math::diag3(Vec3::new(1.0, 1.0, 1.0)),
        );
        let json = serde_json::to_string(&reading).unwrap();
        let back: Reading = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sensor_id, reading.sensor_id);
        assert_eq!(back.position.x, reading.position.x);
        assert_eq!(back.covariance[(0, 0)], reading.covariance[(0, 0)]);
    }

    #[test]
    fn sensor_kind_priority_ranks_gps_first() {
        let mut kinds = [
            SensorKind::Visual,
            SensorKind::Gps,
            SensorKind::Ir,
            SensorKind::Ins,
            SensorKind::Radar,
            SensorKind::Lidar,
        ];
        kinds.sort_by_key(|k| k.priority());
        assert_eq!(
            kinds,
            [
                SensorKind::Gps,
                SensorKind::Ins,
                SensorKind::Radar,
                SensorKind::Lidar,
                SensorKind::Visual,
                SensorKind::Ir,
            ]
        );
    }
}
