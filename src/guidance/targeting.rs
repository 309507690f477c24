//! Targeting analytics (§4.7)
//!
//! Pure recomputation from a single snapshot: fused position/velocity,
//! the active trajectory, ambient weather, and any ECM threats.

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::config::TerminalConfig;
use crate::math::{magnitude, point_to_segment_distance, sub, Vec3};
use crate::models::{ECMThreat, Payload, TargetingMetrics, Trajectory, WeatherCondition};

pub struct TargetingInput<'a> {
    pub payload: &'a Payload,
    pub mission_id: Uuid,
    pub target: Vec3,
    pub trajectory: Option<&'a Trajectory>,
    pub weather: &'a WeatherCondition,
    pub ecm_threats: &'a [ECMThreat],
    pub stealth_required: bool,
    pub terminal: &'a TerminalConfig,
    pub last_replan_reason: Option<String>,
    pub replan_count: u64,
}

pub fn compute(input: TargetingInput<'_>) -> TargetingMetrics {
    let distance = magnitude(sub(input.target, input.payload.position));
    let weather_impact = weather_impact(input.weather);
    let ecm_impact = ecm_impact(input.payload.position, input.ecm_threats);
    let ecm_detected = input.ecm_threats.iter().any(|t| t.active && magnitude(sub(t.position, input.payload.position)) < t.effect_radius);

    let terminal_active = input.terminal.enabled && distance < input.terminal.activation_distance;
    let terminal_boost = if terminal_active { 1.2 } else { 1.0 };

    let health_factor = if input.payload.health == 0.0 {
        debug!(payload_id = %input.payload.id, "health=0 treated as unknown, coerced to nominal");
        1.0
    } else {
        input.payload.health / 100.0
    };

    let trajectory_confidence = input.trajectory.map(|t| t.confidence).unwrap_or(0.0);
    let hit_probability = (trajectory_confidence * (1.0 / (1.0 + distance / 10_000.0)) * weather_impact * ecm_impact * terminal_boost * health_factor)
        .clamp(0.0, 1.0);

    let cep_base: f64 = if input.terminal.enabled { 50.0 } else { 100.0 };
    let mut cep = cep_base * (2.0 - weather_impact) * (2.0 - ecm_impact);
    if input.stealth_required {
        cep *= 0.9;
    }

    let cross_track_error = match input.trajectory {
        Some(traj) if traj.waypoints.len() >= 2 => traj
            .waypoints
            .windows(2)
            .map(|w| point_to_segment_distance(input.payload.position, w[0].position, w[1].position))
            .fold(f64::INFINITY, f64::min),
        _ => 0.0,
    };

    let speed = magnitude(input.payload.velocity);
    let time_to_impact = if speed > 0.0 { distance / speed } else { 0.0 };

    TargetingMetrics {
        payload_id: input.payload.id.clone(),
        mission_id: input.mission_id,
        hit_probability,
        cep,
        terminal_phase: terminal_active,
        time_to_impact,
        closing_velocity: speed,
        cross_track_error,
        weather_impact,
        ecm_detected,
        last_replan_reason: input.last_replan_reason,
        replan_count: input.replan_count,
        computed_at: Utc::now(),
    }
}

fn weather_impact(weather: &WeatherCondition) -> f64 {
    let wind_penalty = (weather.wind_speed - 10.0).max(0.0) * 0.01;
    let visibility_penalty = (5_000.0 - weather.visibility).max(0.0) / 10_000.0;
    (1.0 - wind_penalty - visibility_penalty - 0.2 * weather.turbulence - 0.15 * weather.icing_risk).clamp(0.3, 1.0)
}

fn ecm_impact(position: Vec3, threats: &[ECMThreat]) -> f64 {
    let degradation: f64 = threats
        .iter()
        .filter(|t| t.active)
        .filter_map(|t| {
            let d = magnitude(sub(t.position, position));
            if d < t.effect_radius {
                Some((1.0 - d / t.effect_radius) * t.strength * 0.3)
            } else {
                None
            }
        })
        .sum();
    (1.0 - degradation).clamp(0.3, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ECMKind, PayloadCapabilities, TrajectoryStatus, Waypoint};

    fn payload_at(pos: Vec3) -> Payload {
        let mut p = Payload::new("p1", "strike", PayloadCapabilities::default());
        p.position = pos;
        p
    }

    fn trajectory(waypoints: Vec<Waypoint>) -> Trajectory {
        Trajectory {
            id: Uuid::new_v4(),
            waypoints,
            stealth_score: 0.5,
            confidence: 0.92,
            status: TrajectoryStatus::Active,
            created_at: Utc::now(),
        }
    }

    fn waypoint(pos: Vec3) -> Waypoint {
        Waypoint { id: Uuid::new_v4(), position: pos, velocity: Vec3::zero(), timestamp: Utc::now(), stealth: false }
    }

    #[test]
    fn calm_weather_has_no_penalty() {
        let weather = WeatherCondition::default();
        assert_eq!(weather_impact(&weather), 1.0);
    }

    #[test]
    fn hit_probability_is_bounded() {
        let payload = payload_at(Vec3::new(100.0, 0.0, 0.0));
        let traj = trajectory(vec![waypoint(Vec3::zero()), waypoint(Vec3::new(100.0, 0.0, 0.0))]);
        let weather = WeatherCondition::default();
        let metrics = compute(TargetingInput {
            payload: &payload,
            mission_id: Uuid::new_v4(),
            target: Vec3::new(100.0, 0.0, 0.0),
            trajectory: Some(&traj),
            weather: &weather,
            ecm_threats: &[],
            stealth_required: false,
            terminal: &TerminalConfig::default(),
            last_replan_reason: None,
            replan_count: 0,
        });
        assert!(metrics.hit_probability >= 0.0 && metrics.hit_probability <= 1.0);
        assert!(metrics.cep > 0.0);
    }

    #[test]
    fn zero_velocity_gives_zero_time_to_impact() {
        let payload = payload_at(Vec3::new(100.0, 0.0, 0.0));
        let weather = WeatherCondition::default();
        let metrics = compute(TargetingInput {
            payload: &payload,
            mission_id: Uuid::new_v4(),
            target: Vec3::new(200.0, 0.0, 0.0),
            trajectory: None,
            weather: &weather,
            ecm_threats: &[],
            stealth_required: false,
            terminal: &TerminalConfig::default(),
            last_replan_reason: None,
            replan_count: 0,
        });
        assert_eq!(metrics.time_to_impact, 0.0);
    }

    #[test]
    fn active_ecm_within_radius_degrades_impact_and_flags_detected() {
        let payload = payload_at(Vec3::zero());
        let weather = WeatherCondition::default();
        let threat = ECMThreat {
            id: Uuid::new_v4(),
            kind: ECMKind::Jamming,
            position: Vec3::new(50.0, 0.0, 0.0),
            effect_radius: 100.0,
            strength: 1.0,
            band: "x".to_string(),
            active: true,
            detected_at: Utc::now(),
        };
        let metrics = compute(TargetingInput {
            payload: &payload,
            mission_id: Uuid::new_v4(),
            target: Vec3::new(500.0, 0.0, 0.0),
            trajectory: None,
            weather: &weather,
            ecm_threats: &[threat],
            stealth_required: false,
            terminal: &TerminalConfig::default(),
            last_replan_reason: None,
            replan_count: 0,
        });
        assert!(metrics.ecm_detected);
        assert!(metrics.weather_impact <= 1.0);
    }

    #[test]
    fn zero_health_is_treated_as_nominal() {
        let mut payload = payload_at(Vec3::zero());
        payload.health = 0.0;
        let weather = WeatherCondition::default();
        let metrics_zero = compute(TargetingInput {
            payload: &payload,
            mission_id: Uuid::new_v4(),
            target: Vec3::new(500.0, 0.0, 0.0),
            trajectory: None,
            weather: &weather,
            ecm_threats: &[],
            stealth_required: false,
            terminal: &TerminalConfig::default(),
            last_replan_reason: None,
            replan_count: 0,
        });
        payload.health = 100.0;
        let metrics_full = compute(TargetingInput {
            payload: &payload,
            mission_id: Uuid::new_v4(),
            target: Vec3::new(500.0, 0.0, 0.0),
            trajectory: None,
            weather: &weather,
            ecm_threats: &[],
            stealth_required: false,
            terminal: &TerminalConfig::default(),
            last_replan_reason: None,
            replan_count: 0,
        });
        assert_eq!(metrics_zero.hit_probability, metrics_full.hit_probability);
    }
}
