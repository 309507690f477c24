//! Runtime configuration (§6)
//!
//! One `Default`-backed struct per subsystem, generalizing the teacher's
//! single `Config` in `main.rs`. `GuidanceConfig::from_env` overlays a
//! handful of `GUIDANCE_*` environment variables on top of the defaults,
//! matching the way the teacher reads `RUST_LOG` at startup.

use std::collections::HashMap;
use std::time::Duration;

use crate::models::SensorKind;

/// Fusion engine tunables (§4.3, §6).
#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub update_rate: Duration,
    pub health_check_rate: Duration,
    pub sensor_timeout: Duration,
    pub min_sensors_required: usize,
    pub mahalanobis_threshold: f64,
    pub anomaly_threshold: f64,
    pub convergence_threshold: f64,
    pub process_noise_pos: f64,
    pub process_noise_vel: f64,
    pub initial_covariance: f64,
    pub calibration_interval: Duration,
    pub enable_failover: bool,
    pub failover_priority_list: Vec<SensorKind>,
    pub kind_weights: HashMap<SensorKind, f64>,
    pub history_capacity: usize,
    pub anomaly_ring_capacity: usize,
}

impl FusionConfig {
    pub fn weight_of(&self, kind: SensorKind) -> f64 {
        self.kind_weights
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_weight())
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            update_rate: Duration::from_millis(50), // 20 Hz
            health_check_rate: Duration::from_secs(1),
            sensor_timeout: Duration::from_secs(2),
            min_sensors_required: 2,
            // sqrt(5.991): 95% confidence interval for 2 degrees of freedom.
            mahalanobis_threshold: 5.991_f64.sqrt(),
            anomaly_threshold: 3.0,
            convergence_threshold: 1.0,
            process_noise_pos: 0.1,
            process_noise_vel: 0.5,
            initial_covariance: 100.0,
            calibration_interval: Duration::from_secs(3600),
            enable_failover: true,
            failover_priority_list: vec![
                SensorKind::Ins,
                SensorKind::Radar,
                SensorKind::Lidar,
                SensorKind::Gps,
                SensorKind::Visual,
                SensorKind::Ir,
            ],
            kind_weights: HashMap::new(),
            history_capacity: 1000,
            anomaly_ring_capacity: 500,
        }
    }
}

/// Terminal-phase guidance tunables (§4.8, §6).
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub enabled: bool,
    pub activation_distance: f64,
    pub update_rate_hz: f64,
    pub max_correction: f64,
    pub predictor_horizon: f64,
    pub pn_gain: f64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            activation_distance: 5_000.0,
            update_rate_hz: 10.0,
            max_correction: 45.0,
            predictor_horizon: 3.0,
            pn_gain: 3.0,
        }
    }
}

/// Guidance orchestrator tunables (§4.6, §4.8, §6).
#[derive(Debug, Clone)]
pub struct GuidanceConfig {
    pub replan_interval: Duration,
    pub terminal: TerminalConfig,
    pub telemetry_check_interval: Duration,
    pub mission_monitor_interval: Duration,
    pub trajectory_optimizer_interval: Duration,
    pub enable_stealth: bool,
    pub enable_prediction: bool,
    pub enable_multi_payload: bool,
    pub fused_state_replan_quality_threshold: f64,
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            replan_interval: Duration::from_millis(250),
            terminal: TerminalConfig::default(),
            telemetry_check_interval: Duration::from_secs(1),
            mission_monitor_interval: Duration::from_secs(5),
            trajectory_optimizer_interval: Duration::from_secs(10),
            enable_stealth: true,
            enable_prediction: true,
            enable_multi_payload: true,
            fused_state_replan_quality_threshold: 0.6,
        }
    }
}

impl GuidanceConfig {
    /// Overlays `GUIDANCE_REPLAN_INTERVAL_MS` and
    /// `GUIDANCE_TERMINAL_ACTIVATION_M` on the defaults when present.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("GUIDANCE_REPLAN_INTERVAL_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.replan_interval = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("GUIDANCE_TERMINAL_ACTIVATION_M") {
            if let Ok(m) = v.parse::<f64>() {
                cfg.terminal.activation_distance = m;
            }
        }
        cfg
    }
}

/// Event bridge tunables (§4.9, §6).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub url: String,
    pub reconnect_wait: Duration,
    pub reconnect_wait_ceiling: Duration,
    pub max_reconnects: Option<u32>,
    pub ping_interval: Duration,
    pub event_buffer_size: usize,
    pub enable_compression: bool,
    pub publish_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:4222".to_string(),
            reconnect_wait: Duration::from_millis(500),
            reconnect_wait_ceiling: Duration::from_secs(30),
            max_reconnects: None,
            ping_interval: Duration::from_secs(15),
            event_buffer_size: 256,
            enable_compression: false,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(url) = std::env::var("GUIDANCE_BRIDGE_URL") {
            cfg.url = url;
        }
        if let Ok(v) = std::env::var("GUIDANCE_BRIDGE_MAX_RECONNECTS") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.max_reconnects = Some(n);
            }
        }
        cfg
    }
}

/// Top-level configuration bundle, logged once at startup.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub fusion: FusionConfig,
    pub guidance: GuidanceConfig,
    pub bridge: BridgeConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            fusion: FusionConfig::default(),
            guidance: GuidanceConfig::from_env(),
            bridge: BridgeConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_of_falls_back_to_kind_default() {
        let cfg = FusionConfig::default();
        assert_eq!(cfg.weight_of(SensorKind::Ins), SensorKind::Ins.default_weight());
    }

    #[test]
    fn weight_of_honors_override() {
        let mut cfg = FusionConfig::default();
        cfg.kind_weights.insert(SensorKind::Gps, 0.99);
        assert_eq!(cfg.weight_of(SensorKind::Gps), 0.99);
    }

    #[test]
    fn mahalanobis_threshold_matches_spec_constant() {
        let cfg = FusionConfig::default();
        assert!((cfg.mahalanobis_threshold - 2.447).abs() < 0.001);
    }
}
