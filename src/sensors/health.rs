//! Sensor health monitor (§4.3, 1 Hz)
//!
//! A free function rather than a struct: the monitor only ever transforms
//! a `SensorHealth` in place given the current time and config, so there
//! is no state worth owning beyond what `SensorRegistry` already holds.

use chrono::{DateTime, Utc};

use crate::config::FusionConfig;
use crate::models::{SensorHealth, SensorStatus};

/// Advances `health`'s status for one 1 Hz tick.
pub fn tick(health: &mut SensorHealth, now: DateTime<Utc>, cfg: &FusionConfig) -> bool {
    let was_failed = health.status == SensorStatus::Failed;

    let timed_out = match health.last_reading {
        Some(last) => now.signed_duration_since(last).to_std().unwrap_or_default() > cfg.sensor_timeout,
        None => true,
    };

    if timed_out {
        health.status = SensorStatus::Offline;
        return false;
    }

    health.error_rate = if health.readings_total > 0 {
        1.0 - (health.readings_valid as f64 / health.readings_total as f64)
    } else {
        0.0
    };

    if let Some(last) = health.last_reading {
        let age = now.signed_duration_since(last).to_std().unwrap_or_default().as_secs_f64();
        if age > 0.0 {
            health.reading_rate_hz = (1.0 / age).min(health.reading_rate_hz.max(1.0 / age));
        }
    }

    health.status = if health.error_rate > 0.5 {
        SensorStatus::Failed
    } else if health.error_rate > 0.2 || health.noise_level > 5.0 || health.reading_rate_hz < 1.0 {
        SensorStatus::Degraded
    } else {
        SensorStatus::Healthy
    };

    let calibration_stale = match health.last_calibrated {
        Some(last) => {
            now.signed_duration_since(last).to_std().unwrap_or_default() > cfg.calibration_interval
        }
        None => true,
    };
    if calibration_stale {
        health.status = SensorStatus::Calibrating;
    }

    !was_failed && health.status == SensorStatus::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn fresh_health(now: DateTime<Utc>) -> SensorHealth {
        let mut h = SensorHealth::new();
        h.last_reading = Some(now);
        h.last_calibrated = Some(now);
        h.readings_total = 100;
        h.readings_valid = 100;
        h.reading_rate_hz = 20.0;
        h
    }

    #[test]
    fn offline_when_timed_out() {
        let cfg = FusionConfig::default();
        let now = Utc::now();
        let mut health = fresh_health(now - ChronoDuration::seconds(10));
        tick(&mut health, now, &cfg);
        assert_eq!(health.status, crate::models::SensorStatus::Offline);
    }

    #[test]
    fn healthy_when_fresh_and_low_error() {
        let cfg = FusionConfig::default();
        let now = Utc::now();
        let mut health = fresh_health(now);
        tick(&mut health, now, &cfg);
        assert_eq!(health.status, crate::models::SensorStatus::Healthy);
    }

    #[test]
    fn failed_when_error_rate_high() {
        let cfg = FusionConfig::default();
        let now = Utc::now();
        let mut health = fresh_health(now);
        health.readings_valid = 10; // error_rate = 0.9
        let transitioned = tick(&mut health, now, &cfg);
        assert_eq!(health.status, crate::models::SensorStatus::Failed);
        assert!(transitioned);
    }

    #[test]
    fn calibration_overdue_forces_calibrating() {
        let cfg = FusionConfig::default();
        let now = Utc::now();
        let mut health = fresh_health(now);
        health.last_calibrated = Some(now - ChronoDuration::seconds(cfg.calibration_interval.as_secs() as i64 + 1));
        tick(&mut health, now, &cfg);
        assert_eq!(health.status, crate::models::SensorStatus::Calibrating);
    }
}
