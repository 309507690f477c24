//! Sensor registry & calibration (§4.2)
//!
//! Tracks per-sensor identity, calibration, and health. Owned exclusively
//! by the fusion engine, which holds the single lock covering both this
//! registry and the fused state (§5).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{GuidanceError, Result};
use crate::models::{CalibrationData, SensorHealth, SensorKind, SensorStatus};

struct SensorEntry {
    kind: SensorKind,
    calibration: CalibrationData,
    health: SensorHealth,
}

/// Registry of known sensors and their calibration/health state.
#[derive(Default)]
pub struct SensorRegistry {
    sensors: HashMap<String, SensorEntry>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self { sensors: HashMap::new() }
    }

    /// Registers a new sensor with identity calibration unless `calibration`
    /// is supplied. Fails with `AlreadyRegistered` if `sensor_id` exists.
    pub fn register(
        &mut self,
        sensor_id: impl Into<String>,
        kind: SensorKind,
        calibration: Option<CalibrationData>,
    ) -> Result<()> {
        let sensor_id = sensor_id.into();
        if self.sensors.contains_key(&sensor_id) {
            return Err(GuidanceError::AlreadyRegistered(sensor_id));
        }
        self.sensors.insert(
            sensor_id,
            SensorEntry {
                kind,
                calibration: calibration.unwrap_or_default(),
                health: SensorHealth::new(),
            },
        );
        Ok(())
    }

    /// Idempotent: unregistering an unknown sensor is a no-op.
    pub fn unregister(&mut self, sensor_id: &str) {
        self.sensors.remove(sensor_id);
    }

    pub fn update_calibration(&mut self, sensor_id: &str, data: CalibrationData) -> Result<()> {
        let entry = self
            .sensors
            .get_mut(sensor_id)
            .ok_or_else(|| GuidanceError::UnknownSensor(sensor_id.to_string()))?;
        entry.calibration = data;
        entry.health.last_calibrated = Some(Utc::now());
        Ok(())
    }

    pub fn is_registered(&self, sensor_id: &str) -> bool {
        self.sensors.contains_key(sensor_id)
    }

    pub fn kind_of(&self, sensor_id: &str) -> Option<SensorKind> {
        self.sensors.get(sensor_id).map(|e| e.kind)
    }

    pub fn calibration_of(&self, sensor_id: &str) -> Option<&CalibrationData> {
        self.sensors.get(sensor_id).map(|e| &e.calibration)
    }

    pub fn health_of(&self, sensor_id: &str) -> Option<&SensorHealth> {
        self.sensors.get(sensor_id).map(|e| &e.health)
    }

    pub fn health_mut(&mut self, sensor_id: &str) -> Option<&mut SensorHealth> {
        self.sensors.get_mut(sensor_id).map(|e| &mut e.health)
    }

    pub fn is_failed(&self, sensor_id: &str) -> bool {
        self.sensors
            .get(sensor_id)
            .map(|e| e.health.status == SensorStatus::Failed)
            .unwrap_or(true)
    }

    /// Sensor IDs in deterministic order, required so a `HashMap`'s
    /// unspecified iteration order never leaks into fusion-cycle ordering
    /// (§5).
    pub fn sensor_ids_sorted(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sensors.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Records that a reading arrived from `sensor_id`, updating the
    /// rolling counters the health monitor uses (§4.3).
    pub fn record_reading(&mut self, sensor_id: &str, valid: bool, noise_level: f64, at: DateTime<Utc>) {
        if let Some(entry) = self.sensors.get_mut(sensor_id) {
            entry.health.readings_total += 1;
            if valid {
                entry.health.readings_valid += 1;
            }
            entry.health.noise_level = noise_level;
            entry.health.last_reading = Some(at);
        }
    }

    pub fn record_anomaly(&mut self, sensor_id: &str) {
        if let Some(entry) = self.sensors.get_mut(sensor_id) {
            entry.health.anomaly_count += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_twice_fails() {
        let mut reg = SensorRegistry::new();
        reg.register("gps-1", SensorKind::Gps, None).unwrap();
        let err = reg.register("gps-1", SensorKind::Gps, None).unwrap_err();
        assert!(matches!(err, GuidanceError::AlreadyRegistered(_)));
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let mut reg = SensorRegistry::new();
        reg.unregister("does-not-exist");
        assert!(reg.is_empty());
    }

    #[test]
    fn update_calibration_unknown_sensor_fails() {
        let mut reg = SensorRegistry::new();
        let err = reg
            .update_calibration("missing", CalibrationData::identity())
            .unwrap_err();
        assert!(matches!(err, GuidanceError::UnknownSensor(_)));
    }

    #[test]
    fn default_calibration_is_identity() {
        let mut reg = SensorRegistry::new();
        reg.register("ins-1", SensorKind::Ins, None).unwrap();
        let cal = reg.calibration_of("ins-1").unwrap();
        assert_eq!(cal.bias.x, 0.0);
        assert_eq!(cal.scale.x, 1.0);
    }

    #[test]
    fn sensor_ids_sorted_is_deterministic() {
        let mut reg = SensorRegistry::new();
        reg.register("zeta", SensorKind::Gps, None).unwrap();
        reg.register("alpha", SensorKind::Ins, None).unwrap();
        assert_eq!(reg.sensor_ids_sorted(), vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
