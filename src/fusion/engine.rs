//! Fusion engine (§4.3)
//!
//! The predict/update cycle itself. Synchronous and lock-free by
//! design — [`super::FusionSystem`] is the async wrapper that puts this
//! behind a `tokio::sync::RwLock` and turns its return values into
//! dispatched callbacks.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::config::FusionConfig;
use crate::error::{GuidanceError, Result};
use crate::math::{add, magnitude, scale, sub, Vec3};
use crate::models::{AnomalyReport, CalibrationData, FusedState, Reading, SensorKind};
use crate::sensors::{health, SensorRegistry};

/// Something the engine wants the async wrapper to dispatch once the
/// write lock is released (§9: callbacks off the critical path).
#[derive(Debug, Clone)]
pub enum FusionEvent {
    StateUpdate(FusedState),
    Anomaly(AnomalyReport),
    Failover { from: Option<String>, to: String },
    SensorFailure(String),
    OutlierRejected(String),
}

struct Pending {
    reading: Reading,
    arrival: Instant,
}

pub struct FusionEngine {
    cfg: FusionConfig,
    registry: SensorRegistry,
    state: FusedState,
    anomalies: super::anomaly::AnomalyDetector,
    history: VecDeque<FusedState>,
    pending: HashMap<String, Pending>,
    last_cycle_instant: Option<Instant>,
}

impl FusionEngine {
    pub fn new(cfg: FusionConfig) -> Self {
        let state = FusedState::initial(cfg.initial_covariance);
        let anomalies = super::anomaly::AnomalyDetector::new(cfg.anomaly_ring_capacity);
        Self {
            registry: SensorRegistry::new(),
            state,
            anomalies,
            history: VecDeque::with_capacity(cfg.history_capacity),
            pending: HashMap::new(),
            last_cycle_instant: None,
            cfg,
        }
    }

    pub fn register_sensor(
        &mut self,
        sensor_id: impl Into<String>,
        kind: SensorKind,
        calibration: Option<CalibrationData>,
    ) -> Result<()> {
        self.registry.register(sensor_id, kind, calibration)
    }

    pub fn unregister_sensor(&mut self, sensor_id: &str) {
        self.registry.unregister(sensor_id);
        self.pending.remove(sensor_id);
    }

    pub fn update_calibration(&mut self, sensor_id: &str, data: CalibrationData) -> Result<()> {
        self.registry.update_calibration(sensor_id, data)
    }

    pub fn state(&self) -> &FusedState {
        &self.state
    }

    pub fn history(&self) -> &VecDeque<FusedState> {
        &self.history
    }

    pub fn anomaly_history(&self) -> &VecDeque<AnomalyReport> {
        self.anomalies.history()
    }

    pub fn registry(&self) -> &SensorRegistry {
        &self.registry
    }

    /// Calibrates, anomaly-checks, and stores a single sensor reading.
    /// Returns any anomaly raised for this reading.
    pub fn ingest(&mut self, mut reading: Reading) -> Result<Option<AnomalyReport>> {
        if !self.registry.is_registered(&reading.sensor_id) {
            return Err(GuidanceError::UnknownSensor(reading.sensor_id.clone()));
        }
        if let Some(cal) = self.registry.calibration_of(&reading.sensor_id) {
            reading.position = cal.apply(reading.position);
            reading.velocity = cal.apply(reading.velocity);
        }

        let trace_pos = self.state.covariance[(0, 0)] + self.state.covariance[(1, 1)] + self.state.covariance[(2, 2)];
        let anomaly = self.anomalies.check(&mut reading, self.state.position, trace_pos, self.state.confidence, &self.cfg);
        if anomaly.is_some() {
            self.registry.record_anomaly(&reading.sensor_id);
        }

        let noise_level = reading.covariance[(0, 0)].max(reading.covariance[(1, 1)]).max(reading.covariance[(2, 2)]);
        self.registry.record_reading(&reading.sensor_id, reading.valid, noise_level, reading.timestamp);

        self.pending.insert(
            reading.sensor_id.clone(),
            Pending { reading, arrival: Instant::now() },
        );

        Ok(anomaly)
    }

    /// Runs one predict/update cycle. `now` is a monotonic instant used
    /// for freshness and `dt`; `now_wall` stamps the emitted state.
    pub fn run_cycle(&mut self, now: Instant, now_wall: DateTime<Utc>) -> Vec<FusionEvent> {
        let mut events = Vec::new();

        let mut collected: Vec<(String, Reading)> = Vec::new();
        let mut fresh_ids: Vec<String> = Vec::new();
        for sensor_id in self.registry.sensor_ids_sorted() {
            if self.registry.is_failed(&sensor_id) {
                continue;
            }
            let fresh = self
                .pending
                .get(&sensor_id)
                .map(|p| now.duration_since(p.arrival) < self.cfg.sensor_timeout)
                .unwrap_or(false);
            if !fresh {
                continue;
            }
            // Remember this sensor was fresh before draining it below, so a
            // failover search still has something to find.
            fresh_ids.push(sensor_id.clone());
            if let Some(pending) = self.pending.remove(&sensor_id) {
                if pending.reading.valid {
                    collected.push((sensor_id, pending.reading));
                }
            }
        }

        let dt = self.compute_dt(now_wall);
        self.predict(dt);

        if collected.len() < self.cfg.min_sensors_required {
            self.state.confidence *= 0.95;
            if self.cfg.enable_failover {
                if let Some(event) = self.attempt_failover(&fresh_ids) {
                    events.push(event);
                }
            }
            self.state.timestamp = now_wall;
            self.push_history();
            events.push(FusionEvent::StateUpdate(self.state.clone()));
            return events;
        }

        let mut applied: Vec<(String, Reading)> = Vec::new();
        for (sensor_id, reading) in collected {
            let kind = self.registry.kind_of(&sensor_id).unwrap_or(SensorKind::Gps);
            let weight = self.cfg.weight_of(kind);
            let r_pos = scale_diag(reading.covariance[(0, 0)], reading.covariance[(1, 1)], reading.covariance[(2, 2)], 1.0 / weight);

            let innov_pos = sub(reading.position, self.state.position);
            let d2 = innov_pos.x * innov_pos.x / r_pos.0
                + innov_pos.y * innov_pos.y / r_pos.1
                + innov_pos.z * innov_pos.z / r_pos.2;
            if d2.sqrt() > self.cfg.mahalanobis_threshold {
                events.push(FusionEvent::OutlierRejected(sensor_id));
                continue;
            }

            self.apply_update(&reading, r_pos);
            applied.push((sensor_id, reading));
        }

        self.recompute_derived(&applied);
        self.state.timestamp = now_wall;
        self.push_history();
        events.push(FusionEvent::StateUpdate(self.state.clone()));
        events
    }

    /// 1 Hz health monitor tick (§4.3).
    pub fn run_health_tick(&mut self, now_wall: DateTime<Utc>) -> Vec<FusionEvent> {
        let mut events = Vec::new();
        for sensor_id in self.registry.sensor_ids_sorted() {
            if let Some(h) = self.registry.health_mut(&sensor_id) {
                if health::tick(h, now_wall, &self.cfg) {
                    events.push(FusionEvent::SensorFailure(sensor_id));
                }
            }
        }
        events
    }

    fn compute_dt(&mut self, now_wall: DateTime<Utc>) -> f64 {
        let nominal = self.cfg.update_rate.as_secs_f64();
        let dt = now_wall.signed_duration_since(self.state.timestamp).to_std().map(|d| d.as_secs_f64()).unwrap_or(nominal);
        if dt < 0.0 || dt > 1.0 {
            nominal
        } else {
            dt
        }
    }

    fn predict(&mut self, dt: f64) {
        let v_dt = scale(self.state.velocity, dt);
        let a_half_dt2 = scale(self.state.acceleration, 0.5 * dt * dt);
        self.state.position = add(add(self.state.position, v_dt), a_half_dt2);
        self.state.velocity = add(self.state.velocity, scale(self.state.acceleration, dt));

        for i in 0..3 {
            self.state.covariance[(i, i)] += self.cfg.process_noise_pos * dt * dt;
        }
        for i in 3..6 {
            self.state.covariance[(i, i)] += self.cfg.process_noise_vel * dt;
        }
    }

    fn apply_update(&mut self, reading: &Reading, r_pos: (f64, f64, f64)) {
        let innov_pos = sub(reading.position, self.state.position);
        let innov_vel = sub(reading.velocity, self.state.velocity);
        let r_pos = [r_pos.0, r_pos.1, r_pos.2];

        for i in 0..3 {
            let p = self.state.covariance[(i, i)];
            let k = p / (p + r_pos[i]);
            let innov = component(innov_pos, i);
            set_component(&mut self.state.position, i, component(self.state.position, i) + k * innov);
            self.state.covariance[(i, i)] = (1.0 - k) * p;
        }
        for i in 0..3 {
            let vi = i + 3;
            let r_vel = 0.1 * r_pos[i];
            let p = self.state.covariance[(vi, vi)];
            let k = p / (p + r_vel);
            let innov = component(innov_vel, i);
            set_component(&mut self.state.velocity, i, component(self.state.velocity, i) + k * innov);
            self.state.covariance[(vi, vi)] = (1.0 - k) * p;
        }
    }

    fn recompute_derived(&mut self, applied: &[(String, Reading)]) {
        let trace_pos = self.state.covariance[(0, 0)] + self.state.covariance[(1, 1)] + self.state.covariance[(2, 2)];
        let total_registered = self.registry.len().max(1);
        let sensor_contribution = (applied.len() as f64 / total_registered as f64).min(1.0);
        let covariance_quality = (-trace_pos / 1000.0).exp();

        let agreement = if applied.len() > 1 {
            let positions: Vec<Vec3> = applied.iter().map(|(_, r)| r.position).collect();
            let mean = mean_position(&positions);
            let variance = positions
                .iter()
                .map(|p| {
                    let d = sub(*p, mean);
                    (d.x * d.x + d.y * d.y + d.z * d.z) / 3.0
                })
                .sum::<f64>()
                / positions.len() as f64;
            (-variance / 100.0).exp()
        } else {
            1.0
        };

        self.state.fusion_quality = (0.3 * sensor_contribution + 0.4 * covariance_quality + 0.3 * agreement).clamp(0.0, 1.0);
        let mean_confidence = if applied.is_empty() {
            0.0
        } else {
            applied.iter().map(|(_, r)| r.confidence).sum::<f64>() / applied.len() as f64
        };
        self.state.confidence = (self.state.fusion_quality * mean_confidence).clamp(0.0, 1.0);
        self.state.converged = trace_pos < self.cfg.convergence_threshold * 1000.0;
        self.state.active_sensors = applied.iter().map(|(id, _)| id.clone()).collect();
        self.state.primary_sensor = applied
            .iter()
            .filter_map(|(id, _)| self.registry.kind_of(id).map(|k| (id.clone(), k.priority())))
            .min_by_key(|(_, p)| *p)
            .map(|(id, _)| id);
    }

    /// Picks the highest-priority sensor among `fresh_ids` (sensors that
    /// arrived in time for this cycle but weren't enough to satisfy
    /// `min_sensors_required`) to promote as primary.
    fn attempt_failover(&mut self, fresh_ids: &[String]) -> Option<FusionEvent> {
        let previous = self.state.primary_sensor.clone();
        for kind in self.cfg.failover_priority_list.clone() {
            for sensor_id in fresh_ids {
                if self.registry.kind_of(sensor_id) != Some(kind) {
                    continue;
                }
                if Some(sensor_id.clone()) != previous {
                    self.state.primary_sensor = Some(sensor_id.clone());
                    return Some(FusionEvent::Failover { from: previous, to: sensor_id.clone() });
                }
            }
        }
        None
    }

    fn push_history(&mut self) {
        if self.history.len() >= self.cfg.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(self.state.clone());
    }
}

fn component(v: Vec3, i: usize) -> f64 {
    match i {
        0 => v.x,
        1 => v.y,
        _ => v.z,
    }
}

fn set_component(v: &mut Vec3, i: usize, value: f64) {
    match i {
        0 => v.x = value,
        1 => v.y = value,
        _ => v.z = value,
    }
}

fn scale_diag(x: f64, y: f64, z: f64, s: f64) -> (f64, f64, f64) {
    (x * s, y * s, z * s)
}

fn mean_position(positions: &[Vec3]) -> Vec3 {
    let n = positions.len() as f64;
    let sum = positions.iter().fold(Vec3::zero(), |acc, p| add(acc, *p));
    scale(sum, 1.0 / n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::diag3;
    use crate::models::SensorKind;
    use std::time::Duration;

    fn engine_with(cfg: FusionConfig) -> FusionEngine {
        let mut e = FusionEngine::new(cfg);
        e.register_sensor("gps-1", SensorKind::Gps, None).unwrap();
        e.register_sensor("ins-1", SensorKind::Ins, None).unwrap();
        e
    }

    #[test]
    fn cold_start_converges_toward_weighted_average() {
        let mut cfg = FusionConfig::default();
        cfg.initial_covariance = 100.0;
        cfg.min_sensors_required = 2;
        let mut engine = engine_with(cfg);

        let mut now = Instant::now();
        let mut now_wall = Utc::now();
        for _ in 0..100 {
            engine
                .ingest(Reading::new("gps-1", SensorKind::Gps, Vec3::new(10.0, 0.0, 0.0), Vec3::zero(), diag3(Vec3::new(1.0, 1.0, 1.0))))
                .unwrap();
            engine
                .ingest(Reading::new("ins-1", SensorKind::Ins, Vec3::new(10.2, 0.0, 0.0), Vec3::zero(), diag3(Vec3::new(4.0, 4.0, 4.0))))
                .unwrap();
            engine.run_cycle(now, now_wall);
            now += Duration::from_millis(50);
            now_wall += chrono::Duration::milliseconds(50);
        }

        let state = engine.state();
        assert!((state.position.x - 10.05).abs() < 0.5, "got {}", state.position.x);
        assert!(state.confidence > 0.3);
        assert!(state.converged);
    }

    #[test]
    fn spike_reading_is_rejected_by_anomaly_check() {
        let mut cfg = FusionConfig::default();
        cfg.min_sensors_required = 1;
        let mut engine = engine_with(cfg);
        let mut now = Instant::now();
        let mut now_wall = Utc::now();

        // Warm up so confidence clears the 0.1 anomaly-detector floor.
        for _ in 0..10 {
            engine
                .ingest(Reading::new("gps-1", SensorKind::Gps, Vec3::new(10.0, 0.0, 0.0), Vec3::zero(), diag3(Vec3::new(1.0, 1.0, 1.0))))
                .unwrap();
            engine.run_cycle(now, now_wall);
            now += Duration::from_millis(50);
            now_wall += chrono::Duration::milliseconds(50);
        }

        let before = engine.state().position;
        let anomaly = engine
            .ingest(Reading::new("gps-1", SensorKind::Gps, Vec3::new(1000.0, 0.0, 0.0), Vec3::zero(), diag3(Vec3::new(1.0, 1.0, 1.0))))
            .unwrap();
        assert!(anomaly.is_some());
        assert!(anomaly.unwrap().severity > 0.8);

        engine.run_cycle(now, now_wall);
        let after = engine.state().position;
        assert!(magnitude(sub(after, before)) < 1.0);
    }

    #[test]
    fn invalid_readings_never_move_state_past_pure_prediction() {
        let cfg = FusionConfig::default();
        let mut engine = engine_with(cfg);
        let mut now = Instant::now();
        let mut now_wall = Utc::now();
        engine.state.velocity = Vec3::new(1.0, 0.0, 0.0);

        let mut predicted = engine.state().clone();
        for _ in 0..5 {
            let mut reading = Reading::new("gps-1", SensorKind::Gps, Vec3::new(999.0, 999.0, 999.0), Vec3::zero(), diag3(Vec3::new(1.0, 1.0, 1.0)));
            reading.valid = false;
            engine.ingest(reading).unwrap();
            engine.run_cycle(now, now_wall);

            let dt = 0.05;
            predicted.position = add(predicted.position, scale(predicted.velocity, dt));
            now += Duration::from_millis(50);
            now_wall += chrono::Duration::milliseconds(50);
        }

        assert!((engine.state().position.x - predicted.position.x).abs() < 1e-6);
    }

    #[test]
    fn gps_is_primary_when_fresh_alongside_ins() {
        let mut cfg = FusionConfig::default();
        cfg.min_sensors_required = 2;
        let mut engine = engine_with(cfg);
        let now = Instant::now();
        let now_wall = Utc::now();

        engine
            .ingest(Reading::new("gps-1", SensorKind::Gps, Vec3::new(10.0, 0.0, 0.0), Vec3::zero(), diag3(Vec3::new(1.0, 1.0, 1.0))))
            .unwrap();
        engine
            .ingest(Reading::new("ins-1", SensorKind::Ins, Vec3::new(10.2, 0.0, 0.0), Vec3::zero(), diag3(Vec3::new(4.0, 4.0, 4.0))))
            .unwrap();
        engine.run_cycle(now, now_wall);

        assert_eq!(engine.state().primary_sensor.as_deref(), Some("gps-1"));
    }

    #[test]
    fn gps_dropout_fails_over_to_fresh_ins() {
        let mut cfg = FusionConfig::default();
        cfg.min_sensors_required = 2;
        let mut engine = engine_with(cfg);
        let mut now = Instant::now();
        let mut now_wall = Utc::now();

        engine
            .ingest(Reading::new("gps-1", SensorKind::Gps, Vec3::new(10.0, 0.0, 0.0), Vec3::zero(), diag3(Vec3::new(1.0, 1.0, 1.0))))
            .unwrap();
        engine
            .ingest(Reading::new("ins-1", SensorKind::Ins, Vec3::new(10.2, 0.0, 0.0), Vec3::zero(), diag3(Vec3::new(4.0, 4.0, 4.0))))
            .unwrap();
        engine.run_cycle(now, now_wall);
        assert_eq!(engine.state().primary_sensor.as_deref(), Some("gps-1"));

        now += Duration::from_millis(50);
        now_wall += chrono::Duration::milliseconds(50);
        // Only INS arrives this cycle; GPS has gone silent.
        engine
            .ingest(Reading::new("ins-1", SensorKind::Ins, Vec3::new(10.3, 0.0, 0.0), Vec3::zero(), diag3(Vec3::new(4.0, 4.0, 4.0))))
            .unwrap();
        let events = engine.run_cycle(now, now_wall);

        let failover = events.iter().find_map(|e| match e {
            FusionEvent::Failover { from, to } => Some((from.clone(), to.clone())),
            _ => None,
        });
        assert_eq!(failover, Some((Some("gps-1".to_string()), "ins-1".to_string())));
    }

    #[test]
    fn outlier_gate_is_symmetric() {
        let mut cfg = FusionConfig::default();
        cfg.min_sensors_required = 1;
        let mut engine = engine_with(cfg);
        let r_pos = (1.0, 1.0, 1.0);

        let innov_a = Vec3::new(5.0, 0.0, 0.0);
        let innov_b = Vec3::new(-5.0, 0.0, 0.0);
        let d2_a = innov_a.x * innov_a.x / r_pos.0;
        let d2_b = innov_b.x * innov_b.x / r_pos.0;
        assert_eq!(d2_a, d2_b);
        let _ = &mut engine; // silence unused-mut in case of future assertions
    }
}
