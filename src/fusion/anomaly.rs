//! Anomaly detection (§4.3)
//!
//! Runs once per ingested reading, before it is stored for the next
//! fusion cycle, classifying it against the engine's current best
//! estimate. Findings are appended to a bounded ring.

use std::collections::VecDeque;

use chrono::Utc;
use uuid::Uuid;

use crate::config::FusionConfig;
use crate::math::{magnitude, sub, Vec3};
use crate::models::{AnomalyKind, AnomalyReport, Reading};

pub struct AnomalyDetector {
    ring: VecDeque<AnomalyReport>,
    capacity: usize,
}

impl AnomalyDetector {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Checks `reading` against `expected_position`/`trace_pos` (the
    /// engine's current estimate and position-covariance trace). Flips
    /// `reading.valid` to `false` on a severe spike. Only active once
    /// `fused_confidence >= 0.1`.
    pub fn check(
        &mut self,
        reading: &mut Reading,
        expected_position: Vec3,
        trace_pos: f64,
        fused_confidence: f64,
        cfg: &FusionConfig,
    ) -> Option<AnomalyReport> {
        if fused_confidence < 0.1 {
            return None;
        }
        let sqrt_trace = trace_pos.max(0.0).sqrt();

        let dist = magnitude(sub(reading.position, expected_position));
        let spike_threshold = cfg.anomaly_threshold * sqrt_trace;
        if spike_threshold > 0.0 && dist > spike_threshold {
            let severity = ((dist - spike_threshold) / spike_threshold).min(1.0);
            if severity > 0.8 {
                reading.valid = false;
            }
            let report = self.record(reading, AnomalyKind::Spike, severity, expected_position);
            return Some(report);
        }

        let cov_trace = reading.covariance[(0, 0)] + reading.covariance[(1, 1)] + reading.covariance[(2, 2)];
        let noise_threshold = 10.0 * sqrt_trace;
        if noise_threshold > 0.0 && cov_trace > noise_threshold {
            let report = self.record(reading, AnomalyKind::Noise, 0.5, expected_position);
            return Some(report);
        }

        None
    }

    fn record(&mut self, reading: &Reading, kind: AnomalyKind, severity: f64, expected: Vec3) -> AnomalyReport {
        let report = AnomalyReport {
            id: Uuid::new_v4(),
            sensor_id: reading.sensor_id.clone(),
            kind,
            severity,
            expected,
            actual: reading.position,
            timestamp: Utc::now(),
            reading: reading.clone(),
        };
        if self.ring.len() >= self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(report.clone());
        report
    }

    pub fn history(&self) -> &VecDeque<AnomalyReport> {
        &self.ring
    }
}
