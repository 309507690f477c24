//! Sensor fusion subsystem (§4.3)
//!
//! [`engine`] holds the synchronous predict/update cycle; this module
//! wraps it in a single `RwLock` and a background loop mirroring the
//! teacher's `run_sensor_fusion_loop`, turning engine events into
//! callback dispatch off the critical path (§5, §9).

pub mod anomaly;
pub mod engine;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::config::FusionConfig;
use crate::error::Result;
use crate::models::{AnomalyReport, CalibrationData, FusedState, Reading, SensorKind};

pub use engine::{FusionEngine, FusionEvent};

type StateCallback = Arc<dyn Fn(FusedState) + Send + Sync>;
type AnomalyCallback = Arc<dyn Fn(AnomalyReport) + Send + Sync>;
type FailoverCallback = Arc<dyn Fn(Option<String>, String) + Send + Sync>;
type SensorFailureCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    state_update: Vec<StateCallback>,
    anomaly: Vec<AnomalyCallback>,
    failover: Vec<FailoverCallback>,
    sensor_failure: Vec<SensorFailureCallback>,
}

/// Async handle around the fusion engine. Cloning is cheap: all clones
/// share the same engine and callback registry.
#[derive(Clone)]
pub struct FusionSystem {
    engine: Arc<RwLock<FusionEngine>>,
    callbacks: Arc<RwLock<Callbacks>>,
    cfg: FusionConfig,
}

impl FusionSystem {
    pub fn new(cfg: FusionConfig) -> Self {
        Self {
            engine: Arc::new(RwLock::new(FusionEngine::new(cfg.clone()))),
            callbacks: Arc::new(RwLock::new(Callbacks::default())),
            cfg,
        }
    }

    pub async fn register_sensor(
        &self,
        sensor_id: impl Into<String>,
        kind: SensorKind,
        calibration: Option<CalibrationData>,
    ) -> Result<()> {
        self.engine.write().await.register_sensor(sensor_id, kind, calibration)
    }

    pub async fn unregister_sensor(&self, sensor_id: &str) {
        self.engine.write().await.unregister_sensor(sensor_id);
    }

    pub async fn update_calibration(&self, sensor_id: &str, data: CalibrationData) -> Result<()> {
        self.engine.write().await.update_calibration(sensor_id, data)
    }

    pub async fn ingest(&self, reading: Reading) -> Result<()> {
        let anomaly = self.engine.write().await.ingest(reading)?;
        if let Some(report) = anomaly {
            self.dispatch_anomaly(report).await;
        }
        Ok(())
    }

    pub async fn current_state(&self) -> FusedState {
        self.engine.read().await.state().clone()
    }

    pub async fn on_state_update<F>(&self, f: F)
    where
        F: Fn(FusedState) + Send + Sync + 'static,
    {
        self.callbacks.write().await.state_update.push(Arc::new(f));
    }

    pub async fn on_anomaly<F>(&self, f: F)
    where
        F: Fn(AnomalyReport) + Send + Sync + 'static,
    {
        self.callbacks.write().await.anomaly.push(Arc::new(f));
    }

    pub async fn on_failover<F>(&self, f: F)
    where
        F: Fn(Option<String>, String) + Send + Sync + 'static,
    {
        self.callbacks.write().await.failover.push(Arc::new(f));
    }

    pub async fn on_sensor_failure<F>(&self, f: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.callbacks.write().await.sensor_failure.push(Arc::new(f));
    }

    /// Runs the fusion and health-monitor tickers until `cancel` flips
    /// to `true`, mirroring the teacher's IMU/GPS `tokio::select!` loop.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> Result<()> {
        info!(rate_hz = 1000 / self.cfg.update_rate.as_millis().max(1) as u64, "starting fusion loop");

        let mut fusion_ticker = tokio::time::interval(self.cfg.update_rate);
        let mut health_ticker = tokio::time::interval(self.cfg.health_check_rate);

        loop {
            tokio::select! {
                _ = fusion_ticker.tick() => {
                    let events = {
                        let mut engine = self.engine.write().await;
                        engine.run_cycle(Instant::now(), Utc::now())
                    };
                    self.dispatch(events).await;
                }
                _ = health_ticker.tick() => {
                    let events = {
                        let mut engine = self.engine.write().await;
                        engine.run_health_tick(Utc::now())
                    };
                    self.dispatch(events).await;
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        info!("fusion loop stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn dispatch(&self, events: Vec<FusionEvent>) {
        for event in events {
            match event {
                FusionEvent::StateUpdate(state) => self.dispatch_state(state).await,
                FusionEvent::Anomaly(report) => self.dispatch_anomaly(report).await,
                FusionEvent::Failover { from, to } => {
                    warn!(?from, to = %to, "primary sensor failover");
                    let cbs = self.callbacks.read().await.failover.clone();
                    for cb in cbs {
                        let from = from.clone();
                        let to = to.clone();
                        tokio::spawn(async move { cb(from, to) });
                    }
                }
                FusionEvent::SensorFailure(sensor_id) => {
                    warn!(sensor_id = %sensor_id, "sensor marked failed");
                    let cbs = self.callbacks.read().await.sensor_failure.clone();
                    for cb in cbs {
                        let sensor_id = sensor_id.clone();
                        tokio::spawn(async move { cb(sensor_id) });
                    }
                }
                FusionEvent::OutlierRejected(sensor_id) => {
                    debug!(sensor_id = %sensor_id, "reading rejected by outlier gate");
                }
            }
        }
    }

    async fn dispatch_state(&self, state: FusedState) {
        let cbs = self.callbacks.read().await.state_update.clone();
        for cb in cbs {
            let state = state.clone();
            tokio::spawn(async move { cb(state) });
        }
    }

    async fn dispatch_anomaly(&self, report: AnomalyReport) {
        let cbs = self.callbacks.read().await.anomaly.clone();
        for cb in cbs {
            let report = report.clone();
            tokio::spawn(async move { cb(report) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::diag3;
    use crate::math::Vec3;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn ingest_and_current_state_roundtrip() {
        let system = FusionSystem::new(FusionConfig::default());
        system.register_sensor("gps-1", SensorKind::Gps, None).await.unwrap();
        system
            .ingest(Reading::new("gps-1", SensorKind::Gps, Vec3::new(1.0, 2.0, 3.0), Vec3::zero(), diag3(Vec3::new(1.0, 1.0, 1.0))))
            .await
            .unwrap();
        let state = system.current_state().await;
        assert_eq!(state.position, Vec3::zero()); // cycle hasn't run yet
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let system = FusionSystem::new(FusionConfig::default());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let system = system.clone();
            async move { system.run(rx).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn state_update_callback_fires() {
        let system = FusionSystem::new(FusionConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        system.on_state_update(move |_| { counter_clone.fetch_add(1, Ordering::SeqCst); }).await;

        let events = vec![FusionEvent::StateUpdate(FusedState::initial(100.0))];
        system.dispatch(events).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
