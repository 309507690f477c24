//! Guidance orchestrator (§4.8)
//!
//! Owns the lifecycle of every other subsystem. Generalizes the
//! teacher's `main.rs` task-spawning and `tokio::select!` shutdown
//! race into a reusable `start`/`stop` pair.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bridge::subjects::{egress, ingress};
use crate::bridge::EventBridge;
use crate::config::Config;
use crate::control::ControllerRegistry;
use crate::error::{GuidanceError, Result};
use crate::fusion::FusionSystem;
use crate::math::{magnitude, normalize, sub, Vec3};
use crate::mission::MissionStore;
use crate::models::{
    ECMThreat, Mission, MissionStatus, MissionType, Payload, TargetingMetrics, Trajectory, WeatherCondition,
};
use crate::planner::{self, PlannerInput};

use super::replan::{ReplanReason, ReplanScheduler};
use super::targeting::{self, TargetingInput};

struct Context {
    fusion: FusionSystem,
    bridge: EventBridge,
    mission_store: Arc<RwLock<MissionStore>>,
    controllers: Arc<RwLock<ControllerRegistry>>,
    replan: Arc<Mutex<ReplanScheduler>>,
    weather: Arc<RwLock<WeatherCondition>>,
    ecm_threats: Arc<RwLock<Vec<ECMThreat>>>,
}

/// Top-level handle. One per running core; `start`/`stop` are the only
/// lifecycle transitions.
pub struct GuidanceOrchestrator {
    cfg: Config,
    ctx: Context,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    running: Arc<std::sync::atomic::AtomicBool>,
}

impl GuidanceOrchestrator {
    pub fn new(cfg: Config) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = Context {
            fusion: FusionSystem::new(cfg.fusion.clone()),
            bridge: EventBridge::new(cfg.bridge.clone()),
            mission_store: Arc::new(RwLock::new(MissionStore::new())),
            controllers: Arc::new(RwLock::new(ControllerRegistry::new())),
            replan: Arc::new(Mutex::new(ReplanScheduler::new(cfg.guidance.replan_interval))),
            weather: Arc::new(RwLock::new(WeatherCondition::default())),
            ecm_threats: Arc::new(RwLock::new(Vec::new())),
        };
        Self {
            cfg,
            ctx,
            cancel_tx,
            cancel_rx,
            running: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn fusion(&self) -> &FusionSystem {
        &self.ctx.fusion
    }

    pub fn bridge(&self) -> &EventBridge {
        &self.ctx.bridge
    }

    /// Initializes the bridge and fusion loops (warn-and-continue on
    /// either failing) and launches the periodic background tasks.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Err(GuidanceError::AlreadyRunning);
        }
        info!("starting guidance core");

        let bridge = self.ctx.bridge.clone();
        let bridge_cancel = self.cancel_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge.run(bridge_cancel).await {
                warn!(error = %e, "bridge loop exited");
            }
        });

        let fusion = self.ctx.fusion.clone();
        let fusion_cancel = self.cancel_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = fusion.run(fusion_cancel).await {
                warn!(error = %e, "fusion loop exited");
            }
        });

        self.subscribe_ingress().await;

        self.spawn_telemetry_liveness();
        self.spawn_mission_monitor();
        self.spawn_trajectory_optimizer();

        Ok(())
    }

    /// Registers the ingress callbacks the bridge dispatches inbound
    /// messages through (§4.9, §6). Every handler decodes off the read
    /// loop's spawned task and mutates its subsystem in a further
    /// spawned task, so a slow write lock never stalls message decode.
    async fn subscribe_ingress(&self) {
        let store = self.ctx.mission_store.clone();
        self.ctx
            .bridge
            .subscribe(ingress::TELEMETRY_PREFIX, move |payload| {
                let store = store.clone();
                match serde_json::from_value::<Payload>(payload) {
                    Ok(p) => {
                        tokio::spawn(async move {
                            store.write().await.update_payload_state(p);
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to decode telemetry payload"),
                }
            })
            .await;

        let weather = self.ctx.weather.clone();
        self.ctx
            .bridge
            .subscribe(ingress::WEATHER, move |payload| {
                let weather = weather.clone();
                match serde_json::from_value::<WeatherCondition>(payload) {
                    Ok(w) => {
                        tokio::spawn(async move {
                            *weather.write().await = w;
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to decode weather update"),
                }
            })
            .await;

        let ecm_threats = self.ctx.ecm_threats.clone();
        self.ctx
            .bridge
            .subscribe(ingress::THREATS, move |payload| {
                let ecm_threats = ecm_threats.clone();
                match serde_json::from_value::<ECMThreat>(payload) {
                    Ok(threat) => {
                        tokio::spawn(async move {
                            let mut threats = ecm_threats.write().await;
                            threats.retain(|t| t.id != threat.id);
                            threats.push(threat);
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to decode threat"),
                }
            })
            .await;

        let store = self.ctx.mission_store.clone();
        self.ctx
            .bridge
            .subscribe(ingress::MISSIONS, move |payload| {
                let store = store.clone();
                match serde_json::from_value::<Mission>(payload) {
                    Ok(incoming) => {
                        tokio::spawn(async move {
                            let mut store = store.write().await;
                            if store.get_mission(&incoming.id).is_none() {
                                warn!(mission_id = %incoming.id, "ignoring update for unknown mission");
                                return;
                            }
                            // Pending/completed transitions are derived internally from
                            // payload telemetry; an external push can only abort or
                            // confirm activation of a mission the core already knows.
                            match incoming.status {
                                MissionStatus::Aborted => {
                                    let reason = incoming.abort_reason.unwrap_or_else(|| "external abort".to_string());
                                    let _ = store.abort_mission(&incoming.id, reason);
                                }
                                MissionStatus::Active => {
                                    let _ = store.activate_mission(&incoming.id);
                                }
                                _ => {}
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to decode mission update"),
                }
            })
            .await;
    }

    /// Cancels all background loops, then shuts the bridge and fusion
    /// down with a bounded drain.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(GuidanceError::NotRunning);
        }
        info!("stopping guidance core");
        let _ = self.cancel_tx.send(true);

        tokio::time::sleep(Duration::from_millis(50)).await;
        self.ctx.bridge.stop().await;
        Ok(())
    }

    pub async fn register_payload(&self, payload: Payload) {
        self.ctx.mission_store.write().await.insert_payload(payload);
    }

    pub async fn create_mission(&self, mission: Mission) -> Result<Uuid> {
        let store_read = self.ctx.mission_store.read().await;
        let payload = store_read
            .payload(&mission.payload_id)
            .cloned()
            .ok_or_else(|| GuidanceError::UnknownPayload(mission.payload_id.clone()))?;
        drop(store_read);

        let mut store = self.ctx.mission_store.write().await;
        let id = store.create_mission(mission, &payload)?;
        let created = store.get_mission(&id).cloned();
        drop(store);

        if let Some(mission) = created {
            publish_trajectory(&self.ctx.bridge, &mission, "created").await;
            publish_mission_update(&self.ctx.bridge, &mission).await;
        }
        Ok(id)
    }

    pub async fn update_payload_state(&self, payload: Payload) -> Result<()> {
        let outcome = self.ctx.mission_store.write().await.update_payload_state(payload);

        for mission_id in outcome.activated.iter().chain(outcome.completed.iter()) {
            self.maybe_replan(*mission_id, ReplanReason::PayloadUpdate).await;
        }
        Ok(())
    }

    pub async fn update_mission_target(&self, id: Uuid, target: crate::math::Vec3) -> Result<()> {
        self.ctx.mission_store.write().await.update_mission_target(&id, target)?;
        self.maybe_replan(id, ReplanReason::TargetUpdate).await;
        Ok(())
    }

    /// Aborts `id`; when `return_to_base` is set, synthesizes a new
    /// high-priority mission from the fused position estimate back to
    /// the aborted mission's start (§4.8, §8 scenario 6).
    pub async fn abort_mission(&self, id: Uuid, reason: impl Into<String>, return_to_base: bool) -> Result<Option<Uuid>> {
        let aborted = self.ctx.mission_store.write().await.abort_mission(&id, reason)?;
        publish_mission_update(&self.ctx.bridge, &aborted).await;

        if !return_to_base {
            return Ok(None);
        }
        let fused = self.ctx.fusion.current_state().await;
        let rtb = Mission {
            id: Uuid::nil(),
            payload_id: aborted.payload_id.clone(),
            mission_type: MissionType::Rtb,
            start: fused.position,
            target: aborted.start,
            priority: aborted.priority + 1,
            stealth_required: true,
            status: MissionStatus::Pending,
            trajectory: None,
            abort_reason: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            completed_at: None,
        };
        let id = self.create_mission(rtb).await?;
        self.ctx.mission_store.write().await.activate_mission(&id)?;
        if let Some(mission) = self.ctx.mission_store.read().await.get_mission(&id).cloned() {
            publish_mission_update(&self.ctx.bridge, &mission).await;
            publish_guidance(
                &self.ctx.bridge,
                &mission.payload_id,
                "return_to_base",
                serde_json::json!({ "target": mission.target }),
                mission.priority,
            )
            .await;
        }
        Ok(Some(id))
    }

    pub async fn targeting_metrics(&self, mission_id: Uuid) -> Result<TargetingMetrics> {
        let store = self.ctx.mission_store.read().await;
        let mission = store.get_mission(&mission_id).ok_or_else(|| GuidanceError::UnknownMission(mission_id.to_string()))?;
        let payload = store.payload(&mission.payload_id).ok_or_else(|| GuidanceError::UnknownPayload(mission.payload_id.clone()))?;
        let weather = self.ctx.weather.read().await;
        let ecm = self.ctx.ecm_threats.read().await;
        let replan = self.ctx.replan.lock().await;

        Ok(targeting::compute(TargetingInput {
            payload,
            mission_id,
            target: mission.target,
            trajectory: mission.trajectory.as_ref(),
            weather: &weather,
            ecm_threats: &ecm,
            stealth_required: mission.stealth_required,
            terminal: &self.cfg.guidance.terminal,
            last_replan_reason: replan.last_reason(&mission_id).map(|r| r.as_str().to_string()),
            replan_count: replan.replan_count(&mission_id),
        }))
    }

    async fn maybe_replan(&self, mission_id: Uuid, reason: ReplanReason) {
        let fired = self.ctx.replan.lock().await.try_fire(mission_id, Instant::now(), reason);
        if !fired {
            return;
        }

        let snapshot = {
            let store = self.ctx.mission_store.read().await;
            let mission = match store.get_mission(&mission_id) {
                Some(m) if m.status == MissionStatus::Active => m.clone(),
                _ => return,
            };
            let payload = match store.payload(&mission.payload_id) {
                Some(p) => p.clone(),
                None => return,
            };
            (mission, payload)
        };
        let (mission, payload) = snapshot;

        let trajectory = match planner::plan(PlannerInput {
            start: payload.position,
            target: mission.target,
            stealth_required: mission.stealth_required,
            capabilities: payload.capabilities.clone(),
            now: chrono::Utc::now(),
        }) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "replan failed");
                return;
            }
        };

        let previous_first = mission.trajectory.as_ref().and_then(|t| t.first_waypoint()).map(|w| w.position);
        let new_first = trajectory.first_waypoint().map(|w| w.position);

        let mut store = self.ctx.mission_store.write().await;
        if store.get_mission(&mission_id).map(|m| m.status) != Some(MissionStatus::Active) {
            return; // stale snapshot, mission no longer active
        }
        let _ = store.set_trajectory(&mission_id, trajectory);
        let updated = store.get_mission(&mission_id).cloned();
        drop(store);

        if let Some(updated) = updated {
            publish_trajectory(&self.ctx.bridge, &updated, "replanned").await;
            if let (Some(prev), Some(new)) = (previous_first, new_first) {
                let offset = magnitude(sub(new, prev));
                if offset > 1.0 {
                    publish_deviation(&self.ctx.bridge, &updated, offset).await;
                }
            }
        }
    }

    fn spawn_telemetry_liveness(&self) {
        let store = self.ctx.mission_store.clone();
        let bridge = self.ctx.bridge.clone();
        let mut cancel = self.cancel_rx.clone();
        let interval = self.cfg.guidance.telemetry_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let store = store.read().await;
                        let now = chrono::Utc::now();
                        let payloads: Vec<Payload> = store.payloads().cloned().collect();
                        drop(store);

                        for payload in &payloads {
                            let age = now.signed_duration_since(payload.last_update);
                            if age > chrono::Duration::seconds(10) {
                                warn!(payload_id = %payload.id, age_s = age.num_seconds(), "telemetry stale");
                            }
                            if payload.fuel < 10.0 {
                                warn!(payload_id = %payload.id, fuel = payload.fuel, "low fuel");
                            }
                            if payload.battery < 10.0 {
                                warn!(payload_id = %payload.id, battery = payload.battery, "low battery");
                            }
                            publish_payload_status(&bridge, payload).await;
                        }
                    }
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Periodic sweep that reconciles every live mission against its
    /// payload's latest telemetry: re-derives lifecycle transitions,
    /// estimates time-to-arrival, checks ECM threat proximity, and nudges
    /// a trajectory away from a threat that has closed within its effect
    /// radius (§4.8, §4.9).
    fn spawn_mission_monitor(&self) {
        let store = self.ctx.mission_store.clone();
        let ecm_threats = self.ctx.ecm_threats.clone();
        let bridge = self.ctx.bridge.clone();
        let mut cancel = self.cancel_rx.clone();
        let interval = self.cfg.guidance.mission_monitor_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut touched: Vec<Uuid> = Vec::new();
                        {
                            let mut guard = store.write().await;
                            let payload_ids: Vec<String> = guard.payloads().map(|p| p.id.clone()).collect();
                            for payload_id in payload_ids {
                                if let Some(payload) = guard.payload(&payload_id).cloned() {
                                    let outcome = guard.update_payload_state(payload);
                                    touched.extend(outcome.activated);
                                    touched.extend(outcome.completed);
                                }
                            }
                        }

                        let touched_missions: Vec<Mission> = {
                            let guard = store.read().await;
                            touched.iter().filter_map(|id| guard.get_mission(id).cloned()).collect()
                        };
                        for mission in &touched_missions {
                            publish_mission_update(&bridge, mission).await;
                        }

                        let active: Vec<Mission> = store.read().await.active_missions().cloned().collect();
                        let threats = ecm_threats.read().await.clone();

                        for mission in &active {
                            let payload = store.read().await.payload(&mission.payload_id).cloned();
                            let Some(payload) = payload else { continue };

                            let remaining = magnitude(sub(mission.target, payload.position));
                            let speed = magnitude(payload.velocity).max(1.0);
                            let eta_s = remaining / speed;
                            publish_arrival(&bridge, mission, eta_s, remaining).await;

                            for threat in threats.iter().filter(|t| t.active) {
                                let distance = magnitude(sub(payload.position, threat.position));
                                if distance > threat.effect_radius {
                                    continue;
                                }
                                publish_threat_alert(&bridge, mission, threat, distance).await;

                                let Some(mut trajectory) = mission.trajectory.clone() else { continue };
                                let Some(first) = trajectory.waypoints.first_mut() else { continue };
                                let away = normalize(sub(payload.position, threat.position));
                                let nudge = crate::math::scale(away, threat.effect_radius - distance + 50.0);
                                first.position = add(first.position, nudge);

                                if store.write().await.set_trajectory(&mission.id, trajectory).is_ok() {
                                    publish_evasion(&bridge, mission, threat, nudge).await;
                                }
                            }
                        }
                    }
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn spawn_trajectory_optimizer(&self) {
        let store = self.ctx.mission_store.clone();
        let mut cancel = self.cancel_rx.clone();
        let interval = self.cfg.guidance.trajectory_optimizer_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut store = store.write().await;
                        let ids = store.active_mission_ids_mut();
                        for id in ids {
                            store.touch_mission(&id);
                        }
                    }
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Every `publish_*` helper below swallows `NotConnected`/transport errors
/// with a `warn!` — egress is best-effort and must never block the caller
/// that triggered it (§4.9).
async fn publish_trajectory(bridge: &EventBridge, mission: &Mission, reason: &str) {
    if let Some(trajectory) = &mission.trajectory {
        let payload = serde_json::json!({
            "mission_id": mission.id,
            "payload_id": mission.payload_id,
            "reason": reason,
            "trajectory": trajectory,
        });
        if let Err(e) = bridge.publish(egress::TRAJECTORY, payload).await {
            warn!(error = %e, mission_id = %mission.id, "failed to publish trajectory");
        }
    }
}

async fn publish_mission_update(bridge: &EventBridge, mission: &Mission) {
    if let Err(e) = bridge.publish(egress::MISSION, serde_json::to_value(mission).unwrap_or_default()).await {
        warn!(error = %e, mission_id = %mission.id, "failed to publish mission update");
    }
}

async fn publish_guidance(bridge: &EventBridge, payload_id: &str, action: &str, detail: serde_json::Value, priority: u32) {
    let payload = serde_json::json!({
        "payload_id": payload_id,
        "action": action,
        "priority": priority,
        "detail": detail,
    });
    if let Err(e) = bridge.publish(egress::GUIDANCE, payload).await {
        warn!(error = %e, payload_id, "failed to publish guidance update");
    }
}

async fn publish_payload_status(bridge: &EventBridge, payload: &Payload) {
    let value = serde_json::json!({
        "payload_id": payload.id,
        "status": payload.status,
        "position": payload.position,
        "velocity": payload.velocity,
        "fuel": payload.fuel,
        "battery": payload.battery,
        "health": payload.health,
    });
    if let Err(e) = bridge.publish(egress::PAYLOAD_STATUS, value).await {
        warn!(error = %e, payload_id = %payload.id, "failed to publish payload status");
    }
}

async fn publish_arrival(bridge: &EventBridge, mission: &Mission, eta_s: f64, distance_remaining: f64) {
    let payload = serde_json::json!({
        "mission_id": mission.id,
        "payload_id": mission.payload_id,
        "eta_s": eta_s,
        "distance_remaining_m": distance_remaining,
    });
    if let Err(e) = bridge.publish(egress::ARRIVAL, payload).await {
        warn!(error = %e, mission_id = %mission.id, "failed to publish arrival estimate");
    }
}

async fn publish_threat_alert(bridge: &EventBridge, mission: &Mission, threat: &ECMThreat, distance: f64) {
    let payload = serde_json::json!({
        "mission_id": mission.id,
        "payload_id": mission.payload_id,
        "threat_id": threat.id,
        "kind": threat.kind,
        "distance_m": distance,
        "effect_radius_m": threat.effect_radius,
    });
    if let Err(e) = bridge.publish(egress::THREAT_ALERT, payload).await {
        warn!(error = %e, mission_id = %mission.id, "failed to publish threat alert");
    }
}

async fn publish_deviation(bridge: &EventBridge, mission: &Mission, offset_m: f64) {
    let payload = serde_json::json!({
        "mission_id": mission.id,
        "payload_id": mission.payload_id,
        "offset_m": offset_m,
    });
    if let Err(e) = bridge.publish(egress::DEVIATION, payload).await {
        warn!(error = %e, mission_id = %mission.id, "failed to publish deviation");
    }
}

async fn publish_evasion(bridge: &EventBridge, mission: &Mission, threat: &ECMThreat, nudge: Vec3) {
    let payload = serde_json::json!({
        "mission_id": mission.id,
        "payload_id": mission.payload_id,
        "threat_id": threat.id,
        "nudge": nudge,
    });
    if let Err(e) = bridge.publish(egress::EVASION, payload).await {
        warn!(error = %e, mission_id = %mission.id, "failed to publish evasion maneuver");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vec3;
    use crate::models::PayloadCapabilities;

    fn test_orchestrator() -> GuidanceOrchestrator {
        GuidanceOrchestrator::new(Config::default())
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let orch = test_orchestrator();
        orch.start().await.unwrap();
        let err = orch.start().await.unwrap_err();
        assert!(matches!(err, GuidanceError::AlreadyRunning));
        orch.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_fails() {
        let orch = test_orchestrator();
        let err = orch.stop().await.unwrap_err();
        assert!(matches!(err, GuidanceError::NotRunning));
    }

    #[tokio::test]
    async fn abort_with_rtb_synthesizes_new_mission() {
        let orch = test_orchestrator();
        let payload = Payload::new("p1", "strike", PayloadCapabilities::default());
        orch.register_payload(payload).await;

        let mission = Mission {
            id: Uuid::nil(),
            payload_id: "p1".to_string(),
            mission_type: MissionType::Standard,
            start: Vec3::new(10.0, 0.0, 0.0),
            target: Vec3::new(1000.0, 0.0, 0.0),
            priority: 1,
            stealth_required: false,
            status: MissionStatus::Pending,
            trajectory: None,
            abort_reason: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            completed_at: None,
        };
        let id = orch.create_mission(mission).await.unwrap();
        let rtb_id = orch.abort_mission(id, "test abort", true).await.unwrap();
        assert!(rtb_id.is_some());

        let store = orch.ctx.mission_store.read().await;
        let rtb_mission = store.get_mission(&rtb_id.unwrap()).unwrap();
        assert_eq!(rtb_mission.priority, 2);
        assert!(rtb_mission.stealth_required);
        assert_eq!(rtb_mission.status, MissionStatus::Active);
        assert_eq!(rtb_mission.mission_type, MissionType::Rtb);
        assert_eq!(rtb_mission.target, Vec3::new(10.0, 0.0, 0.0));
    }

    #[tokio::test]
    async fn abort_without_rtb_returns_none() {
        let orch = test_orchestrator();
        let payload = Payload::new("p1", "strike", PayloadCapabilities::default());
        orch.register_payload(payload).await;
        let mission = Mission {
            id: Uuid::nil(),
            payload_id: "p1".to_string(),
            mission_type: MissionType::Standard,
            start: Vec3::zero(),
            target: Vec3::new(500.0, 0.0, 0.0),
            priority: 1,
            stealth_required: false,
            status: MissionStatus::Pending,
            trajectory: None,
            abort_reason: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            completed_at: None,
        };
        let id = orch.create_mission(mission).await.unwrap();
        let rtb_id = orch.abort_mission(id, "test abort", false).await.unwrap();
        assert!(rtb_id.is_none());
    }
}
