//! Payload controller (§4.10)
//!
//! One bounded command channel per payload. A worker owns the
//! payload's live state and applies commands sequentially, honoring
//! expiry before dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, warn};

use crate::error::{GuidanceError, Result};
use crate::math::{heading_to_quaternion, magnitude, normalize, scale, sub, Vec3};
use crate::models::{Command, CommandType, Payload, PayloadStatus};

const QUEUE_CAPACITY: usize = 100;

type StatusCallback = Arc<dyn Fn(Payload) + Send + Sync>;

/// Applies one command to `payload` in place. Pure and synchronous so
/// it is trivially unit-testable without the channel plumbing.
pub fn apply(payload: &mut Payload, command: &Command) -> Result<()> {
    match command.command_type {
        CommandType::NavigateTo => {
            let target = parse_vec3(&command.parameters, "target")?;
            let direction = normalize(sub(target, payload.position));
            let distance = magnitude(sub(target, payload.position));
            let speed = payload.capabilities.max_speed.min(distance / 10.0);
            payload.velocity = scale(direction, speed);
            payload.status = PayloadStatus::Navigating;
        }
        CommandType::Hold => {
            payload.velocity = Vec3::zero();
            payload.acceleration = Vec3::zero();
            payload.status = PayloadStatus::Holding;
        }
        CommandType::Return => {
            let target = Vec3::new(0.0, 0.0, payload.capabilities.min_altitude);
            let direction = normalize(sub(target, payload.position));
            let distance = magnitude(sub(target, payload.position));
            let speed = payload.capabilities.max_speed.min(distance / 10.0);
            payload.velocity = scale(direction, speed);
            payload.status = PayloadStatus::Navigating;
        }
        CommandType::Arm => payload.armed = true,
        CommandType::Disarm => payload.armed = false,
        CommandType::Abort => {
            payload.velocity = Vec3::zero();
            payload.armed = false;
            payload.status = PayloadStatus::Aborted;
        }
        CommandType::SetSpeed => {
            let speed = parse_f64(&command.parameters, "speed")?;
            payload.velocity = scale(normalize(payload.velocity), speed);
        }
        CommandType::SetAltitude => {
            let target_z = parse_f64(&command.parameters, "altitude")?
                .clamp(payload.capabilities.min_altitude, payload.capabilities.max_altitude);
            let delta = target_z - payload.position.z;
            payload.velocity.z = delta.signum() * delta.abs().min(payload.capabilities.max_speed);
        }
        CommandType::SetHeading => {
            let yaw = parse_f64(&command.parameters, "yaw")?;
            payload.orientation = heading_to_quaternion(yaw);
        }
        CommandType::EngageStealth => {
            if !payload.capabilities.stealth_capable {
                return Err(GuidanceError::NotCapable(payload.id.clone()));
            }
            payload.velocity = scale(payload.velocity, 0.5);
            payload.status = PayloadStatus::Stealth;
        }
        CommandType::DisengageStealth => {
            if payload.status == PayloadStatus::Stealth {
                payload.status = PayloadStatus::Active;
            }
        }
        CommandType::EmergencyStop => {
            payload.velocity = Vec3::zero();
            payload.acceleration = Vec3::zero();
            payload.armed = false;
            payload.status = PayloadStatus::EmergencyStop;
        }
    }
    payload.last_update = Utc::now();
    Ok(())
}

fn parse_vec3(params: &serde_json::Map<String, Value>, key: &str) -> Result<Vec3> {
    let arr = params.get(key).and_then(|v| v.as_array()).ok_or_else(|| GuidanceError::InvalidParameter(key.to_string()))?;
    if arr.len() != 3 {
        return Err(GuidanceError::InvalidParameter(key.to_string()));
    }
    let get = |i: usize| arr[i].as_f64().ok_or_else(|| GuidanceError::InvalidParameter(key.to_string()));
    Ok(Vec3::new(get(0)?, get(1)?, get(2)?))
}

fn parse_f64(params: &serde_json::Map<String, Value>, key: &str) -> Result<f64> {
    params.get(key).and_then(|v| v.as_f64()).ok_or_else(|| GuidanceError::InvalidParameter(key.to_string()))
}

/// Owns one payload's bounded command channel and worker task.
pub struct PayloadController {
    payload_id: String,
    tx: mpsc::Sender<Command>,
}

impl PayloadController {
    pub fn spawn(
        payload: Payload,
        shared: Arc<RwLock<Payload>>,
        status_callbacks: Arc<RwLock<Vec<StatusCallback>>>,
        mut cancel: watch::Receiver<bool>,
    ) -> Self {
        let payload_id = payload.id.clone();
        let (tx, mut rx) = mpsc::channel::<Command>(QUEUE_CAPACITY);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(command) = rx.recv() => {
                        if Utc::now() > command.expires_at {
                            debug!(payload_id = %command.payload_id, "command expired before execution");
                            continue;
                        }
                        let mut guard = shared.write().await;
                        match apply(&mut guard, &command) {
                            Ok(()) => {
                                let snapshot = guard.clone();
                                drop(guard);
                                for cb in status_callbacks.read().await.iter() {
                                    let snapshot = snapshot.clone();
                                    let cb = cb.clone();
                                    tokio::spawn(async move { cb(snapshot) });
                                }
                            }
                            Err(e) => warn!(error = %e, "command application failed"),
                        }
                    }
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            break;
                        }
                    }
                    else => break,
                }
            }
        });

        Self { payload_id, tx }
    }

    pub fn payload_id(&self) -> &str {
        &self.payload_id
    }

    pub async fn enqueue(&self, command: Command) -> Result<()> {
        self.tx.try_send(command).map_err(|_| GuidanceError::QueueFull(self.payload_id.clone()))
    }
}

/// Multi-payload registry of controllers, one bounded channel each.
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: HashMap<String, PayloadController>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, controller: PayloadController) {
        self.controllers.insert(controller.payload_id().to_string(), controller);
    }

    pub async fn dispatch(&self, payload_id: &str, command: Command) -> Result<()> {
        let controller = self
            .controllers
            .get(payload_id)
            .ok_or_else(|| GuidanceError::UnknownPayload(payload_id.to_string()))?;
        controller.enqueue(command).await
    }
}
