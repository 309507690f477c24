//! Mission store (§4.4)
//!
//! Owns every `Mission` and the live `Payload` state it is measured
//! against. Trajectory planning is delegated to [`crate::planner`];
//! the store only decides *when* a mission's lifecycle advances.

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{GuidanceError, Result};
use crate::math::{magnitude, sub};
use crate::models::{Mission, MissionStatus, Payload, MISSION_COMPLETION_RADIUS_M};
use crate::planner::{self, PlannerInput};

/// Outcome of a payload-state update, used by the orchestrator to
/// decide whether a replan should fire (§4.6).
#[derive(Debug, Clone)]
pub struct PayloadUpdateOutcome {
    pub activated: Vec<Uuid>,
    pub completed: Vec<Uuid>,
}

#[derive(Default)]
pub struct MissionStore {
    missions: HashMap<Uuid, Mission>,
    payloads: HashMap<String, Payload>,
}

impl MissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `mission`, planning its initial trajectory against
    /// `payload`'s capabilities. Generates an ID if absent.
    pub fn create_mission(&mut self, mut mission: Mission, payload: &Payload) -> Result<Uuid> {
        if mission.id.is_nil() {
            mission.id = Uuid::new_v4();
        }
        let now = Utc::now();
        mission.status = MissionStatus::Pending;
        mission.created_at = now;
        mission.updated_at = now;
        mission.completed_at = None;

        let trajectory = planner::plan(PlannerInput {
            start: mission.start,
            target: mission.target,
            stealth_required: mission.stealth_required,
            capabilities: payload.capabilities.clone(),
            now,
        })?;
        mission.trajectory = Some(trajectory);

        let id = mission.id;
        self.missions.insert(id, mission);
        Ok(id)
    }

    pub fn get_mission(&self, id: &Uuid) -> Option<&Mission> {
        self.missions.get(id)
    }

    pub fn missions_for_payload(&self, payload_id: &str) -> Vec<&Mission> {
        let mut found: Vec<&Mission> = self.missions.values().filter(|m| m.payload_id == payload_id).collect();
        found.sort_by_key(|m| m.updated_at);
        found
    }

    pub fn update_mission_target(&mut self, id: &Uuid, target: crate::math::Vec3) -> Result<()> {
        let mission = self
            .missions
            .get_mut(id)
            .ok_or_else(|| GuidanceError::UnknownMission(id.to_string()))?;
        mission.target = target;
        mission.updated_at = Utc::now();
        Ok(())
    }

    /// Forces `id` straight to `Active`, bypassing the normal
    /// pending-on-first-payload-update transition. Used to bring up a
    /// synthesized return-to-base mission immediately (§8 scenario 6).
    pub fn activate_mission(&mut self, id: &Uuid) -> Result<()> {
        let mission = self
            .missions
            .get_mut(id)
            .ok_or_else(|| GuidanceError::UnknownMission(id.to_string()))?;
        mission.status = MissionStatus::Active;
        mission.updated_at = Utc::now();
        Ok(())
    }

    pub fn abort_mission(&mut self, id: &Uuid, reason: impl Into<String>) -> Result<Mission> {
        let mission = self
            .missions
            .get_mut(id)
            .ok_or_else(|| GuidanceError::UnknownMission(id.to_string()))?;
        mission.status = MissionStatus::Aborted;
        mission.abort_reason = Some(reason.into());
        mission.updated_at = Utc::now();
        Ok(mission.clone())
    }

    pub fn set_trajectory(&mut self, id: &Uuid, trajectory: crate::models::Trajectory) -> Result<()> {
        let mission = self
            .missions
            .get_mut(id)
            .ok_or_else(|| GuidanceError::UnknownMission(id.to_string()))?;
        mission.trajectory = Some(trajectory);
        mission.updated_at = Utc::now();
        Ok(())
    }

    pub fn payload(&self, payload_id: &str) -> Option<&Payload> {
        self.payloads.get(payload_id)
    }

    pub fn payloads(&self) -> impl Iterator<Item = &Payload> {
        self.payloads.values()
    }

    pub fn active_missions(&self) -> impl Iterator<Item = &Mission> {
        self.missions.values().filter(|m| m.status == MissionStatus::Active)
    }

    pub fn active_mission_ids_mut(&mut self) -> Vec<Uuid> {
        self.missions.values().filter(|m| m.status == MissionStatus::Active).map(|m| m.id).collect()
    }

    pub fn touch_mission(&mut self, id: &Uuid) {
        if let Some(mission) = self.missions.get_mut(id) {
            mission.updated_at = Utc::now();
        }
    }

    pub fn insert_payload(&mut self, payload: Payload) {
        self.payloads.insert(payload.id.clone(), payload);
    }

    /// Stores the new payload state and reconciles mission lifecycle:
    /// `pending -> active` on first update for a payload, `active ->
    /// completed` within `MISSION_COMPLETION_RADIUS_M` of the target.
    pub fn update_payload_state(&mut self, mut state: Payload) -> PayloadUpdateOutcome {
        state.last_update = Utc::now();
        let payload_id = state.id.clone();
        self.payloads.insert(payload_id.clone(), state.clone());

        let mut ids: Vec<Uuid> = self
            .missions
            .values()
            .filter(|m| m.payload_id == payload_id)
            .map(|m| m.id)
            .collect();
        ids.sort_by_key(|id| self.missions[id].updated_at);

        let mut activated = Vec::new();
        let mut completed = Vec::new();

        for id in ids {
            let mission = self.missions.get_mut(&id).unwrap();
            match mission.status {
                MissionStatus::Pending => {
                    mission.status = MissionStatus::Active;
                    mission.updated_at = Utc::now();
                    activated.push(id);
                }
                MissionStatus::Active => {
                    let dist = magnitude(sub(state.position, mission.target));
                    if dist <= MISSION_COMPLETION_RADIUS_M {
                        mission.status = MissionStatus::Completed;
                        mission.completed_at = Some(Utc::now());
                        mission.updated_at = Utc::now();
                        completed.push(id);
                        break;
                    }
                }
                MissionStatus::Completed | MissionStatus::Aborted => {}
            }
        }

        PayloadUpdateOutcome { activated, completed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vec3;
    use crate::models::{MissionType, PayloadCapabilities};

    fn mission(payload_id: &str, target: Vec3) -> Mission {
        Mission {
            id: Uuid::nil(),
            payload_id: payload_id.to_string(),
            mission_type: MissionType::Standard,
            start: Vec3::zero(),
            target,
            priority: 1,
            stealth_required: false,
            status: MissionStatus::Pending,
            trajectory: None,
            abort_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn create_mission_generates_id_and_trajectory() {
        let mut store = MissionStore::new();
        let payload = Payload::new("p1", "strike", PayloadCapabilities::default());
        let id = store.create_mission(mission("p1", Vec3::new(1000.0, 0.0, 0.0)), &payload).unwrap();
        let stored = store.get_mission(&id).unwrap();
        assert_eq!(stored.status, MissionStatus::Pending);
        assert!(stored.trajectory.is_some());
    }

    #[test]
    fn payload_update_activates_pending_mission() {
        let mut store = MissionStore::new();
        let payload = Payload::new("p1", "strike", PayloadCapabilities::default());
        let id = store.create_mission(mission("p1", Vec3::new(1000.0, 0.0, 0.0)), &payload).unwrap();

        let outcome = store.update_payload_state(payload);
        assert_eq!(outcome.activated, vec![id]);
        assert_eq!(store.get_mission(&id).unwrap().status, MissionStatus::Active);
    }

    #[test]
    fn payload_within_radius_completes_active_mission() {
        let mut store = MissionStore::new();
        let payload = Payload::new("p1", "strike", PayloadCapabilities::default());
        let id = store.create_mission(mission("p1", Vec3::new(1000.0, 0.0, 0.0)), &payload).unwrap();
        store.update_payload_state(payload.clone());

        let mut near = payload;
        near.position = Vec3::new(990.0, 0.0, 0.0);
        let outcome = store.update_payload_state(near);
        assert_eq!(outcome.completed, vec![id]);
        assert_eq!(store.get_mission(&id).unwrap().status, MissionStatus::Completed);
    }

    #[test]
    fn update_mission_target_round_trips() {
        let mut store = MissionStore::new();
        let payload = Payload::new("p1", "strike", PayloadCapabilities::default());
        let id = store.create_mission(mission("p1", Vec3::new(1000.0, 0.0, 0.0)), &payload).unwrap();
        store.update_mission_target(&id, Vec3::new(2000.0, 0.0, 0.0)).unwrap();
        assert_eq!(store.get_mission(&id).unwrap().target, Vec3::new(2000.0, 0.0, 0.0));
    }

    #[test]
    fn update_mission_target_unknown_fails() {
        let mut store = MissionStore::new();
        let err = store.update_mission_target(&Uuid::new_v4(), Vec3::zero()).unwrap_err();
        assert!(matches!(err, GuidanceError::UnknownMission(_)));
    }
}
