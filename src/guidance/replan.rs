//! Replan scheduler (§4.6)
//!
//! A rate-limiting guard shared by every replan source. Planning itself
//! stays in [`crate::planner`]; this module only decides whether now is
//! an acceptable time to run it again.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Why a replan fired, carried through to `TargetingMetrics::last_replan_reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplanReason {
    PayloadUpdate,
    TelemetryUpdate,
    TargetUpdate,
    WifiImaging,
    FusedState,
}

impl ReplanReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplanReason::PayloadUpdate => "payload_update",
            ReplanReason::TelemetryUpdate => "telemetry_update",
            ReplanReason::TargetUpdate => "target_update",
            ReplanReason::WifiImaging => "wifi_imaging",
            ReplanReason::FusedState => "fused_state",
        }
    }
}

/// Per-mission rate limiter. `last_replan` is bumped on every fired
/// attempt, even when the resulting snapshot turns out stale, to keep
/// the rate limit meaningful (§5).
#[derive(Default)]
pub struct ReplanScheduler {
    interval: Duration,
    last_replan: HashMap<Uuid, Instant>,
    replan_count: HashMap<Uuid, u64>,
    last_reason: HashMap<Uuid, ReplanReason>,
}

impl ReplanScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_replan: HashMap::new(),
            replan_count: HashMap::new(),
            last_reason: HashMap::new(),
        }
    }

    /// Returns `true` and records the attempt iff `mission_id` has not
    /// replanned within `interval`.
    pub fn try_fire(&mut self, mission_id: Uuid, now: Instant, reason: ReplanReason) -> bool {
        let allowed = match self.last_replan.get(&mission_id) {
            Some(last) => now.duration_since(*last) >= self.interval,
            None => true,
        };
        if allowed {
            self.last_replan.insert(mission_id, now);
            *self.replan_count.entry(mission_id).or_insert(0) += 1;
            self.last_reason.insert(mission_id, reason);
        }
        allowed
    }

    pub fn replan_count(&self, mission_id: &Uuid) -> u64 {
        self.replan_count.get(mission_id).copied().unwrap_or(0)
    }

    pub fn last_reason(&self, mission_id: &Uuid) -> Option<ReplanReason> {
        self.last_reason.get(mission_id).copied()
    }
}
