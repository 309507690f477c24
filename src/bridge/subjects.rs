//! Subject catalogue and wire envelope (§4.9, §6)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod ingress {
    pub const THREATS: &str = "threats";
    pub const THREAT_ZONES: &str = "threat_zones";
    pub const SATELLITE_POSITIONS: &str = "satellite_positions";
    pub const SILENUS_ALERTS: &str = "silenus_alerts";
    pub const TELEMETRY_PREFIX: &str = "telemetry.";
    pub const CONTACT_WINDOWS: &str = "contact_windows";
    pub const HUMANOID_STATES: &str = "hunoid_states";
    pub const MISSIONS: &str = "missions";
    pub const WEATHER: &str = "weather";
    pub const NO_FLY_ZONES: &str = "no_fly_zones";

    pub const ALL: &[&str] = &[
        THREATS,
        THREAT_ZONES,
        SATELLITE_POSITIONS,
        SILENUS_ALERTS,
        CONTACT_WINDOWS,
        HUMANOID_STATES,
        MISSIONS,
        WEATHER,
        NO_FLY_ZONES,
    ];
}

pub mod egress {
    pub const TRAJECTORY: &str = "trajectory";
    pub const MISSION: &str = "mission";
    pub const THREAT_ALERT: &str = "threat_alert";
    pub const GUIDANCE: &str = "guidance";
    pub const PAYLOAD_STATUS: &str = "payload_status";
    pub const EVASION: &str = "evasion";
    pub const ARRIVAL: &str = "arrival";
    pub const DEVIATION: &str = "deviation";
}

/// Wire envelope for every message exchanged over the bridge. The
/// transport is a plain WebSocket, so subject addressing (the pub/sub
/// abstraction §4.9 asks for) rides inside this JSON wrapper rather
/// than a native broker topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub subject: String,
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl BridgeMessage {
    pub fn new(subject: impl Into<String>, payload: Value) -> Self {
        Self { subject: subject.into(), payload, timestamp: Utc::now() }
    }
}
