//! Error taxonomy (§7)
//!
//! One `thiserror`-derived enum per the groups the spec defines. Fusion
//! and bridge errors are recovered by their owning loop; mission/planner
//! errors propagate to the caller; lifecycle errors guard `start`/`stop`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuidanceError {
    // --- Config: invalid parameters at startup; fatal. ---
    #[error("invalid configuration: {0}")]
    Config(String),

    // --- Transport: bridge disconnect; recovered by auto-reconnect. ---
    #[error("bridge transport error: {0}")]
    Transport(String),
    #[error("bridge is not connected")]
    NotConnected,

    // --- Sensor: local to the registry call. ---
    #[error("sensor '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("sensor '{0}' is not registered")]
    UnknownSensor(String),
    #[error("reading from '{0}' is stale")]
    StaleReading(String),
    #[error("invalid covariance for sensor '{0}'")]
    InvalidCovariance(String),

    // --- Fusion: non-fatal; affect confidence only. ---
    #[error("insufficient sensors for fusion update ({have} < {required})")]
    InsufficientSensors { have: usize, required: usize },
    #[error("reading from '{0}' rejected by the outlier gate")]
    OutlierRejected(String),
    #[error("fusion has not converged")]
    NotConverged,

    // --- Planner: returned to the caller of mission creation. ---
    #[error("invalid payload capabilities: {0}")]
    InvalidCapabilities(String),
    #[error("target is unreachable within payload range")]
    UnreachableTarget,

    // --- Command: surfaced through command-result callbacks. ---
    #[error("command queue for payload '{0}' is full")]
    QueueFull(String),
    #[error("command expired before execution")]
    Expired,
    #[error("unknown command type: {0}")]
    UnknownCommand(String),
    #[error("invalid or missing parameter: {0}")]
    InvalidParameter(String),
    #[error("payload '{0}' is not capable of the requested action")]
    NotCapable(String),

    // --- Lifecycle ---
    #[error("guidance core is not running")]
    NotRunning,
    #[error("guidance core is already running")]
    AlreadyRunning,

    // --- Mission / general ---
    #[error("mission '{0}' not found")]
    UnknownMission(String),
    #[error("payload '{0}' not found")]
    UnknownPayload(String),
}

pub type Result<T> = std::result::Result<T, GuidanceError>;
