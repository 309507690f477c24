//! Event bridge subsystem (§4.9)

pub mod client;
pub mod subjects;

pub use client::{BridgeStats, EventBridge};
pub use subjects::BridgeMessage;
