//! Mission and payload state store (§4.4)

pub mod store;

pub use store::{MissionStore, PayloadUpdateOutcome};
