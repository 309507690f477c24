//! Payload command execution (§4.10)

pub mod controller;

pub use controller::{apply, ControllerRegistry, PayloadController};
