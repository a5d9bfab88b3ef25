//! Ground station relay between operator input and the rover's MQTT bus
//!
//! Operator input (on-screen joysticks and physical gamepads) is normalized
//! into chassis and manipulator command records, published at a bounded rate
//! over a reconnecting MQTT session, and telemetry coming back is fanned out
//! to whoever registered for it.

pub mod config;
pub mod controller;
pub mod logging;
pub mod mqtt;
pub mod relay;

pub use config::RelayConfig;
pub use relay::{Relay, RelayHandle, SubmitError};
