//! Controller subsystem for operator input handling
//!
//! Turns raw operator input into the two command records the relay publishes:
//!
//! 1. [`event_collector`] - Physical gamepad polling (gilrs) into device samples
//! 2. [`normalizer`] - Device classification and sample-to-command mapping
//! 3. [`command_state`] - The long-lived chassis and manipulator records
//!
//! # Architecture
//!
//! ```text
//! Gamepad ──► Collector ──► Normalizer ──► CommandState ──► snapshot
//!                              ▲
//! On-screen controls ──────────┘ (ui deltas, gated by controller authority)
//! ```
//!
//! The collector runs on its own thread; everything downstream of it is
//! non-blocking so input sampling never stalls on the network.

pub mod command_state;
pub mod event_collector;
pub mod normalizer;

pub use command_state::{
    Button, ButtonFlags, ChassisAxis, ChassisCommand, ChassisDelta, CommandState, Joint,
    ManipulatorCommand, ManipulatorDelta, Subsystem, UnknownFieldName,
};
pub use event_collector::{CollectorError, CollectorHandle, CollectorSettings};
pub use normalizer::{
    ButtonSample, DeviceClass, DeviceConfig, DeviceSample, InputNormalizer, NormalizedInput,
    PointerSample, TriggerPair,
};

/// Errors raised while turning operator input into command records
///
/// None of these are fatal: the offending input is ignored and the relay keeps
/// running.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    /// Device identifier matched neither the chassis nor the manipulator pattern
    #[error("Unrecognized input device: {0}")]
    UnrecognizedDevice(String),

    /// A physical controller currently owns this record
    #[error("{0} is under controller authority, on-screen input rejected")]
    ControllerActive(Subsystem),

    /// Field name does not exist on the addressed record
    #[error("Unknown {subsystem} field: {name}")]
    UnknownField { subsystem: Subsystem, name: String },
}
