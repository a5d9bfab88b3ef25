//! Input Normalizer - raw device samples into command records
//!
//! Pure mapping code: a list of device samples goes in, command records come
//! out. The only state kept between ticks is the set of device identifiers a
//! warning was already logged for.
//!
//! # Device layout
//!
//! Samples use the "standard gamepad" index layout: axes are
//! `[left x, left y, right x, right y]` with screen-down positive Y, buttons
//! are `[south, east, west, north, lb, rb, lt, rt, ...]` with analog `value`s
//! for the triggers.
//!
//! # Mapping
//!
//! ```text
//! chassis (3-axis joystick)       manipulator (dual-stick gamepad)
//!   drive  = (axis0, axis1)         rotate_gripper = axis0
//!   rotate = axis2                  flex_gripper   = axis1
//!   button0..3 -> X, Y, A, B        flex_arm       = axis2
//!                                   flex_forearm   = axis3
//!                                   rotate_turret, grip from trigger pairs
//!                                   button0..3 -> A, B, X, Y
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::command_state::{
    clamp_axis, ButtonFlags, ChassisCommand, ChassisDelta, CommandState, Joint,
    ManipulatorCommand, ManipulatorDelta, Subsystem,
};
use super::InputError;
use crate::mqtt::message_manager::CommandPayload;

/// One digital/analog button reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ButtonSample {
    pub pressed: bool,
    pub value: f32,
}

impl ButtonSample {
    pub fn digital(pressed: bool) -> Self {
        Self {
            pressed,
            value: if pressed { 1.0 } else { 0.0 },
        }
    }

    pub fn analog(value: f32) -> Self {
        Self {
            pressed: value > 0.0,
            value,
        }
    }
}

/// A single poll of one input device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSample {
    pub id: String,
    pub axes: Vec<f32>,
    pub buttons: Vec<ButtonSample>,
}

impl DeviceSample {
    // Missing channels read as released / centered
    fn axis(&self, index: usize) -> f32 {
        self.axes.get(index).copied().map(clamp_axis).unwrap_or(0.0)
    }

    fn pressed(&self, index: usize) -> bool {
        self.buttons.get(index).map(|b| b.pressed).unwrap_or(false)
    }

    fn button_value(&self, index: usize) -> f32 {
        self.buttons
            .get(index)
            .map(|b| clamp_axis(b.value))
            .unwrap_or(0.0)
    }
}

/// Trigger-pair selection for one manipulator scalar
///
/// While the `selector` button is held the scalar is the negated value of
/// `held_channel`; otherwise it is the value of `released_channel` as is.
/// Channels index into the sample's button list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPair {
    pub selector: usize,
    pub held_channel: usize,
    pub released_channel: usize,
}

impl TriggerPair {
    pub fn resolve(&self, sample: &DeviceSample) -> f32 {
        if sample.pressed(self.selector) {
            -sample.button_value(self.held_channel)
        } else {
            sample.button_value(self.released_channel)
        }
    }
}

/// Device classification and manipulator trigger layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Case-insensitive substrings identifying a 3-axis chassis joystick
    pub chassis_patterns: Vec<String>,
    /// Case-insensitive substrings identifying a dual-stick manipulator gamepad
    pub manipulator_patterns: Vec<String>,
    pub turret_trigger: TriggerPair,
    pub grip_trigger: TriggerPair,
    /// Stick deadzone as a fraction (0.0-1.0); 0.0 keeps the mapping exact
    pub joystick_deadzone: f32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            chassis_patterns: vec!["extreme 3d".to_string(), "3d pro".to_string()],
            manipulator_patterns: vec![
                "xbox".to_string(),
                "xinput".to_string(),
                "standard gamepad".to_string(),
            ],
            // LB selects the negated LT, otherwise RT
            turret_trigger: TriggerPair {
                selector: 4,
                held_channel: 6,
                released_channel: 7,
            },
            // RB selects the negated RT, otherwise LT
            grip_trigger: TriggerPair {
                selector: 5,
                held_channel: 7,
                released_channel: 6,
            },
            joystick_deadzone: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Chassis,
    Manipulator,
}

/// Output of mapping a single recognized device sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NormalizedInput {
    Chassis(ChassisCommand),
    Manipulator(ManipulatorCommand),
}

/// Pointer position on an on-screen joystick, screen-down positive Y
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PointerSample {
    pub x: f32,
    pub y: f32,
}

impl PointerSample {
    /// Chassis drive joystick: Y is flipped so pushing up drives forward
    pub fn drive(self) -> ChassisDelta {
        ChassisDelta::Drive {
            x: self.x,
            y: -self.y,
        }
    }

    /// Chassis rotation joystick: only the horizontal component counts
    pub fn rotate(self) -> ChassisDelta {
        ChassisDelta::Rotate(self.x)
    }

    /// Manipulator joint joystick: rotations follow X, flexes and grip follow -Y
    pub fn joint(self, joint: Joint) -> ManipulatorDelta {
        let value = if joint.is_rotation() { self.x } else { -self.y };
        ManipulatorDelta::Joint {
            joint,
            value: clamp_axis(value),
        }
    }
}

// Helper function to apply deadzone to analog stick values
fn apply_deadzone(value: f32, deadzone: f32) -> f32 {
    if deadzone <= 0.0 {
        value
    } else if value.abs() < deadzone {
        0.0
    } else {
        // Rescale the value to the range outside the deadzone
        let sign = if value < 0.0 { -1.0 } else { 1.0 };
        sign * (value.abs() - deadzone) / (1.0 - deadzone)
    }
}

pub struct InputNormalizer {
    config: DeviceConfig,
    chassis_patterns: Vec<String>,
    manipulator_patterns: Vec<String>,
    // Identifiers already warned about during their current connection
    warned_devices: HashSet<String>,
}

impl InputNormalizer {
    pub fn new(config: DeviceConfig) -> Self {
        let lower = |patterns: &[String]| -> Vec<String> {
            patterns
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| p.to_lowercase())
                .collect()
        };
        info!(
            "Input normalizer: chassis patterns {:?}, manipulator patterns {:?}",
            config.chassis_patterns, config.manipulator_patterns
        );

        Self {
            chassis_patterns: lower(&config.chassis_patterns),
            manipulator_patterns: lower(&config.manipulator_patterns),
            config,
            warned_devices: HashSet::new(),
        }
    }

    /// Classifies a device by its identifier.
    ///
    /// Identifiers matching neither pattern list are rejected; they never fall
    /// back to manipulator control.
    pub fn classify(&self, id: &str) -> Result<DeviceClass, InputError> {
        let id_lower = id.to_lowercase();
        if self.chassis_patterns.iter().any(|p| id_lower.contains(p)) {
            Ok(DeviceClass::Chassis)
        } else if self.manipulator_patterns.iter().any(|p| id_lower.contains(p)) {
            Ok(DeviceClass::Manipulator)
        } else {
            Err(InputError::UnrecognizedDevice(id.to_string()))
        }
    }

    /// Maps one sample, logging unrecognized devices once per connection
    pub fn normalize(&mut self, sample: &DeviceSample) -> Option<NormalizedInput> {
        match self.classify(&sample.id) {
            Ok(DeviceClass::Chassis) => Some(NormalizedInput::Chassis(self.map_chassis(sample))),
            Ok(DeviceClass::Manipulator) => {
                Some(NormalizedInput::Manipulator(self.map_manipulator(sample)))
            }
            Err(e) => {
                if self.warned_devices.insert(sample.id.clone()) {
                    warn!("{}, ignoring its input", e);
                }
                None
            }
        }
    }

    fn stick(&self, sample: &DeviceSample, index: usize) -> f32 {
        apply_deadzone(sample.axis(index), self.config.joystick_deadzone)
    }

    pub fn map_chassis(&self, sample: &DeviceSample) -> ChassisCommand {
        ChassisCommand {
            drive: [self.stick(sample, 0), self.stick(sample, 1)],
            rotate: self.stick(sample, 2),
            buttons: ButtonFlags {
                x: sample.pressed(0),
                y: sample.pressed(1),
                a: sample.pressed(2),
                b: sample.pressed(3),
            },
            controller_active: true,
        }
    }

    pub fn map_manipulator(&self, sample: &DeviceSample) -> ManipulatorCommand {
        ManipulatorCommand {
            rotate_gripper: self.stick(sample, 0),
            flex_gripper: self.stick(sample, 1),
            flex_arm: self.stick(sample, 2),
            flex_forearm: self.stick(sample, 3),
            rotate_turret: self.config.turret_trigger.resolve(sample),
            grip: self.config.grip_trigger.resolve(sample),
            buttons: ButtonFlags {
                a: sample.pressed(0),
                b: sample.pressed(1),
                x: sample.pressed(2),
                y: sample.pressed(3),
            },
            controller_active: true,
        }
    }

    /// Applies one tick of device samples to the command records.
    ///
    /// A record is under controller authority exactly when a recognized device
    /// for it is present in the tick. An empty list drops authority on every
    /// record and leaves the numeric fields untouched.
    ///
    /// Returns the resulting payloads in sample order, ready to enqueue.
    pub fn apply(&mut self, samples: &[DeviceSample], state: &CommandState) -> Vec<CommandPayload> {
        if samples.is_empty() {
            if state.controller_active(Subsystem::Chassis)
                || state.controller_active(Subsystem::Manipulator)
            {
                info!("No controller connected, on-screen controls regain authority");
            }
            state.release_controller_authority();
            self.warned_devices.clear();
            return Vec::new();
        }

        let mut payloads = Vec::with_capacity(samples.len());
        let mut chassis_owned = false;
        let mut manipulator_owned = false;

        for sample in samples {
            match self.normalize(sample) {
                Some(NormalizedInput::Chassis(reading)) => {
                    chassis_owned = true;
                    let record = state.apply_controller_chassis(reading);
                    payloads.push(CommandPayload::from(&record));
                }
                Some(NormalizedInput::Manipulator(reading)) => {
                    manipulator_owned = true;
                    let record = state.apply_controller_manipulator(reading);
                    payloads.push(CommandPayload::from(&record));
                }
                None => {}
            }
        }

        if !chassis_owned {
            state.set_controller_active(Subsystem::Chassis, false);
        }
        if !manipulator_owned {
            state.set_controller_active(Subsystem::Manipulator, false);
        }

        // A device that went away gets a fresh warning when it comes back
        self.warned_devices
            .retain(|id| samples.iter().any(|s| &s.id == id));

        debug!("Normalized {} samples into {} payloads", samples.len(), payloads.len());
        payloads
    }
}
