//! Command State - the latest normalized command per actuated subsystem
//!
//! Holds one [`ChassisCommand`] and one [`ManipulatorCommand`] for the whole
//! process lifetime. Writers are the on-screen controls and the physical
//! controller path; the reader is whoever enqueues payloads for publishing.
//!
//! Each record sits behind its own mutex. Every write returns the record as it
//! was left under that same lock, so the payload built from it can never mix
//! old and new field values.
//!
//! # Controller authority
//!
//! While `controller_active` is set on a record, on-screen writes to that
//! record are rejected with [`InputError::ControllerActive`]. Only the
//! controller path (and releasing the controller) changes it.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::InputError;
use crate::mqtt::message_manager::CommandPayload;

/// Clamps a raw axis value into [-1, 1]. NaN collapses to the neutral 0.0.
pub fn clamp_axis(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(-1.0, 1.0)
    }
}

/// Actuated subsystem a command record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Chassis,
    Manipulator,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subsystem::Chassis => write!(f, "chassis"),
            Subsystem::Manipulator => write!(f, "manipulator"),
        }
    }
}

/// A name that does not address any field of the parsed kind
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown field name: {0}")]
pub struct UnknownFieldName(pub String);

// Face buttons shared by both records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    A,
    B,
    X,
    Y,
}

impl FromStr for Button {
    type Err = UnknownFieldName;

    /// Accepts both the wire name (`button_a`) and the bare letter (`a`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix("button_").unwrap_or(s);
        match name.to_ascii_lowercase().as_str() {
            "a" => Ok(Button::A),
            "b" => Ok(Button::B),
            "x" => Ok(Button::X),
            "y" => Ok(Button::Y),
            _ => Err(UnknownFieldName(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonFlags {
    pub a: bool,
    pub b: bool,
    pub x: bool,
    pub y: bool,
}

impl ButtonFlags {
    pub fn get(&self, button: Button) -> bool {
        match button {
            Button::A => self.a,
            Button::B => self.b,
            Button::X => self.x,
            Button::Y => self.y,
        }
    }

    pub fn set(&mut self, button: Button, pressed: bool) {
        match button {
            Button::A => self.a = pressed,
            Button::B => self.b = pressed,
            Button::X => self.x = pressed,
            Button::Y => self.y = pressed,
        }
    }
}

/// Chassis command: planar drive vector, rotation, four buttons
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChassisCommand {
    pub drive: [f32; 2],
    pub rotate: f32,
    pub buttons: ButtonFlags,
    pub controller_active: bool,
}

impl ChassisCommand {
    fn clamped(mut self) -> Self {
        self.drive = [clamp_axis(self.drive[0]), clamp_axis(self.drive[1])];
        self.rotate = clamp_axis(self.rotate);
        self
    }
}

/// Scalar chassis fields addressable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChassisAxis {
    DriveX,
    DriveY,
    Rotate,
}

impl FromStr for ChassisAxis {
    type Err = UnknownFieldName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drive_x" | "stick_x" => Ok(ChassisAxis::DriveX),
            "drive_y" | "stick_y" => Ok(ChassisAxis::DriveY),
            "rotate" => Ok(ChassisAxis::Rotate),
            _ => Err(UnknownFieldName(s.to_string())),
        }
    }
}

/// Manipulator command: six independent joint scalars plus four buttons
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ManipulatorCommand {
    pub rotate_turret: f32,
    pub flex_forearm: f32,
    pub flex_arm: f32,
    pub flex_gripper: f32,
    pub rotate_gripper: f32,
    pub grip: f32,
    pub buttons: ButtonFlags,
    pub controller_active: bool,
}

impl ManipulatorCommand {
    pub fn joint(&self, joint: Joint) -> f32 {
        match joint {
            Joint::RotateTurret => self.rotate_turret,
            Joint::FlexForearm => self.flex_forearm,
            Joint::FlexArm => self.flex_arm,
            Joint::FlexGripper => self.flex_gripper,
            Joint::RotateGripper => self.rotate_gripper,
            Joint::Grip => self.grip,
        }
    }

    pub fn set_joint(&mut self, joint: Joint, value: f32) {
        let value = clamp_axis(value);
        match joint {
            Joint::RotateTurret => self.rotate_turret = value,
            Joint::FlexForearm => self.flex_forearm = value,
            Joint::FlexArm => self.flex_arm = value,
            Joint::FlexGripper => self.flex_gripper = value,
            Joint::RotateGripper => self.rotate_gripper = value,
            Joint::Grip => self.grip = value,
        }
    }

    fn clamped(mut self) -> Self {
        for joint in Joint::ALL {
            self.set_joint(joint, self.joint(joint));
        }
        self
    }
}

/// Manipulator actuators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Joint {
    RotateTurret,
    FlexForearm,
    FlexArm,
    FlexGripper,
    RotateGripper,
    Grip,
}

impl Joint {
    pub const ALL: [Joint; 6] = [
        Joint::RotateTurret,
        Joint::FlexForearm,
        Joint::FlexArm,
        Joint::FlexGripper,
        Joint::RotateGripper,
        Joint::Grip,
    ];

    /// Whether an on-screen joystick drives this joint horizontally
    pub fn is_rotation(&self) -> bool {
        matches!(self, Joint::RotateTurret | Joint::RotateGripper)
    }
}

impl FromStr for Joint {
    type Err = UnknownFieldName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rotate_turret" => Ok(Joint::RotateTurret),
            "flex_forearm" => Ok(Joint::FlexForearm),
            "flex_arm" => Ok(Joint::FlexArm),
            "flex_gripper" => Ok(Joint::FlexGripper),
            "rotate_gripper" => Ok(Joint::RotateGripper),
            "grip" => Ok(Joint::Grip),
            _ => Err(UnknownFieldName(s.to_string())),
        }
    }
}

/// On-screen change to the chassis record
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChassisDelta {
    Drive { x: f32, y: f32 },
    /// Drive joystick let go; resets the drive vector to zero
    DriveReleased,
    Rotate(f32),
    /// Rotation joystick let go; resets rotation to zero
    RotateReleased,
    Button { button: Button, pressed: bool },
}

/// On-screen change to the manipulator record
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ManipulatorDelta {
    Joint { joint: Joint, value: f32 },
    /// Joint joystick let go; resets that joint to zero
    JointReleased(Joint),
    Button { button: Button, pressed: bool },
}

/// Owner of both command records
///
/// Shared by reference (usually `Arc<CommandState>`) between the input paths and
/// the publishing side. All operations are bounded-time and never wait on I/O.
#[derive(Debug, Default)]
pub struct CommandState {
    chassis: Mutex<ChassisCommand>,
    manipulator: Mutex<ManipulatorCommand>,
}

// A panicking writer cannot leave a record half-written: every write is a plain
// field store, so a poisoned lock still guards valid data.
fn lock<T>(record: &Mutex<T>) -> MutexGuard<'_, T> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CommandState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chassis(&self) -> ChassisCommand {
        *lock(&self.chassis)
    }

    pub fn manipulator(&self) -> ManipulatorCommand {
        *lock(&self.manipulator)
    }

    /// Wire-ready document for one subsystem from a single consistent read
    pub fn snapshot(&self, subsystem: Subsystem) -> CommandPayload {
        match subsystem {
            Subsystem::Chassis => CommandPayload::from(&self.chassis()),
            Subsystem::Manipulator => CommandPayload::from(&self.manipulator()),
        }
    }

    pub fn controller_active(&self, subsystem: Subsystem) -> bool {
        match subsystem {
            Subsystem::Chassis => lock(&self.chassis).controller_active,
            Subsystem::Manipulator => lock(&self.manipulator).controller_active,
        }
    }

    pub fn set_controller_active(&self, subsystem: Subsystem, active: bool) {
        match subsystem {
            Subsystem::Chassis => lock(&self.chassis).controller_active = active,
            Subsystem::Manipulator => lock(&self.manipulator).controller_active = active,
        }
    }

    /// Hands authority back to the on-screen controls on every record.
    ///
    /// Numeric fields keep their last values.
    pub fn release_controller_authority(&self) {
        self.set_controller_active(Subsystem::Chassis, false);
        self.set_controller_active(Subsystem::Manipulator, false);
    }

    // Locks the chassis record for an on-screen write, unless a controller owns it
    fn writable_chassis(
        &self,
        input: impl fmt::Debug,
    ) -> Result<MutexGuard<'_, ChassisCommand>, InputError> {
        let record = lock(&self.chassis);
        if record.controller_active {
            debug!("Rejecting on-screen chassis input {:?}", input);
            return Err(InputError::ControllerActive(Subsystem::Chassis));
        }
        Ok(record)
    }

    /// Applies an on-screen chassis change, gated by controller authority
    pub fn apply_chassis(&self, delta: ChassisDelta) -> Result<ChassisCommand, InputError> {
        let mut record = self.writable_chassis(delta)?;
        match delta {
            ChassisDelta::Drive { x, y } => record.drive = [clamp_axis(x), clamp_axis(y)],
            ChassisDelta::DriveReleased => record.drive = [0.0, 0.0],
            ChassisDelta::Rotate(value) => record.rotate = clamp_axis(value),
            ChassisDelta::RotateReleased => record.rotate = 0.0,
            ChassisDelta::Button { button, pressed } => record.buttons.set(button, pressed),
        }
        Ok(*record)
    }

    /// Applies an on-screen manipulator change, gated by controller authority
    pub fn apply_manipulator(
        &self,
        delta: ManipulatorDelta,
    ) -> Result<ManipulatorCommand, InputError> {
        let mut record = lock(&self.manipulator);
        if record.controller_active {
            debug!("Rejecting on-screen manipulator input {:?}", delta);
            return Err(InputError::ControllerActive(Subsystem::Manipulator));
        }

        match delta {
            ManipulatorDelta::Joint { joint, value } => record.set_joint(joint, value),
            ManipulatorDelta::JointReleased(joint) => record.set_joint(joint, 0.0),
            ManipulatorDelta::Button { button, pressed } => record.buttons.set(button, pressed),
        }
        Ok(*record)
    }

    /// Sets a field by its wire name. Button fields treat any non-zero value as pressed.
    pub fn set_field(
        &self,
        subsystem: Subsystem,
        name: &str,
        value: f32,
    ) -> Result<CommandPayload, InputError> {
        let unknown = || InputError::UnknownField {
            subsystem,
            name: name.to_string(),
        };

        match subsystem {
            Subsystem::Chassis => {
                if let Ok(button) = name.parse::<Button>() {
                    let delta = ChassisDelta::Button {
                        button,
                        pressed: value != 0.0,
                    };
                    return self.apply_chassis(delta).map(|c| CommandPayload::from(&c));
                }

                let axis = name.parse::<ChassisAxis>().map_err(|_| unknown())?;
                // One drive component changes, the other is kept under the same lock
                let mut record = self.writable_chassis(axis)?;
                let value = clamp_axis(value);
                match axis {
                    ChassisAxis::DriveX => record.drive[0] = value,
                    ChassisAxis::DriveY => record.drive[1] = value,
                    ChassisAxis::Rotate => record.rotate = value,
                }
                Ok(CommandPayload::from(&*record))
            }
            Subsystem::Manipulator => {
                let delta = if let Ok(button) = name.parse::<Button>() {
                    ManipulatorDelta::Button {
                        button,
                        pressed: value != 0.0,
                    }
                } else {
                    ManipulatorDelta::Joint {
                        joint: name.parse::<Joint>().map_err(|_| unknown())?,
                        value,
                    }
                };
                self.apply_manipulator(delta).map(|m| CommandPayload::from(&m))
            }
        }
    }

    /// Overwrites the chassis record from a controller reading and takes authority
    pub fn apply_controller_chassis(&self, reading: ChassisCommand) -> ChassisCommand {
        let mut record = lock(&self.chassis);
        *record = ChassisCommand {
            controller_active: true,
            ..reading.clamped()
        };
        *record
    }

    /// Overwrites the manipulator record from a controller reading and takes authority
    pub fn apply_controller_manipulator(&self, reading: ManipulatorCommand) -> ManipulatorCommand {
        let mut record = lock(&self.manipulator);
        *record = ManipulatorCommand {
            controller_active: true,
            ..reading.clamped()
        };
        *record
    }
}
