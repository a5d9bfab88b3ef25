use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::error::DecodeError;
use crate::controller::{ChassisCommand, ManipulatorCommand, Subsystem};

/// Wire document published for a command record
///
/// Serializes as `{"eventType": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "payload", rename_all = "lowercase")]
pub enum CommandPayload {
    Chassis(ChassisPayload),
    Manipulator(ManipulatorPayload),
}

impl CommandPayload {
    pub fn subsystem(&self) -> Subsystem {
        match self {
            CommandPayload::Chassis(_) => Subsystem::Chassis,
            CommandPayload::Manipulator(_) => Subsystem::Manipulator,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChassisPayload {
    pub stick: [f32; 2],
    pub rotate: [f32; 1],
    pub button_x: bool,
    pub button_y: bool,
    pub button_a: bool,
    pub button_b: bool,
}

impl From<&ChassisCommand> for ChassisPayload {
    fn from(cmd: &ChassisCommand) -> Self {
        Self {
            stick: cmd.drive,
            rotate: [cmd.rotate],
            button_x: cmd.buttons.x,
            button_y: cmd.buttons.y,
            button_a: cmd.buttons.a,
            button_b: cmd.buttons.b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManipulatorPayload {
    pub rotate_turret: f32,
    pub flex_forearm: f32,
    pub flex_arm: f32,
    pub flex_gripper: f32,
    pub rotate_gripper: f32,
    pub grip: f32,
    pub button_x: bool,
    pub button_y: bool,
    pub button_a: bool,
    pub button_b: bool,
}

impl From<&ManipulatorCommand> for ManipulatorPayload {
    fn from(cmd: &ManipulatorCommand) -> Self {
        Self {
            rotate_turret: cmd.rotate_turret,
            flex_forearm: cmd.flex_forearm,
            flex_arm: cmd.flex_arm,
            flex_gripper: cmd.flex_gripper,
            rotate_gripper: cmd.rotate_gripper,
            grip: cmd.grip,
            button_x: cmd.buttons.x,
            button_y: cmd.buttons.y,
            button_a: cmd.buttons.a,
            button_b: cmd.buttons.b,
        }
    }
}

impl From<&ChassisCommand> for CommandPayload {
    fn from(cmd: &ChassisCommand) -> Self {
        CommandPayload::Chassis(cmd.into())
    }
}

impl From<&ManipulatorCommand> for CommandPayload {
    fn from(cmd: &ManipulatorCommand) -> Self {
        CommandPayload::Manipulator(cmd.into())
    }
}

/// One pending publish; immutable once enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct PublishItem {
    pub topic: String,
    pub payload: CommandPayload,
}

impl PublishItem {
    pub fn new(topic: impl Into<String>, payload: CommandPayload) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Decoded telemetry as handed to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: NaiveDateTime,
}

impl TelemetryMessage {
    pub fn decode(topic: &str, bytes: &[u8]) -> Result<Self, DecodeError> {
        let payload = serde_json::from_slice(bytes).map_err(|source| DecodeError {
            topic: topic.to_string(),
            source,
        })?;

        Ok(TelemetryMessage {
            topic: topic.to_string(),
            payload,
            timestamp: chrono::Local::now().naive_local(),
        })
    }

    /// Header line followed by one `key: value` line per top-level field
    pub fn render(&self) -> String {
        let mut out = format!("{}: {}", self.timestamp, self.topic);
        match &self.payload {
            serde_json::Value::Object(fields) => {
                for (key, value) in fields {
                    out.push_str(&format!("\n{}: {}", key, value));
                }
            }
            other => out.push_str(&format!("\n{}", other)),
        }
        out
    }
}

impl fmt::Display for TelemetryMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = self.payload.to_string();
        let preview: String = content.chars().take(40).collect();
        write!(f, "{} - {}", self.timestamp, preview)
    }
}
