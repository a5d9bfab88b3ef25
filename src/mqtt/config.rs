use serde::{Deserialize, Serialize};

use crate::controller::Subsystem;

/// Broker connection and publishing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Client ids are `<prefix><unix seconds>`, one per connection attempt
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    /// Upper bound of the reconnect backoff; the lower bound is one second
    pub reconnect_ceiling_secs: u64,
    /// Target publish frequency; consecutive sends are at least 1/hz apart
    pub publish_hz: u32,
    pub queue_capacity: usize,
    /// Capacity of the client's request channel towards the event loop
    pub request_capacity: usize,
    pub topics: TopicConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: "user".to_string(),
            password: "user".to_string(),
            client_id_prefix: "ground-control-web-app-".to_string(),
            keep_alive_secs: 60,
            connect_timeout_ms: 5000,
            reconnect_ceiling_secs: 5,
            publish_hz: 50,
            queue_capacity: 100,
            request_capacity: 100,
            topics: TopicConfig::default(),
        }
    }
}

/// Bus topic names per subsystem and direction
///
/// Inbound topics carry commands towards the robot, outbound topics carry
/// telemetry back from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub chassis_inbound: String,
    pub chassis_outbound: String,
    pub manipulator_inbound: String,
    pub manipulator_outbound: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            chassis_inbound: "orion/topic/chassis/controller/inbound".to_string(),
            chassis_outbound: "orion/topic/chassis/outbound".to_string(),
            manipulator_inbound: "orion/topic/manipulator/controller/inbound".to_string(),
            manipulator_outbound: "orion/topic/manipulator/outbound".to_string(),
        }
    }
}

impl TopicConfig {
    /// Topic command payloads for this subsystem are published on
    pub fn command_topic(&self, subsystem: Subsystem) -> &str {
        match subsystem {
            Subsystem::Chassis => &self.chassis_inbound,
            Subsystem::Manipulator => &self.manipulator_inbound,
        }
    }

    /// Topic telemetry for this subsystem arrives on
    pub fn telemetry_topic(&self, subsystem: Subsystem) -> &str {
        match subsystem {
            Subsystem::Chassis => &self.chassis_outbound,
            Subsystem::Manipulator => &self.manipulator_outbound,
        }
    }
}
