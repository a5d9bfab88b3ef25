//! # MQTT Relay Module
//!
//! Carries normalized command payloads to the broker and telemetry back to
//! whoever registered interest. A single supervising task owns the broker
//! connection; everything else reaches the bus through the topic registry or
//! the publish queue.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker, topic and rate configuration
//! ├── error.rs            - Transport, publish and decode errors
//! ├── message_manager.rs  - Wire payloads, publish items, telemetry messages
//! ├── registry.rs         - Topic → subscriber registry driving bus (un)subscribes
//! ├── publisher.rs        - Bounded queue and rate-limited publisher task
//! ├── transport.rs        - Transport seam and the rumqttc implementation
//! └── mqtt_handler.rs     - Connection state machine and reconnect supervisor
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! producers ──try_send──► PublishQueue ──► Publisher ──► BusLink ──► broker
//! broker ──► BusTransport ──► ConnectionManager ──► TopicRegistry ──► sinks
//! ```
//!
//! ## Failure Model
//!
//! Nothing in here is fatal. Transport failures lead to reconnect with
//! bounded backoff, malformed telemetry is dropped and logged, a full queue
//! drops the newest item. Only an explicit shutdown stops the supervisor.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod publisher;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use config::{MqttConfig, TopicConfig};
pub use error::{DecodeError, PublishError, PublisherError, TransportError};
pub use message_manager::{CommandPayload, PublishItem, TelemetryMessage};
pub use mqtt_handler::{Backoff, ConnectionManager, ConnectionSettings, ConnectionState};
pub use publisher::{
    PendingSlot, PublishChannel, PublishQueue, PublisherHandle, PublisherSettings, PublisherState,
};
pub use registry::{SubscriptionHandle, TelemetrySink, TopicRegistry};
pub use transport::{BusLink, BusTransport, InboundMessage, RumqttTransport};
