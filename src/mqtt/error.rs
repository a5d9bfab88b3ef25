//! Error types for the MQTT relay

use std::time::Duration;

use thiserror::Error;

/// Connect and send failures. Recovered by reconnecting, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Connect attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The client refused to queue a request towards the broker
    #[error("Request rejected: {0}")]
    Request(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Transport closed")]
    Closed,
}

/// Reasons an enqueue attempt did not make it into the publish queue
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Queue at capacity; the newest item was dropped
    #[error("Publish queue is full ({capacity} items), dropping message")]
    Overflow { capacity: usize },

    /// No broker connection; the item would only be discarded as stale
    #[error("Not connected, dropping message")]
    Offline,

    #[error("Publish queue closed")]
    Closed,
}

/// Inbound payload that is not valid JSON
#[derive(Debug, Error)]
#[error("Failed to decode JSON from message on topic {topic}: {source}")]
pub struct DecodeError {
    pub topic: String,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublisherError {
    #[error("A publisher task is already running")]
    AlreadyRunning,

    #[error("Publisher task panicked: {0}")]
    Panicked(String),
}
