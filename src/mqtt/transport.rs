//! Bus transport seam
//!
//! The connection manager only talks to the broker through [`BusTransport`]
//! (session lifecycle and inbound traffic) and [`BusLink`] (outbound requests
//! for one live session). Production uses rumqttc; tests script both sides.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};

use super::config::MqttConfig;
use super::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Outbound half of one connected session
///
/// Calls only queue the request; they never wait on the network. A link is
/// dead once its session ends and every call then fails.
pub trait BusLink: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BusTransport: Send + 'static {
    /// Opens a fresh session and returns its outbound link once the broker
    /// has acknowledged it.
    async fn connect(&mut self) -> Result<Arc<dyn BusLink>, TransportError>;

    /// Waits for the next inbound publish of the current session. An error
    /// means the session is gone.
    async fn next_message(&mut self) -> Result<InboundMessage, TransportError>;

    async fn close(&mut self);
}

struct RumqttLink {
    client: AsyncClient,
}

impl BusLink for RumqttLink {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| TransportError::Request(e.to_string()))
    }
}

/// rumqttc backed transport, MQTT 3.1.1 over TCP
pub struct RumqttTransport {
    config: MqttConfig,
    session: Option<(AsyncClient, EventLoop)>,
}

impl RumqttTransport {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    fn client_id(&self) -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        format!("{}{}", self.config.client_id_prefix, secs)
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id(), self.config.host.clone(), self.config.port);
        options
            .set_credentials(self.config.username.clone(), self.config.password.clone())
            .set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(1)))
            .set_clean_session(true);
        options
    }
}

#[async_trait]
impl BusTransport for RumqttTransport {
    async fn connect(&mut self) -> Result<Arc<dyn BusLink>, TransportError> {
        // Drop whatever is left of the previous session first
        self.session = None;

        let options = self.options();
        info!(
            "Connecting to broker {}:{} as {}",
            self.config.host,
            self.config.port,
            options.client_id()
        );
        let (client, mut eventloop) = AsyncClient::new(options, self.config.request_capacity.max(1));

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(TransportError::Connect(format!("Broker refused connection: {:?}", ack.code)));
                }
                Ok(event) => debug!("Event before ConnAck: {:?}", event),
                Err(e) => return Err(TransportError::Connect(e.to_string())),
            }
        }

        let link: Arc<dyn BusLink> = Arc::new(RumqttLink {
            client: client.clone(),
        });
        self.session = Some((client, eventloop));
        Ok(link)
    }

    async fn next_message(&mut self) -> Result<InboundMessage, TransportError> {
        let result = match self.session.as_mut() {
            None => return Err(TransportError::Closed),
            Some((_, eventloop)) => loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        break Ok(InboundMessage {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        });
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        break Err(TransportError::ConnectionLost("Broker sent disconnect".to_string()));
                    }
                    Ok(_) => {}
                    Err(e) => break Err(TransportError::ConnectionLost(e.to_string())),
                }
            },
        };

        if result.is_err() {
            self.session = None;
        }
        result
    }

    async fn close(&mut self) {
        let Some((client, mut eventloop)) = self.session.take() else {
            return;
        };

        if let Err(e) = client.try_disconnect() {
            warn!("Failed to queue disconnect: {}", e);
            return;
        }

        // Let the event loop flush the disconnect packet
        let flush = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_millis(500), flush).await.is_err() {
            debug!("Disconnect flush timed out");
        }
        info!("Broker session closed");
    }
}
