//! Relay assembly
//!
//! Wires command state, topic registry, publish queue and the connection
//! supervisor together, and hands the UI layer a cloneable [`RelayHandle`]
//! with the four operations it needs: submit chassis input, submit
//! manipulator input, register for telemetry, cancel a registration.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::controller::{
    ChassisDelta, CommandState, DeviceSample, InputError, InputNormalizer, ManipulatorDelta,
    Subsystem,
};
use crate::mqtt::{
    BusTransport, CommandPayload, ConnectionManager, ConnectionSettings, ConnectionState,
    MqttConfig, PendingSlot, PublishChannel, PublishError, PublishItem, PublishQueue,
    PublisherState,
    SubscriptionHandle, TelemetrySink, TopicConfig, TopicRegistry,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Input(#[from] InputError),

    /// The record was updated but its payload did not reach the queue
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// What the UI layer holds on to
#[derive(Clone)]
pub struct RelayHandle {
    state: Arc<CommandState>,
    queue: PublishQueue,
    registry: Arc<TopicRegistry>,
    topics: TopicConfig,
    // One queued controller payload per subsystem at most
    chassis_slot: PendingSlot,
    manipulator_slot: PendingSlot,
}

impl RelayHandle {
    fn item(&self, payload: CommandPayload) -> PublishItem {
        PublishItem::new(self.topics.command_topic(payload.subsystem()), payload)
    }

    fn enqueue(&self, payload: CommandPayload) -> Result<(), PublishError> {
        self.queue.enqueue(self.item(payload))
    }

    fn controller_slot(&self, subsystem: Subsystem) -> &PendingSlot {
        match subsystem {
            Subsystem::Chassis => &self.chassis_slot,
            Subsystem::Manipulator => &self.manipulator_slot,
        }
    }

    /// Applies an on-screen chassis change and queues the resulting record
    pub fn submit_chassis_delta(&self, delta: ChassisDelta) -> Result<(), SubmitError> {
        let record = self.state.apply_chassis(delta)?;
        self.enqueue(CommandPayload::from(&record))?;
        Ok(())
    }

    /// Applies an on-screen manipulator change and queues the resulting record
    pub fn submit_manipulator_delta(&self, delta: ManipulatorDelta) -> Result<(), SubmitError> {
        let record = self.state.apply_manipulator(delta)?;
        self.enqueue(CommandPayload::from(&record))?;
        Ok(())
    }

    /// Same as the delta submits, addressing the field by its wire name
    pub fn submit_field(&self, subsystem: Subsystem, name: &str, value: f32) -> Result<(), SubmitError> {
        let payload = self.state.set_field(subsystem, name, value)?;
        self.enqueue(payload)?;
        Ok(())
    }

    /// Feeds one tick of physical controller samples through the normalizer.
    /// Returns how many payloads made it into the queue.
    ///
    /// A subsystem whose previous controller payload is still queued skips
    /// this tick; the record keeps the new reading and a later tick sends it.
    pub fn submit_device_samples(&self, normalizer: &mut InputNormalizer, samples: &[DeviceSample]) -> usize {
        normalizer
            .apply(samples, &self.state)
            .into_iter()
            .filter(|payload| {
                let subsystem = payload.subsystem();
                match self
                    .queue
                    .enqueue_in_slot(self.item(payload.clone()), self.controller_slot(subsystem))
                {
                    Ok(queued) => queued,
                    Err(e) => {
                        debug!("Controller payload for {} not queued: {}", subsystem, e);
                        false
                    }
                }
            })
            .count()
    }

    pub fn on_telemetry(&self, topic: &str, sink: TelemetrySink) -> SubscriptionHandle {
        self.registry.subscribe(topic, sink)
    }

    pub fn on_subsystem_telemetry(&self, subsystem: Subsystem, sink: TelemetrySink) -> SubscriptionHandle {
        self.registry.subscribe(self.topics.telemetry_topic(subsystem), sink)
    }

    pub fn cancel_telemetry(&self, handle: &SubscriptionHandle) -> bool {
        self.registry.unsubscribe(handle)
    }

    pub fn commands(&self) -> &Arc<CommandState> {
        &self.state
    }
}

/// Running relay; dropping it without [`Relay::shutdown`] leaves the
/// supervisor running until the runtime ends
pub struct Relay {
    handle: RelayHandle,
    shutdown: CancellationToken,
    supervisor: JoinHandle<()>,
    connection: watch::Receiver<ConnectionState>,
    publisher: watch::Receiver<PublisherState>,
}

impl Relay {
    /// Starts the connection supervisor on the current tokio runtime
    pub fn start<T: BusTransport>(config: &MqttConfig, transport: T) -> Self {
        let state = Arc::new(CommandState::new());
        let registry = Arc::new(TopicRegistry::new());
        let (queue, channel) = PublishChannel::bounded(config.queue_capacity);
        let shutdown = CancellationToken::new();

        let manager = ConnectionManager::new(
            transport,
            ConnectionSettings::from(config),
            registry.clone(),
            channel,
            shutdown.clone(),
        );
        let connection = manager.watch_state();
        let publisher = manager.watch_publisher();
        let supervisor = manager.spawn();
        info!("Relay started for broker {}:{}", config.host, config.port);

        Self {
            handle: RelayHandle {
                state,
                queue,
                registry,
                topics: config.topics.clone(),
                chassis_slot: PendingSlot::new(),
                manipulator_slot: PendingSlot::new(),
            },
            shutdown,
            supervisor,
            connection,
            publisher,
        }
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn publisher_state(&self) -> watch::Receiver<PublisherState> {
        self.publisher.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops publishing, closes the broker session and waits for the
    /// supervisor to finish. No reconnect happens afterwards.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        info!("Shutting down relay");
        self.shutdown.cancel();
        self.supervisor.await
    }
}
