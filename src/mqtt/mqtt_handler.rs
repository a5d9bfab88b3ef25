//! Connection supervisor
//!
//! [`ConnectionManager`] is the only owner of the broker session. It runs as
//! one task that cycles through connect, serve, and back off until it is
//! shut down. On every new session it replays the registry's topics and
//! starts a fresh publisher; on every lost session it stops that publisher
//! and throws away whatever was still queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::error::TransportError;
use super::publisher::{PublishChannel, PublisherHandle, PublisherSettings, PublisherState};
use super::registry::TopicRegistry;
use super::transport::{BusLink, BusTransport};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Doubling delay between connect attempts, bounded on both ends
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub publisher: PublisherSettings,
}

impl From<&MqttConfig> for ConnectionSettings {
    fn from(config: &MqttConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms.max(1)),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(config.reconnect_ceiling_secs.max(1)),
            publisher: PublisherSettings::from_frequency(config.publish_hz),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost(TransportError),
}

pub struct ConnectionManager<T: BusTransport> {
    transport: T,
    settings: ConnectionSettings,
    registry: Arc<TopicRegistry>,
    channel: PublishChannel,
    publisher: Option<PublisherHandle>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl<T: BusTransport> ConnectionManager<T> {
    pub fn new(
        transport: T,
        settings: ConnectionSettings,
        registry: Arc<TopicRegistry>,
        channel: PublishChannel,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            settings,
            registry,
            channel,
            publisher: None,
            state,
            shutdown,
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn watch_publisher(&self) -> watch::Receiver<PublisherState> {
        self.channel.watch_state()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Connection state: {:?} -> {:?}", previous, state);
        }
    }

    /// Supervises the broker session until shutdown is requested
    pub async fn run(mut self) {
        info!("Starting connection manager");
        let shutdown = self.shutdown.clone();
        let mut backoff = Backoff::new(self.settings.reconnect_min, self.settings.reconnect_max);

        loop {
            self.set_state(ConnectionState::Connecting);

            let attempt = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = tokio::time::timeout(self.settings.connect_timeout, self.transport.connect()) => result,
            };

            let link = match attempt {
                Ok(Ok(link)) => link,
                Ok(Err(e)) => {
                    warn!("Connect attempt failed: {}", e);
                    if !self.back_off(&mut backoff).await {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    warn!("{}", TransportError::ConnectTimeout(self.settings.connect_timeout));
                    if !self.back_off(&mut backoff).await {
                        break;
                    }
                    continue;
                }
            };

            backoff.reset();
            self.on_connected(link);
            self.set_state(ConnectionState::Connected);

            let end = self.serve().await;
            self.on_disconnected().await;

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(e) => warn!("Broker session lost: {}", e),
            }

            if !self.back_off(&mut backoff).await {
                break;
            }
        }

        self.on_disconnected().await;
        self.transport.close().await;
        self.set_state(ConnectionState::Disconnected);
        info!("Connection manager stopped");
    }

    /// Sleeps out the next backoff delay. Returns false if shutdown came first.
    async fn back_off(&mut self, backoff: &mut Backoff) -> bool {
        self.set_state(ConnectionState::Reconnecting);
        let delay = backoff.next_delay();
        info!("Reconnecting in {:?}", delay);

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn on_connected(&mut self, link: Arc<dyn BusLink>) {
        self.registry.attach(link.clone());

        let stale = self.channel.discard_pending();
        if stale > 0 {
            debug!("Discarded {} item(s) queued before the session came up", stale);
        }
        self.channel.set_online(true);

        if self.publisher.as_ref().is_some_and(PublisherHandle::is_active) {
            error!("Publisher from the previous session is still running, not starting another");
            return;
        }
        match PublisherHandle::spawn(&self.channel, link, self.settings.publisher) {
            Ok(handle) => self.publisher = Some(handle),
            Err(e) => error!("Failed to start publisher: {}", e),
        }
    }

    async fn serve(&mut self) -> SessionEnd {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
                inbound = self.transport.next_message() => match inbound {
                    Ok(message) => match self.registry.dispatch(&message.topic, &message.payload) {
                        Ok(delivered) => debug!("Telemetry on {} delivered to {} subscriber(s)", message.topic, delivered),
                        Err(e) => warn!("{}", e),
                    },
                    Err(e) => return SessionEnd::Lost(e),
                },
            }
        }
    }

    async fn on_disconnected(&mut self) {
        self.channel.set_online(false);
        self.registry.detach();

        if let Some(mut publisher) = self.publisher.take() {
            if let Err(e) = publisher.stop().await {
                error!("Publisher did not stop cleanly: {}", e);
            }
        }

        let dropped = self.channel.discard_pending();
        if dropped > 0 {
            info!("Discarded {} stale message(s)", dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ChassisCommand;
    use crate::mqtt::message_manager::{CommandPayload, PublishItem};
    use crate::mqtt::mock::{mock_transport, MockControl, MockTransport};
    use crate::mqtt::publisher::PublishQueue;
    use crate::mqtt::registry::TelemetrySink;
    use crate::mqtt::PublishError;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct Harness {
        control: MockControl,
        registry: Arc<TopicRegistry>,
        queue: PublishQueue,
        state: watch::Receiver<ConnectionState>,
        publisher_state: watch::Receiver<PublisherState>,
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    }

    fn settings(hz: u32) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_secs(5),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(5),
            publisher: PublisherSettings::from_frequency(hz),
        }
    }

    fn start_with(transport: MockTransport, control: MockControl, registry: Arc<TopicRegistry>, hz: u32) -> Harness {
        let (queue, channel) = PublishChannel::bounded(16);
        let shutdown = CancellationToken::new();
        let manager = ConnectionManager::new(transport, settings(hz), registry.clone(), channel, shutdown.clone());
        let state = manager.watch_state();
        let publisher_state = manager.watch_publisher();

        Harness {
            control,
            registry,
            queue,
            state,
            publisher_state,
            shutdown,
            task: manager.spawn(),
        }
    }

    fn start(hz: u32) -> Harness {
        let (transport, control) = mock_transport();
        start_with(transport, control, Arc::new(TopicRegistry::new()), hz)
    }

    async fn wait_for(state: &mut watch::Receiver<ConnectionState>, wanted: ConnectionState) {
        state.wait_for(|s| *s == wanted).await.unwrap();
    }

    fn chassis_item(topic: &str) -> PublishItem {
        PublishItem::new(topic, CommandPayload::from(&ChassisCommand::default()))
    }

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn settings_from_config() {
        let config = MqttConfig {
            reconnect_ceiling_secs: 0,
            publish_hz: 10,
            ..Default::default()
        };
        let settings = ConnectionSettings::from(&config);
        assert_eq!(settings.reconnect_max, Duration::from_secs(1));
        assert_eq!(settings.publisher.min_interval, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replays_every_topic_once() {
        let (transport, control) = mock_transport();
        let registry = Arc::new(TopicRegistry::new());
        let _t = registry.subscribe("T", TelemetrySink::callback(|_| {}));
        let _u = registry.subscribe("U", TelemetrySink::callback(|_| {}));
        let mut h = start_with(transport, control, registry, 50);

        wait_for(&mut h.state, ConnectionState::Connected).await;
        h.control.drop_session();
        wait_for(&mut h.state, ConnectionState::Reconnecting).await;
        wait_for(&mut h.state, ConnectionState::Connected).await;

        for topic in ["T", "U"] {
            assert_eq!(h.control.log.subscribes_in_session(topic, 1), 1);
            assert_eq!(h.control.log.subscribes_in_session(topic, 2), 1);
        }
        assert_eq!(h.control.connect_attempts(), 2);

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_during_session_goes_straight_to_the_bus() {
        let mut h = start(50);
        wait_for(&mut h.state, ConnectionState::Connected).await;

        let handle = h.registry.subscribe("T", TelemetrySink::callback(|_| {}));
        assert_eq!(h.control.log.subscribes_in_session("T", 1), 1);
        h.registry.unsubscribe(&handle);
        assert_eq!(h.control.log.unsubscribes("T"), 1);

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_items_are_not_sent_after_reconnect() {
        // One send per second keeps the rest of the queue waiting
        let mut h = start(1);
        wait_for(&mut h.state, ConnectionState::Connected).await;

        for _ in 0..5 {
            h.queue.enqueue(chassis_item("cmd")).unwrap();
        }
        h.publisher_state.wait_for(|s| *s == PublisherState::Waiting).await.unwrap();

        h.control.drop_session();
        wait_for(&mut h.state, ConnectionState::Reconnecting).await;
        assert_eq!(h.queue.enqueue(chassis_item("cmd")), Err(PublishError::Offline));

        wait_for(&mut h.state, ConnectionState::Connected).await;
        assert!(h.queue.is_empty());
        h.publisher_state.wait_for(|s| *s == PublisherState::Idle).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        let publishes = h.control.log.publishes();
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0].session, 1);

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_back_off_to_the_ceiling() {
        let (transport, control) = mock_transport();
        control.fail_next_connects(4);
        let mut h = start_with(transport, control, Arc::new(TopicRegistry::new()), 50);

        wait_for(&mut h.state, ConnectionState::Connected).await;

        let times = h.control.connect_times();
        assert_eq!(times.len(), 5);
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        for (gap, secs) in gaps.iter().zip([1u64, 2, 4, 5]) {
            let expected = Duration::from_secs(secs);
            assert!(*gap >= expected && *gap < expected + Duration::from_millis(50), "gap {:?}", gap);
        }

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_terminal() {
        let mut h = start(50);
        wait_for(&mut h.state, ConnectionState::Connected).await;

        h.shutdown.cancel();
        h.task.await.unwrap();

        assert_eq!(*h.state.borrow(), ConnectionState::Disconnected);
        assert_eq!(*h.publisher_state.borrow(), PublisherState::Stopped);
        assert!(h.control.is_closed());

        let started = Instant::now();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(h.control.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_backoff_stops_retrying() {
        let (transport, control) = mock_transport();
        control.fail_next_connects(100);
        let mut h = start_with(transport, control, Arc::new(TopicRegistry::new()), 50);

        wait_for(&mut h.state, ConnectionState::Reconnecting).await;
        h.shutdown.cancel();
        h.task.await.unwrap();

        assert_eq!(*h.state.borrow(), ConnectionState::Disconnected);
        assert_eq!(h.control.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_telemetry_keeps_the_session() {
        let (transport, control) = mock_transport();
        let registry = Arc::new(TopicRegistry::new());
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        registry.subscribe("T", TelemetrySink::Channel(tx));
        let mut h = start_with(transport, control, registry, 50);
        wait_for(&mut h.state, ConnectionState::Connected).await;

        h.control.deliver("T", b"{broken");
        h.control.deliver("T", br#"{"ok": true}"#);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload["ok"], true);
        assert_eq!(*h.state.borrow(), ConnectionState::Connected);
        assert_eq!(h.control.connect_attempts(), 1);

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_see_telemetry_in_arrival_order() {
        let (transport, control) = mock_transport();
        let registry = Arc::new(TopicRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        registry.subscribe(
            "T",
            TelemetrySink::callback(move |msg| sink_seen.lock().unwrap().push(msg.payload["n"].clone())),
        );
        let mut h = start_with(transport, control, registry, 50);
        wait_for(&mut h.state, ConnectionState::Connected).await;

        for n in 0..3 {
            h.control.deliver("T", format!(r#"{{"n": {}}}"#, n).as_bytes());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);

        h.shutdown.cancel();
        h.task.await.unwrap();
    }
}
