//! Topic registry
//!
//! Tracks who wants telemetry on which topic and keeps the bus subscriptions
//! in line with that: a topic is subscribed on the bus exactly while it has
//! at least one local subscriber. The registry outlives individual broker
//! sessions; on every new session the full topic set is replayed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::error::DecodeError;
use super::message_manager::TelemetryMessage;
use super::transport::BusLink;

/// Where decoded telemetry for a subscription goes
#[derive(Clone)]
pub enum TelemetrySink {
    /// Runs inline on the connection task, between polls of the broker
    /// session. Keep it short: while it runs no keep-alive, inbound message
    /// or queued publish makes progress. Anything slower, like UI rendering,
    /// belongs behind a [`TelemetrySink::Channel`].
    Callback(Arc<dyn Fn(&TelemetryMessage) + Send + Sync>),
    /// Non-blocking hand-off; a full receiver drops the message with a warning
    Channel(mpsc::Sender<TelemetryMessage>),
}

impl TelemetrySink {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&TelemetryMessage) + Send + Sync + 'static,
    {
        TelemetrySink::Callback(Arc::new(f))
    }

    fn deliver(&self, message: &TelemetryMessage) {
        match self {
            TelemetrySink::Callback(f) => f(message),
            TelemetrySink::Channel(tx) => match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Telemetry receiver for {} is full, dropping message", message.topic);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Telemetry receiver for {} is gone", message.topic);
                }
            },
        }
    }
}

impl fmt::Debug for TelemetrySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetrySink::Callback(_) => write!(f, "TelemetrySink::Callback"),
            TelemetrySink::Channel(_) => write!(f, "TelemetrySink::Channel"),
        }
    }
}

/// Returned by [`TopicRegistry::subscribe`]; pass it back to unsubscribe
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

struct Subscription {
    id: u64,
    sink: TelemetrySink,
}

#[derive(Default)]
struct RegistryInner {
    // Insertion order of the inner vec is delivery order
    topics: HashMap<String, Vec<Subscription>>,
    link: Option<Arc<dyn BusLink>>,
}

#[derive(Default)]
pub struct TopicRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `sink` for `topic`. The bus subscription is issued only for
    /// the first subscriber of a topic, and only while a session is attached.
    pub fn subscribe(&self, topic: &str, sink: TelemetrySink) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();

        let subscribers = inner.topics.entry(topic.to_string()).or_default();
        subscribers.push(Subscription { id, sink });
        let first = subscribers.len() == 1;

        if first {
            if let Some(link) = &inner.link {
                match link.subscribe(topic) {
                    Ok(()) => info!("Subscribed to {}", topic),
                    Err(e) => warn!("Bus subscribe for {} failed, retried on next session: {}", topic, e),
                }
            }
        }
        debug!("Subscriber {} added to {}", id, topic);

        SubscriptionHandle {
            id,
            topic: topic.to_string(),
        }
    }

    /// Removes one subscriber. Returns false if the handle was already
    /// released. The last subscriber leaving releases the bus subscription.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut inner = self.lock();

        let Some(subscribers) = inner.topics.get_mut(&handle.topic) else {
            return false;
        };
        let Some(pos) = subscribers.iter().position(|s| s.id == handle.id) else {
            return false;
        };
        subscribers.remove(pos);

        if subscribers.is_empty() {
            inner.topics.remove(&handle.topic);
            if let Some(link) = &inner.link {
                match link.unsubscribe(&handle.topic) {
                    Ok(()) => info!("Unsubscribed from {}", handle.topic),
                    Err(e) => warn!("Bus unsubscribe for {} failed: {}", handle.topic, e),
                }
            }
        }
        true
    }

    /// Binds a freshly connected session and replays every active topic on
    /// it. Returns the number of topics subscribed.
    pub fn attach(&self, link: Arc<dyn BusLink>) -> usize {
        let mut inner = self.lock();

        let mut replayed = 0;
        for topic in inner.topics.keys() {
            match link.subscribe(topic) {
                Ok(()) => replayed += 1,
                Err(e) => warn!("Resubscribe to {} failed: {}", topic, e),
            }
        }
        inner.link = Some(link);

        info!("Session attached, resubscribed to {} topic(s)", replayed);
        replayed
    }

    pub fn detach(&self) {
        self.lock().link = None;
    }

    /// Decodes an inbound payload and hands it to every subscriber of the
    /// topic in registration order. Returns how many sinks were reached.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<usize, DecodeError> {
        let sinks: Vec<TelemetrySink> = match self.lock().topics.get(topic) {
            Some(subscribers) => subscribers.iter().map(|s| s.sink.clone()).collect(),
            None => return Ok(0),
        };
        if sinks.is_empty() {
            return Ok(0);
        }

        let message = TelemetryMessage::decode(topic, payload)?;
        for sink in &sinks {
            sink.deliver(&message);
        }
        Ok(sinks.len())
    }

    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::mock::{Call, CallLog, MockLink};

    fn counting_sink(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> TelemetrySink {
        TelemetrySink::callback(move |msg| {
            log.lock().unwrap().push(format!("{}:{}", tag, msg.payload));
        })
    }

    fn attached() -> (TopicRegistry, CallLog) {
        let log = CallLog::default();
        let registry = TopicRegistry::new();
        registry.attach(Arc::new(MockLink::new(log.clone(), 1)));
        (registry, log)
    }

    #[test]
    fn bus_subscribe_only_on_first_and_last() {
        let (registry, log) = attached();
        let noop = || TelemetrySink::callback(|_| {});

        let a = registry.subscribe("T", noop());
        let b = registry.subscribe("T", noop());
        assert_eq!(log.subscribes("T"), 1);

        assert!(registry.unsubscribe(&a));
        assert_eq!(log.unsubscribes("T"), 0);
        assert!(registry.unsubscribe(&b));
        assert_eq!(log.unsubscribes("T"), 1);
        assert!(registry.active_topics().is_empty());
    }

    #[test]
    fn unsubscribe_twice_is_a_no_op() {
        let (registry, log) = attached();
        let a = registry.subscribe("T", TelemetrySink::callback(|_| {}));

        assert!(registry.unsubscribe(&a));
        assert!(!registry.unsubscribe(&a));
        assert_eq!(log.unsubscribes("T"), 1);
    }

    #[test]
    fn subscribe_while_detached_waits_for_attach() {
        let registry = TopicRegistry::new();
        let _a = registry.subscribe("T", TelemetrySink::callback(|_| {}));
        let _b = registry.subscribe("U", TelemetrySink::callback(|_| {}));

        let log = CallLog::default();
        assert_eq!(registry.attach(Arc::new(MockLink::new(log.clone(), 1))), 2);
        assert_eq!(log.subscribes("T"), 1);
        assert_eq!(log.subscribes("U"), 1);
    }

    #[test]
    fn dispatch_reaches_every_subscriber_in_order() {
        let (registry, _log) = attached();
        let seen = Arc::new(Mutex::new(Vec::new()));
        registry.subscribe("T", counting_sink(seen.clone(), "first"));
        registry.subscribe("T", counting_sink(seen.clone(), "second"));
        registry.subscribe("U", counting_sink(seen.clone(), "other"));

        assert_eq!(registry.dispatch("T", br#"{"v":1}"#).unwrap(), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![r#"first:{"v":1}"#.to_string(), r#"second:{"v":1}"#.to_string()]
        );
    }

    #[test]
    fn dispatch_without_subscribers_skips_decoding() {
        let (registry, _log) = attached();
        assert_eq!(registry.dispatch("T", b"not json").unwrap(), 0);
    }

    #[test]
    fn malformed_payload_reaches_nobody() {
        let (registry, _log) = attached();
        let seen = Arc::new(Mutex::new(Vec::new()));
        registry.subscribe("T", counting_sink(seen.clone(), "first"));

        assert!(registry.dispatch("T", b"{oops").is_err());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn channel_sink_receives_messages() {
        let (registry, _log) = attached();
        let (tx, mut rx) = mpsc::channel(4);
        registry.subscribe("T", TelemetrySink::Channel(tx));

        registry.dispatch("T", br#"{"rpm": 1200}"#).unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "T");
        assert_eq!(msg.payload["rpm"], 1200);
    }

    #[tokio::test]
    async fn full_channel_sink_never_blocks_dispatch() {
        let (registry, _log) = attached();
        let (tx, mut rx) = mpsc::channel(1);
        registry.subscribe("T", TelemetrySink::Channel(tx));

        registry.dispatch("T", br#"{"seq": 1}"#).unwrap();
        registry.dispatch("T", br#"{"seq": 2}"#).unwrap();

        assert_eq!(rx.recv().await.unwrap().payload["seq"], 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscriber_may_unsubscribe_from_its_own_callback() {
        let (registry, log) = attached();
        let registry = Arc::new(registry);
        let handle: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::default();

        let reg = registry.clone();
        let slot = handle.clone();
        let h = registry.subscribe(
            "T",
            TelemetrySink::callback(move |_| {
                if let Some(h) = slot.lock().unwrap().take() {
                    reg.unsubscribe(&h);
                }
            }),
        );
        *handle.lock().unwrap() = Some(h);

        registry.dispatch("T", b"{}").unwrap();
        assert_eq!(registry.subscriber_count("T"), 0);
        assert_eq!(log.calls().last(), Some(&Call::Unsubscribe { topic: "T".to_string(), session: 1 }));
    }
}
