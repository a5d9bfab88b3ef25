//! Scripted in-memory transport for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::error::TransportError;
use super::transport::{BusLink, BusTransport, InboundMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Publish(PublishRecord),
    Subscribe { topic: String, session: u64 },
    Unsubscribe { topic: String, session: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub at: Instant,
    pub session: u64,
}

/// Every request any link made, in order
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn record(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn publishes(&self) -> Vec<PublishRecord> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Publish(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn subscribes(&self, topic: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Subscribe { topic: t, .. } if t == topic))
            .count()
    }

    pub fn subscribes_in_session(&self, topic: &str, session: u64) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Subscribe { topic: t, session: s } if t == topic && *s == session))
            .count()
    }

    pub fn unsubscribes(&self, topic: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Unsubscribe { topic: t, .. } if t == topic))
            .count()
    }
}

pub struct MockLink {
    log: CallLog,
    session: u64,
    alive: AtomicBool,
}

impl MockLink {
    pub fn new(log: CallLog, session: u64) -> Self {
        Self {
            log,
            session,
            alive: AtomicBool::new(true),
        }
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Request("session gone".to_string()))
        }
    }
}

impl BusLink for MockLink {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.check()?;
        self.log.record(Call::Publish(PublishRecord {
            topic: topic.to_string(),
            payload,
            at: Instant::now(),
            session: self.session,
        }));
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.check()?;
        self.log.record(Call::Subscribe {
            topic: topic.to_string(),
            session: self.session,
        });
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.check()?;
        self.log.record(Call::Unsubscribe {
            topic: topic.to_string(),
            session: self.session,
        });
        Ok(())
    }
}

#[derive(Debug)]
pub enum MockEvent {
    Message(InboundMessage),
    /// Ends the current session as if the broker went away
    Drop,
}

/// Test side of a [`MockTransport`]
#[derive(Clone)]
pub struct MockControl {
    pub log: CallLog,
    fail_connects: Arc<AtomicUsize>,
    connects: Arc<Mutex<Vec<Instant>>>,
    closed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<MockEvent>,
}

impl MockControl {
    /// The next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connects.lock().unwrap().clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        let _ = self.events.send(MockEvent::Message(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        }));
    }

    pub fn drop_session(&self) {
        let _ = self.events.send(MockEvent::Drop);
    }
}

pub struct MockTransport {
    log: CallLog,
    fail_connects: Arc<AtomicUsize>,
    connects: Arc<Mutex<Vec<Instant>>>,
    closed: Arc<AtomicBool>,
    events: mpsc::UnboundedReceiver<MockEvent>,
    session: u64,
    current: Option<Arc<MockLink>>,
}

pub fn mock_transport() -> (MockTransport, MockControl) {
    let log = CallLog::default();
    let fail_connects = Arc::new(AtomicUsize::new(0));
    let connects = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::unbounded_channel();

    let control = MockControl {
        log: log.clone(),
        fail_connects: fail_connects.clone(),
        connects: connects.clone(),
        closed: closed.clone(),
        events: tx,
    };
    let transport = MockTransport {
        log,
        fail_connects,
        connects,
        closed,
        events: rx,
        session: 0,
        current: None,
    };
    (transport, control)
}

#[async_trait]
impl BusTransport for MockTransport {
    async fn connect(&mut self) -> Result<Arc<dyn BusLink>, TransportError> {
        self.connects.lock().unwrap().push(Instant::now());

        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Connect("scripted failure".to_string()));
        }

        self.session += 1;
        let link = Arc::new(MockLink::new(self.log.clone(), self.session));
        self.current = Some(link.clone());
        Ok(link)
    }

    async fn next_message(&mut self) -> Result<InboundMessage, TransportError> {
        match self.events.recv().await {
            Some(MockEvent::Message(message)) => Ok(message),
            Some(MockEvent::Drop) => {
                if let Some(link) = self.current.take() {
                    link.kill();
                }
                Err(TransportError::ConnectionLost("scripted drop".to_string()))
            }
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        if let Some(link) = self.current.take() {
            link.kill();
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}
