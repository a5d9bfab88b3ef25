//! Bounded publish queue and the rate-limited publisher task
//!
//! Producers push through a cloneable [`PublishQueue`] and never wait. One
//! publisher task per live session drains the queue in FIFO order and keeps
//! consecutive bus sends at least `min_interval` apart.
//!
//! Producers that sample faster than the publish rate (the gamepad poll loop)
//! go through a [`PendingSlot`]: at most one of their items sits in the queue
//! at a time, so what gets sent is never older than one poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{PublishError, PublisherError};
use super::message_manager::PublishItem;
use super::transport::BusLink;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublisherState {
    /// Queue empty, waiting for the next item
    #[default]
    Idle,
    Draining,
    /// Holding an item until the minimum interval has elapsed
    Waiting,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherSettings {
    pub min_interval: Duration,
}

impl PublisherSettings {
    pub fn from_frequency(hz: u32) -> Self {
        Self {
            min_interval: Duration::from_secs(1) / hz.max(1),
        }
    }
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self::from_frequency(50)
    }
}

/// Marks whether a producer already has an item waiting in the queue
#[derive(Debug, Clone, Default)]
pub struct PendingSlot(Arc<AtomicBool>);

impl PendingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn claim(&self) -> Option<SlotGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotGuard(self.0.clone()))
    }
}

// Frees the slot when the queued item is taken out, discarded or refused
#[derive(Debug)]
struct SlotGuard(Arc<AtomicBool>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
struct Queued {
    item: PublishItem,
    slot: Option<SlotGuard>,
}

impl Queued {
    fn into_item(self) -> PublishItem {
        let Queued { item, slot } = self;
        drop(slot);
        item
    }
}

/// Producer side of the publish queue
#[derive(Debug, Clone)]
pub struct PublishQueue {
    sender: mpsc::Sender<Queued>,
    online: Arc<AtomicBool>,
}

impl PublishQueue {
    /// Appends an item without waiting. Refused while offline, and a full
    /// queue drops the new item.
    pub fn enqueue(&self, item: PublishItem) -> Result<(), PublishError> {
        if !self.is_online() {
            debug!("Offline, dropping message for {}", item.topic);
            return Err(PublishError::Offline);
        }
        self.send(Queued { item, slot: None })
    }

    /// Like [`enqueue`](Self::enqueue), but skips the item while `slot`
    /// still has one waiting. Returns whether the item was queued.
    pub fn enqueue_in_slot(&self, item: PublishItem, slot: &PendingSlot) -> Result<bool, PublishError> {
        if !self.is_online() {
            debug!("Offline, dropping message for {}", item.topic);
            return Err(PublishError::Offline);
        }
        let Some(guard) = slot.claim() else {
            return Ok(false);
        };
        self.send(Queued {
            item,
            slot: Some(guard),
        })?;
        Ok(true)
    }

    fn send(&self, queued: Queued) -> Result<(), PublishError> {
        match self.sender.try_send(queued) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(queued)) => {
                let capacity = self.sender.max_capacity();
                warn!(
                    "Publish queue is full ({} items), dropping message for {}",
                    capacity, queued.item.topic
                );
                Err(PublishError::Overflow { capacity })
            }
            Err(TrySendError::Closed(_)) => Err(PublishError::Closed),
        }
    }

    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

/// Consumer side of the publish queue, owned by the connection manager
///
/// The receiver sits behind an async mutex; a running publisher holds that
/// lock for its whole lifetime, which is what keeps it the only one.
#[derive(Debug)]
pub struct PublishChannel {
    receiver: Arc<Mutex<mpsc::Receiver<Queued>>>,
    online: Arc<AtomicBool>,
    state: Arc<watch::Sender<PublisherState>>,
}

impl PublishChannel {
    pub fn bounded(capacity: usize) -> (PublishQueue, PublishChannel) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let online = Arc::new(AtomicBool::new(false));
        let (state, _) = watch::channel(PublisherState::Idle);

        let queue = PublishQueue {
            sender,
            online: online.clone(),
        };
        let channel = PublishChannel {
            receiver: Arc::new(Mutex::new(receiver)),
            online,
            state: Arc::new(state),
        };
        (queue, channel)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn watch_state(&self) -> watch::Receiver<PublisherState> {
        self.state.subscribe()
    }

    /// Drops everything still queued. Only possible while no publisher
    /// holds the queue; returns the number of discarded items.
    pub fn discard_pending(&self) -> usize {
        let Ok(mut receiver) = self.receiver.try_lock() else {
            warn!("Publisher still owns the queue, nothing discarded");
            return 0;
        };

        let mut discarded = 0;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

/// Handle to a running publisher task
#[derive(Debug)]
pub struct PublisherHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<u64>>,
}

impl PublisherHandle {
    /// Starts draining `channel` onto `link`. Fails if another publisher is
    /// still attached to the same queue.
    pub fn spawn(
        channel: &PublishChannel,
        link: Arc<dyn BusLink>,
        settings: PublisherSettings,
    ) -> Result<Self, PublisherError> {
        let receiver = channel
            .receiver
            .clone()
            .try_lock_owned()
            .map_err(|_| PublisherError::AlreadyRunning)?;

        let cancel = CancellationToken::new();
        let publisher = Publisher {
            receiver,
            link,
            settings,
            cancel: cancel.clone(),
            state: channel.state.clone(),
        };

        info!("Starting publisher, min interval {:?}", settings.min_interval);
        let task = tokio::spawn(publisher.run());

        Ok(Self {
            cancel,
            task: Some(task),
        })
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the task and waits for it. Returns the number of items sent.
    pub async fn stop(&mut self) -> Result<u64, PublisherError> {
        self.cancel.cancel();

        let Some(task) = self.task.take() else {
            debug!("Publisher already stopped");
            return Ok(0);
        };

        match task.await {
            Ok(sent) => {
                debug!("Publisher stopped after {} message(s)", sent);
                Ok(sent)
            }
            Err(e) => {
                error!("Publisher task panicked: {}", e);
                Err(PublisherError::Panicked(e.to_string()))
            }
        }
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Publisher {
    receiver: OwnedMutexGuard<mpsc::Receiver<Queued>>,
    link: Arc<dyn BusLink>,
    settings: PublisherSettings,
    cancel: CancellationToken,
    state: Arc<watch::Sender<PublisherState>>,
}

impl Publisher {
    fn set_state(&self, state: PublisherState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    async fn next_item(&mut self) -> Option<PublishItem> {
        match self.receiver.try_recv() {
            Ok(queued) => return Some(queued.into_item()),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }

        self.set_state(PublisherState::Idle);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            queued = self.receiver.recv() => queued.map(Queued::into_item),
        }
    }

    async fn run(mut self) -> u64 {
        let mut sent: u64 = 0;
        let mut last_send: Option<Instant> = None;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let Some(item) = self.next_item().await else {
                break;
            };
            self.set_state(PublisherState::Draining);

            if let Some(last) = last_send {
                let due = last + self.settings.min_interval;
                if Instant::now() < due {
                    self.set_state(PublisherState::Waiting);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep_until(due) => {}
                    }
                    self.set_state(PublisherState::Draining);
                }
            }

            let payload = match item.payload.to_json() {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to serialize payload for {}: {}", item.topic, e);
                    continue;
                }
            };

            match self.link.publish(&item.topic, payload) {
                Ok(()) => {
                    last_send = Some(Instant::now());
                    sent += 1;
                }
                Err(e) => warn!("Publish to {} failed: {}", item.topic, e),
            }
        }

        self.set_state(PublisherState::Stopped);
        info!("Publisher finished, {} message(s) sent", sent);
        sent
    }
}
