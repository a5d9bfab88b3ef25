//! Physical gamepad source
//!
//! Polls every connected gamepad through gilrs on a dedicated thread and emits
//! one `Vec<DeviceSample>` per tick. An empty vector means no pad is connected,
//! which is what hands authority back to the on-screen controls.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use gilrs::{Axis, Button, Event, EventType, Gamepad, Gilrs};
use serde::{Deserialize, Serialize};
use statum::{machine, state};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::normalizer::{ButtonSample, DeviceSample};

// Standard gamepad button order: index in this table is the sample index
const STANDARD_BUTTONS: [Button; 17] = [
    Button::South,
    Button::East,
    Button::West,
    Button::North,
    Button::LeftTrigger,
    Button::RightTrigger,
    Button::LeftTrigger2,
    Button::RightTrigger2,
    Button::Select,
    Button::Start,
    Button::LeftThumb,
    Button::RightThumb,
    Button::DPadUp,
    Button::DPadDown,
    Button::DPadLeft,
    Button::DPadRight,
    Button::Mode,
];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    pub poll_interval_ms: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 20,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Failed to initialize gamepad backend: {0}")]
    InitializationError(String),

    #[error("Collector thread terminated before reporting readiness")]
    ThreadError,
}

#[state]
#[derive(Debug, Clone)]
pub enum CollectionState {
    Initializing,
    Collecting,
}

#[machine]
pub struct GamepadCollector<S: CollectionState> {
    gilrs: Gilrs,
    settings: CollectorSettings,
    sample_sender: mpsc::Sender<Vec<DeviceSample>>,
    cancel: CancellationToken,
}

impl GamepadCollector<Initializing> {
    pub fn create(
        settings: CollectorSettings,
        sample_sender: mpsc::Sender<Vec<DeviceSample>>,
        cancel: CancellationToken,
    ) -> Result<Self, CollectorError> {
        info!("Initializing gilrs controller interface");
        let gilrs = Gilrs::new().map_err(|e| {
            error!("Failed to initialize gilrs: {}", e);
            CollectorError::InitializationError(e.to_string())
        })?;

        Ok(Self::new(gilrs, settings, sample_sender, cancel))
    }

    pub fn initialize(self) -> GamepadCollector<Collecting> {
        let mut count = 0;
        for (id, gamepad) in self.gilrs.gamepads() {
            count += 1;
            info!("  ID: {}, Name: {}, UUID: {:?}", id, gamepad.name(), gamepad.uuid());
        }
        if count == 0 {
            warn!("No gamepad connected, on-screen controls keep authority");
        }

        info!("Gamepad collector initialized, transitioning to Collecting state");
        self.transition()
    }
}

impl GamepadCollector<Collecting> {
    /// Drains pending backend events and reads the current state of every pad
    pub fn poll(&mut self) -> Vec<DeviceSample> {
        while let Some(Event { id, event, .. }) = self.gilrs.next_event() {
            match event {
                EventType::Connected => info!("Gamepad {} connected", id),
                EventType::Disconnected => warn!("Gamepad {} disconnected", id),
                _ => {}
            }
        }

        self.gilrs
            .gamepads()
            .filter(|(_, gamepad)| gamepad.is_connected())
            .map(|(_, gamepad)| sample_gamepad(&gamepad))
            .collect()
    }

    pub fn run_collection_loop(mut self) {
        info!("Starting gamepad collection loop");
        let interval = Duration::from_millis(self.settings.poll_interval_ms.max(1));

        while !self.cancel.is_cancelled() {
            let samples = self.poll();
            match self.sample_sender.try_send(samples) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("Sample consumer is behind, dropping tick");
                }
                Err(TrySendError::Closed(_)) => {
                    info!("Sample consumer gone, stopping gamepad collection");
                    break;
                }
            }
            std::thread::sleep(interval);
        }

        info!("Gamepad collection loop finished");
    }
}

// Gilrs reports stick Y up-positive; samples use screen-down positive Y
fn sample_gamepad(gamepad: &Gamepad<'_>) -> DeviceSample {
    let axes = vec![
        gamepad.value(Axis::LeftStickX),
        -gamepad.value(Axis::LeftStickY),
        gamepad.value(Axis::RightStickX),
        -gamepad.value(Axis::RightStickY),
    ];

    let buttons = STANDARD_BUTTONS
        .iter()
        .map(|&button| match gamepad.button_data(button) {
            Some(data) => ButtonSample {
                pressed: data.is_pressed(),
                value: data.value(),
            },
            None => ButtonSample::default(),
        })
        .collect();

    DeviceSample {
        id: gamepad.name().to_string(),
        axes,
        buttons,
    }
}

/// Handle to the collector thread
pub struct CollectorHandle {
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl CollectorHandle {
    /// Starts the collector thread and waits until the backend is initialized.
    ///
    /// Gilrs is created on the collector thread itself, so its handle never
    /// crosses threads.
    pub fn spawn(
        settings: CollectorSettings,
        sample_sender: mpsc::Sender<Vec<DeviceSample>>,
        cancel: CancellationToken,
    ) -> Result<Self, CollectorError> {
        info!("Spawning gamepad collector with settings: {:?}", settings);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let thread_cancel = cancel.clone();

        let thread = std::thread::Builder::new()
            .name("gamepad-collector".to_string())
            .spawn(move || {
                match GamepadCollector::create(settings, sample_sender, thread_cancel) {
                    Ok(collector) => {
                        let _ = ready_tx.send(Ok(()));
                        collector.initialize().run_collection_loop();
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| CollectorError::InitializationError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                cancel,
                thread: Some(thread),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CollectorError::ThreadError),
        }
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Gamepad collector thread panicked");
            }
        }
    }
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
