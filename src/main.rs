use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use ground_relay::controller::{CollectorHandle, InputNormalizer, Subsystem};
use ground_relay::mqtt::{RumqttTransport, TelemetrySink};
use ground_relay::{logging, Relay, RelayConfig};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ground-relay", about = "Relays operator input to the rover over MQTT")]
struct Args {
    /// Configuration file, defaults to <config dir>/ground-relay/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup()?;

    let bootstrap = logging::bootstrap();
    let config = RelayConfig::load(args.config.as_deref()).await?;
    drop(bootstrap);
    logging::init(&config.log_level);
    info!("Broker {}:{}, publishing at {} Hz", config.mqtt.host, config.mqtt.port, config.mqtt.publish_hz);

    let relay = Relay::start(&config.mqtt, RumqttTransport::new(config.mqtt.clone()));
    let handle = relay.handle();

    // Rendering happens off the connection task
    let (telemetry_tx, mut telemetry_rx) = mpsc::channel(64);
    for subsystem in [Subsystem::Chassis, Subsystem::Manipulator] {
        handle.on_subsystem_telemetry(subsystem, TelemetrySink::Channel(telemetry_tx.clone()));
    }
    drop(telemetry_tx);
    let display = tokio::spawn(async move {
        while let Some(msg) = telemetry_rx.recv().await {
            info!("Telemetry\n{}", msg.render());
        }
    });

    // Gamepad samples: collector thread -> pump task -> relay
    let (sample_tx, mut sample_rx) = mpsc::channel(16);
    let mut collector = match CollectorHandle::spawn(
        config.collector.clone(),
        sample_tx,
        relay.shutdown_token().child_token(),
    ) {
        Ok(collector) => Some(collector),
        Err(e) => {
            warn!("Gamepad input unavailable: {}", e);
            None
        }
    };

    let mut normalizer = InputNormalizer::new(config.devices.clone());
    let pump_handle = handle.clone();
    let pump = tokio::spawn(async move {
        while let Some(samples) = sample_rx.recv().await {
            pump_handle.submit_device_samples(&mut normalizer, &samples);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");

    if let Some(collector) = collector.as_mut() {
        collector.stop();
    }
    relay.shutdown().await?;
    pump.await?;
    display.abort();

    info!("Relay stopped");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}
