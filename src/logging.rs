//! Log output setup
//!
//! Logging comes up in two steps. Configuration loading already logs, but the
//! configured level is only known afterwards, so [`bootstrap`] installs an
//! `info` subscriber for the current thread first and [`init`] replaces it
//! with the global one once the config is in.

use tracing::dispatcher::DefaultGuard;
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const BOOTSTRAP_LEVEL: &str = "info";

// RUST_LOG takes precedence over the configured level
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

pub fn subscriber<W>(level: &str, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    FmtSubscriber::builder()
        .with_env_filter(filter(level))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(writer)
        .pretty()
        .finish()
}

/// Thread-local subscriber until [`init`] runs. Drop the guard before
/// calling it.
pub fn bootstrap() -> DefaultGuard {
    subscriber(BOOTSTRAP_LEVEL, std::io::stdout).set_default()
}

pub fn init(level: &str) {
    subscriber(level, std::io::stdout).init();
}
