//! Log output for applications embedding the engine
//!
//! The engine only emits `tracing` events. Applications that have no
//! subscriber of their own can install this one.

use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Parse a level name; unknown names fall back to INFO
pub fn parse_level(name: &str) -> Level {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install a global fmt subscriber. `RUST_LOG` wins over `default_level`.
///
/// Fails if a global subscriber is already set.
pub fn init(default_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(parse_level(default_level).into()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
