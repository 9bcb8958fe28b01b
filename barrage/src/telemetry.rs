//! Tracing subscriber setup.
//!
//! Log verbosity comes from `RUST_LOG` and defaults to `info`, e.g.
//! `RUST_LOG=barrage=debug`.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global fmt subscriber.
///
/// Fails if a global subscriber is already set, which callers embedding the
/// engine in a larger application may ignore.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    info!("Telemetry initialized");
    Ok(())
}
