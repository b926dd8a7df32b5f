//! Tracing initialization.

use infer_core::{Error, Result};
use infer_transform::Settings;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Initializes the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise the level is `debug` when
/// `debug` is set and `info` when it is not.
///
/// ```bash
/// RUST_LOG=infer_transform=trace,infer_compiler=debug my-pipeline
/// ```
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(debug: bool) -> Result<()> {
    let env_filter = create_env_filter(debug)?;

    tracing_subscriber::registry()
        .with(create_fmt_layer())
        .with(env_filter)
        .try_init()
        .map_err(|e| Error::Internal(format!("failed to initialize tracing: {e}")))?;

    let verbose = debug;
    tracing::debug!(verbose, "tracing initialized");
    Ok(())
}

/// Initializes tracing from [`Settings::debug`].
///
/// # Errors
///
/// See [`init_tracing`].
pub fn init_tracing_from(settings: &Settings) -> Result<()> {
    init_tracing(settings.debug)
}

fn create_env_filter(debug: bool) -> Result<EnvFilter> {
    let default = if debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .map_err(|e| Error::Internal(format!("failed to create env filter: {e}")))
}

fn create_fmt_layer() -> fmt::Layer<tracing_subscriber::Registry> {
    fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .with_ansi(true)
}
