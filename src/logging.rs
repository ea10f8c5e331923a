//! Tracing subscriber setup for the `rig` binary.

use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set. Calling this twice
/// (for example from tests) leaves the first subscriber in place.
pub fn init_tracing(app: &ApplicationConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("compression_rig={0},rig={0}", app.log_level)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = if app.log_format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if let Err(e) = result {
        tracing::debug!("tracing subscriber already installed: {e}");
    }
}
