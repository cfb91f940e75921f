//! Tracing subscriber setup shared by binaries

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` directives are honoured on
/// top of the `info` default. Calling this twice is a no-op.
pub fn init(json: bool) {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let result = if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}
