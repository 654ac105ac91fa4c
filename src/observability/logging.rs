//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global tracing subscriber
//! - Configure log level from config, overridable via `RUST_LOG`

use std::sync::Once;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Install the fmt subscriber. Later calls are no-ops.
pub fn init_logging(level: &str) {
    INIT.call_once(|| {
        let default_filter = format!("servicekit={level},tower_http={level},{level}");
        let result = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .try_init();

        // Another subscriber (e.g. a test harness) may already be installed.
        if let Err(e) = result {
            eprintln!("logging already initialized: {e}");
        }
    });
}
