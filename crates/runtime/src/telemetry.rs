//! Tracing initialization for applications and tests.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize console logging with an `RUST_LOG`-driven filter.
///
/// Safe to call more than once; later calls are no-ops, which keeps test
/// suites that all want logging from fighting over the global subscriber.
pub fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(false),
        )
        .try_init();
}
