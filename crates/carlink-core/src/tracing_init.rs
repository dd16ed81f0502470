//! Shared tracing/logging initialization.
//!
//! The `carlink` binary and the integration harnesses use the same pattern for
//! setting up `tracing_subscriber` with an env-filter and optional JSON output.
//! Output goes to stderr so that stdout stays free for user-facing results.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"carlink_channel=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Build the default filter directive for a configured log level.
///
/// Scopes the level to the `carlink` crates so dependency noise stays at `warn`.
pub fn default_filter(level: &str) -> String {
    format!(
        "warn,carlink_core={level},carlink_crypto={level},carlink_channel={level},carlink_cli={level},carlink={level}"
    )
}
