//! Log output for the router and the CLI.
//!
//! Routing decisions are `debug` events, startup and key registrations are
//! `info`, key-less writes to a sharded type are `warn`. The `[logging]`
//! section picks the level and format; `SHARDLINE_LOG` overrides the level
//! with any `EnvFilter` directive, e.g.
//! `SHARDLINE_LOG=warn,shardline_storage::sharding=debug`.

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_ENV: &str = "SHARDLINE_LOG";

/// Compact text logs at `info`. Only the first call in a process installs
/// a subscriber.
pub fn init() {
    init_with_default("info");
}

/// Compact text logs at `default_level` unless `SHARDLINE_LOG` is set.
pub fn init_with_default(default_level: &str) {
    let filter = env_filter(default_level);

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init();
}

/// One JSON object per event, for log shippers.
pub fn init_json(default_level: &str) {
    let filter = env_filter(default_level);

    let _ = fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .try_init();
}

/// Installs the subscriber described by `[logging]`.
pub fn init_from_config(config: &LoggingConfig) {
    if config.json {
        init_json(&config.level);
    } else {
        init_with_default(&config.level);
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
}
