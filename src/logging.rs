// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use tracing_subscriber::EnvFilter;

/// Environment variable holding a plain log level, used when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV_KEY: &str = "LOG_LEVEL";

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set, then `LOG_LEVEL`, then `info`. Calling it more than
/// once is harmless.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var(LOG_LEVEL_ENV_KEY).unwrap_or_default();
        EnvFilter::new(level_directive(&level))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn level_directive(level: &str) -> &'static str {
    match level.trim().to_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}
