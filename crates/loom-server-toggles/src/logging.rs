// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

fn env_filter(config: &LoggingConfig) -> EnvFilter {
	EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(&config.level))
		.unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the configured level.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
	let json = config.json.then(|| tracing_subscriber::fmt::layer().json());
	let compact = (!config.json).then(|| tracing_subscriber::fmt::layer().compact());

	tracing_subscriber::registry()
		.with(env_filter(config))
		.with(json)
		.with(compact)
		.try_init()
		.is_ok()
}
