// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Layered configuration for the toggles server.
//!
//! Precedence (highest to lowest):
//! 1. Environment variables (`LOOM_TOGGLES_*`)
//! 2. Config file (TOML)
//! 3. Built-in defaults
//!
//! Each section has a resolved struct and a `*Layer` of optional fields that can be
//! merged before being finalized.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use loom_toggles_core::{FlagDefinition, INVALIDATION_TOPIC, PLATFORM_ONLY_FLAGS};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config file {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("invalid value for {key}: {message}")]
	InvalidValue { key: String, message: String },
}

/// What the resolver does when an override lookup fails with an infrastructure error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideFailurePolicy {
	/// Return the error to the caller.
	#[default]
	Propagate,
	/// Log it and continue as if no override exists.
	TreatAsAbsent,
}

impl FromStr for OverrideFailurePolicy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"propagate" => Ok(OverrideFailurePolicy::Propagate),
			"treat_as_absent" => Ok(OverrideFailurePolicy::TreatAsAbsent),
			other => Err(format!("unknown override failure policy '{other}'")),
		}
	}
}

/// Fully resolved toggles configuration.
#[derive(Debug, Clone, Default)]
pub struct TogglesConfig {
	pub database: DatabaseConfig,
	pub cache: CacheConfig,
	pub store: StoreConfig,
	pub exposure: ExposureConfig,
	pub bus: BusConfig,
	pub platform: PlatformConfig,
	pub evaluation: EvaluationConfig,
	pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
	pub url: String,
}

impl Default for DatabaseConfig {
	fn default() -> Self {
		Self {
			url: "sqlite:./loom-toggles.db".to_string(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
	/// Bounds staleness; invalidation keeps entries correct.
	pub ttl: Duration,
	pub max_entries: usize,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			ttl: Duration::from_secs(30),
			max_entries: 10_000,
		}
	}
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
	/// Upper bound on each cache or store call.
	pub timeout: Duration,
	pub override_failure: OverrideFailurePolicy,
}

impl Default for StoreConfig {
	fn default() -> Self {
		Self {
			timeout: Duration::from_millis(500),
			override_failure: OverrideFailurePolicy::Propagate,
		}
	}
}

#[derive(Debug, Clone)]
pub struct ExposureConfig {
	pub max_batch_size: usize,
	pub flush_interval: Duration,
	pub max_queue_size: usize,
}

impl Default for ExposureConfig {
	fn default() -> Self {
		Self {
			max_batch_size: 100,
			flush_interval: Duration::from_secs(10),
			max_queue_size: 10_000,
		}
	}
}

#[derive(Debug, Clone)]
pub struct BusConfig {
	pub channel_capacity: usize,
	pub topic: String,
}

impl Default for BusConfig {
	fn default() -> Self {
		Self {
			channel_capacity: 256,
			topic: INVALIDATION_TOPIC.to_string(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct PlatformConfig {
	pub platform_only_flags: Vec<String>,
}

impl Default for PlatformConfig {
	fn default() -> Self {
		Self {
			platform_only_flags: PLATFORM_ONLY_FLAGS.iter().map(|k| k.to_string()).collect(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct EvaluationConfig {
	/// Used when a batch evaluation names no environment.
	pub default_environment: String,
}

impl Default for EvaluationConfig {
	fn default() -> Self {
		Self {
			default_environment: "prod".to_string(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
	pub level: String,
	pub json: bool,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
			json: false,
		}
	}
}

/// Partial configuration, as read from one source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TogglesConfigLayer {
	#[serde(default)]
	pub database: Option<DatabaseConfigLayer>,
	#[serde(default)]
	pub cache: Option<CacheConfigLayer>,
	#[serde(default)]
	pub store: Option<StoreConfigLayer>,
	#[serde(default)]
	pub exposure: Option<ExposureConfigLayer>,
	#[serde(default)]
	pub bus: Option<BusConfigLayer>,
	#[serde(default)]
	pub platform: Option<PlatformConfigLayer>,
	#[serde(default)]
	pub evaluation: Option<EvaluationConfigLayer>,
	#[serde(default)]
	pub logging: Option<LoggingConfigLayer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfigLayer {
	#[serde(default)]
	pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfigLayer {
	#[serde(default)]
	pub ttl_secs: Option<u64>,
	#[serde(default)]
	pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfigLayer {
	#[serde(default)]
	pub timeout_ms: Option<u64>,
	#[serde(default)]
	pub override_failure: Option<OverrideFailurePolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExposureConfigLayer {
	#[serde(default)]
	pub max_batch_size: Option<usize>,
	#[serde(default)]
	pub flush_interval_secs: Option<u64>,
	#[serde(default)]
	pub max_queue_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BusConfigLayer {
	#[serde(default)]
	pub channel_capacity: Option<usize>,
	#[serde(default)]
	pub topic: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlatformConfigLayer {
	#[serde(default)]
	pub platform_only_flags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvaluationConfigLayer {
	#[serde(default)]
	pub default_environment: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfigLayer {
	#[serde(default)]
	pub level: Option<String>,
	#[serde(default)]
	pub json: Option<bool>,
}

fn take<T>(slot: &mut Option<T>, other: Option<T>) {
	if other.is_some() {
		*slot = other;
	}
}

fn merge_section<T>(slot: &mut Option<T>, other: Option<T>, merge: impl FnOnce(&mut T, T)) {
	match (slot.as_mut(), other) {
		(Some(current), Some(other)) => merge(current, other),
		(None, Some(other)) => *slot = Some(other),
		(_, None) => {}
	}
}

impl TogglesConfigLayer {
	/// Overlays `other` on top of `self`; fields set in `other` win.
	pub fn merge(&mut self, other: TogglesConfigLayer) {
		merge_section(&mut self.database, other.database, |a, b| take(&mut a.url, b.url));
		merge_section(&mut self.cache, other.cache, |a, b| {
			take(&mut a.ttl_secs, b.ttl_secs);
			take(&mut a.max_entries, b.max_entries);
		});
		merge_section(&mut self.store, other.store, |a, b| {
			take(&mut a.timeout_ms, b.timeout_ms);
			take(&mut a.override_failure, b.override_failure);
		});
		merge_section(&mut self.exposure, other.exposure, |a, b| {
			take(&mut a.max_batch_size, b.max_batch_size);
			take(&mut a.flush_interval_secs, b.flush_interval_secs);
			take(&mut a.max_queue_size, b.max_queue_size);
		});
		merge_section(&mut self.bus, other.bus, |a, b| {
			take(&mut a.channel_capacity, b.channel_capacity);
			take(&mut a.topic, b.topic);
		});
		merge_section(&mut self.platform, other.platform, |a, b| {
			take(&mut a.platform_only_flags, b.platform_only_flags);
		});
		merge_section(&mut self.evaluation, other.evaluation, |a, b| {
			take(&mut a.default_environment, b.default_environment);
		});
		merge_section(&mut self.logging, other.logging, |a, b| {
			take(&mut a.level, b.level);
			take(&mut a.json, b.json);
		});
	}

	/// Resolves defaults and validates the result.
	pub fn finalize(self) -> Result<TogglesConfig, ConfigError> {
		let defaults = TogglesConfig::default();

		let database = self.database.unwrap_or_default();
		let cache = self.cache.unwrap_or_default();
		let store = self.store.unwrap_or_default();
		let exposure = self.exposure.unwrap_or_default();
		let bus = self.bus.unwrap_or_default();
		let platform = self.platform.unwrap_or_default();
		let evaluation = self.evaluation.unwrap_or_default();
		let logging = self.logging.unwrap_or_default();

		let config = TogglesConfig {
			database: DatabaseConfig {
				url: database.url.unwrap_or(defaults.database.url),
			},
			cache: CacheConfig {
				ttl: cache
					.ttl_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.cache.ttl),
				max_entries: cache.max_entries.unwrap_or(defaults.cache.max_entries),
			},
			store: StoreConfig {
				timeout: store
					.timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.store.timeout),
				override_failure: store
					.override_failure
					.unwrap_or(defaults.store.override_failure),
			},
			exposure: ExposureConfig {
				max_batch_size: exposure
					.max_batch_size
					.unwrap_or(defaults.exposure.max_batch_size),
				flush_interval: exposure
					.flush_interval_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.exposure.flush_interval),
				max_queue_size: exposure
					.max_queue_size
					.unwrap_or(defaults.exposure.max_queue_size),
			},
			bus: BusConfig {
				channel_capacity: bus.channel_capacity.unwrap_or(defaults.bus.channel_capacity),
				topic: bus.topic.unwrap_or(defaults.bus.topic),
			},
			platform: PlatformConfig {
				platform_only_flags: platform
					.platform_only_flags
					.unwrap_or(defaults.platform.platform_only_flags),
			},
			evaluation: EvaluationConfig {
				default_environment: evaluation
					.default_environment
					.unwrap_or(defaults.evaluation.default_environment),
			},
			logging: LoggingConfig {
				level: logging.level.unwrap_or(defaults.logging.level),
				json: logging.json.unwrap_or(defaults.logging.json),
			},
		};

		config.validate()?;
		Ok(config)
	}
}

impl TogglesConfig {
	fn validate(&self) -> Result<(), ConfigError> {
		let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
			key: key.to_string(),
			message: message.to_string(),
		};

		if self.cache.ttl.is_zero() {
			return Err(invalid("cache.ttl_secs", "must be greater than zero"));
		}
		if self.store.timeout.is_zero() {
			return Err(invalid("store.timeout_ms", "must be greater than zero"));
		}
		if self.exposure.max_batch_size == 0 {
			return Err(invalid("exposure.max_batch_size", "must be greater than zero"));
		}
		if self.exposure.max_queue_size < self.exposure.max_batch_size {
			return Err(invalid(
				"exposure.max_queue_size",
				"must be at least exposure.max_batch_size",
			));
		}
		if self.bus.channel_capacity == 0 {
			return Err(invalid("bus.channel_capacity", "must be greater than zero"));
		}
		if !FlagDefinition::validate_environment(&self.evaluation.default_environment) {
			return Err(invalid(
				"evaluation.default_environment",
				"must be lowercase alphanumeric with underscores",
			));
		}
		Ok(())
	}
}

/// Reads a TOML layer. A missing file is an empty layer.
pub fn load_toml_layer(path: &Path) -> Result<TogglesConfigLayer, ConfigError> {
	if !path.exists() {
		debug!(path = %path.display(), "config file not found, skipping");
		return Ok(TogglesConfigLayer::default());
	}

	debug!(path = %path.display(), "loading config file");
	let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
		path: path.to_path_buf(),
		source: e,
	})?;

	toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
		path: path.to_path_buf(),
		source: e,
	})
}

/// Reads the `LOOM_TOGGLES_*` environment variables.
pub fn load_env_layer() -> Result<TogglesConfigLayer, ConfigError> {
	env_layer_from(|name| std::env::var(name).ok())
}

fn env_layer_from(
	lookup: impl Fn(&str) -> Option<String>,
) -> Result<TogglesConfigLayer, ConfigError> {
	let var = |name: &str| lookup(name).filter(|s| !s.is_empty());
	let parsed = |name: &str| -> Result<Option<u64>, ConfigError> {
		var(name)
			.map(|v| {
				v.parse().map_err(|_| ConfigError::InvalidValue {
					key: name.to_string(),
					message: format!("invalid integer value '{v}'"),
				})
			})
			.transpose()
	};
	let parsed_usize = |name: &str| -> Result<Option<usize>, ConfigError> {
		parsed(name)?
			.map(|v| {
				usize::try_from(v).map_err(|_| ConfigError::InvalidValue {
					key: name.to_string(),
					message: format!("value {v} is out of range"),
				})
			})
			.transpose()
	};

	let override_failure = var("LOOM_TOGGLES_OVERRIDE_FAILURE")
		.map(|v| {
			v.parse().map_err(|message| ConfigError::InvalidValue {
				key: "LOOM_TOGGLES_OVERRIDE_FAILURE".to_string(),
				message,
			})
		})
		.transpose()?;

	let platform_only_flags = var("LOOM_TOGGLES_PLATFORM_ONLY_FLAGS").map(|v| {
		v.split(',')
			.map(str::trim)
			.filter(|k| !k.is_empty())
			.map(str::to_string)
			.collect()
	});

	Ok(TogglesConfigLayer {
		database: Some(DatabaseConfigLayer {
			url: var("LOOM_TOGGLES_DATABASE_URL"),
		}),
		cache: Some(CacheConfigLayer {
			ttl_secs: parsed("LOOM_TOGGLES_CACHE_TTL_SECS")?,
			max_entries: parsed_usize("LOOM_TOGGLES_CACHE_MAX_ENTRIES")?,
		}),
		store: Some(StoreConfigLayer {
			timeout_ms: parsed("LOOM_TOGGLES_STORE_TIMEOUT_MS")?,
			override_failure,
		}),
		exposure: Some(ExposureConfigLayer {
			max_batch_size: parsed_usize("LOOM_TOGGLES_EXPOSURE_MAX_BATCH_SIZE")?,
			flush_interval_secs: parsed("LOOM_TOGGLES_EXPOSURE_FLUSH_INTERVAL_SECS")?,
			max_queue_size: parsed_usize("LOOM_TOGGLES_EXPOSURE_MAX_QUEUE_SIZE")?,
		}),
		bus: Some(BusConfigLayer {
			channel_capacity: parsed_usize("LOOM_TOGGLES_BUS_CHANNEL_CAPACITY")?,
			topic: var("LOOM_TOGGLES_BUS_TOPIC"),
		}),
		platform: Some(PlatformConfigLayer {
			platform_only_flags,
		}),
		evaluation: Some(EvaluationConfigLayer {
			default_environment: var("LOOM_TOGGLES_DEFAULT_ENVIRONMENT"),
		}),
		logging: Some(LoggingConfigLayer {
			level: var("LOOM_TOGGLES_LOG_LEVEL"),
			json: var("LOOM_TOGGLES_LOG_JSON").map(|v| v.eq_ignore_ascii_case("true") || v == "1"),
		}),
	})
}

/// Loads defaults, then the optional TOML file, then the environment.
pub fn load_config(config_path: Option<&Path>) -> Result<TogglesConfig, ConfigError> {
	let mut merged = TogglesConfigLayer::default();
	if let Some(path) = config_path {
		merged.merge(load_toml_layer(path)?);
	}
	merged.merge(load_env_layer()?);
	merged.finalize()
}
