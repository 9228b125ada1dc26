// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Public facade: batch evaluation, versioned flag writes and guarded override changes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use loom_toggles_core::{
	EvaluationContext, FlagDefinition, Override, OverridePatch, OverrideScope, OverrideValue,
	Resolution, Rule, ValidationError,
};

use crate::batch::BatchEvaluator;
use crate::bus::{BroadcastBus, InvalidationListener};
use crate::cache::InMemoryCache;
use crate::cache_aside::{CacheAside, CacheAsideSettings};
use crate::config::TogglesConfig;
use crate::error::{Result, TogglesServerError};
use crate::exposure::{BatchingExposureSink, TracingExposureSink};
use crate::guard::PlatformGuard;
use crate::metrics::TogglesMetrics;
use crate::pool::create_pool;
use crate::repository::{
	sweep_expired_overrides, FlagWrite, SqliteFlagStore, SqliteOverrideStore,
};
use crate::resolver::OverrideResolver;

struct Background {
	exposure: Arc<BatchingExposureSink>,
	flusher: JoinHandle<()>,
	listener: JoinHandle<()>,
}

pub struct TogglesService {
	layer: CacheAside,
	evaluator: BatchEvaluator,
	guard: PlatformGuard,
	metrics: Arc<TogglesMetrics>,
	background: Option<Background>,
}

impl TogglesService {
	pub fn new(
		layer: CacheAside,
		evaluator: BatchEvaluator,
		guard: PlatformGuard,
		metrics: Arc<TogglesMetrics>,
	) -> Self {
		Self {
			layer,
			evaluator,
			guard,
			metrics,
			background: None,
		}
	}

	/// Builds the SQLite-backed service with an in-process cache, bus and batched
	/// tracing exposure sink. Spawns the invalidation listener and exposure flusher.
	pub async fn from_config(config: &TogglesConfig) -> Result<Self> {
		let pool = create_pool(&config.database.url).await?;
		let metrics = Arc::new(
			TogglesMetrics::new().map_err(|e| TogglesServerError::Internal(e.to_string()))?,
		);

		let cache = Arc::new(InMemoryCache::new(config.cache.max_entries));
		let bus = Arc::new(BroadcastBus::new(config.bus.channel_capacity));
		let listener = InvalidationListener::spawn(&bus, &config.bus.topic, cache.clone()).await;

		let layer = CacheAside::new(
			Arc::new(SqliteFlagStore::new(pool.clone())),
			Arc::new(SqliteOverrideStore::new(pool)),
			cache,
			bus,
			metrics.clone(),
			CacheAsideSettings {
				ttl: config.cache.ttl,
				timeout: config.store.timeout,
				topic: config.bus.topic.clone(),
			},
		);

		let (exposure, flusher) = BatchingExposureSink::spawn(
			config.exposure.clone(),
			Arc::new(TracingExposureSink),
			metrics.clone(),
		);

		let resolver = OverrideResolver::new(layer.clone(), metrics.clone(), config.store.override_failure);
		let evaluator = BatchEvaluator::new(
			resolver,
			exposure.clone(),
			metrics.clone(),
			config.evaluation.default_environment.clone(),
		);
		let guard = PlatformGuard::new(config.platform.platform_only_flags.iter().cloned());

		info!(
			default_environment = %config.evaluation.default_environment,
			cache_ttl_secs = config.cache.ttl.as_secs(),
			"Toggles service ready"
		);

		let mut service = Self::new(layer, evaluator, guard, metrics);
		service.background = Some(Background {
			exposure,
			flusher,
			listener,
		});
		Ok(service)
	}

	pub fn metrics(&self) -> &TogglesMetrics {
		&self.metrics
	}

	pub async fn evaluate_many<K: AsRef<str>>(
		&self,
		environment: Option<&str>,
		keys: &[K],
		ctx: &EvaluationContext,
	) -> Result<HashMap<String, bool>> {
		self.evaluator.evaluate_many(environment, keys, ctx).await
	}

	pub async fn evaluate_many_detailed<K: AsRef<str>>(
		&self,
		environment: Option<&str>,
		keys: &[K],
		ctx: &EvaluationContext,
	) -> Result<HashMap<String, Resolution>> {
		self.evaluator
			.evaluate_many_detailed(environment, keys, ctx)
			.await
	}

	/// Versioned write. Fails with `VersionConflict` when `expected_version` is stale.
	#[instrument(skip(self, rules), fields(environment = %environment, key = %key, rule_count = rules.len()))]
	pub async fn write_flag(
		&self,
		environment: &str,
		key: &str,
		enabled_default: bool,
		rules: Vec<Rule>,
		actor_id: Option<&str>,
		expected_version: Option<i64>,
	) -> Result<FlagDefinition> {
		FlagDefinition::validate_write(environment, key, &rules)?;

		let flag = self
			.layer
			.write_flag(
				&FlagWrite {
					environment: environment.to_string(),
					key: key.to_string(),
					enabled_default,
					rules,
					last_editor_id: actor_id.map(str::to_string),
				},
				expected_version,
			)
			.await?;

		info!(snapshot_version = flag.snapshot_version, "Flag written");
		Ok(flag)
	}

	pub async fn get_flag(&self, environment: &str, key: &str) -> Result<Option<FlagDefinition>> {
		if !FlagDefinition::validate_environment(environment) {
			return Err(ValidationError::InvalidEnvironment(environment.to_string()).into());
		}
		if !FlagDefinition::validate_key(key) {
			return Err(ValidationError::InvalidFlagKey(key.to_string()).into());
		}
		self.layer.get_flag(environment, key).await
	}

	fn authorize(&self, scope: &OverrideScope, actor_is_super_admin: bool) -> Result<()> {
		if let Err(e) = self.guard.check(&scope.key, actor_is_super_admin) {
			self.metrics.forbidden_attempts.inc();
			return Err(e);
		}
		scope.validate()?;
		Ok(())
	}

	#[instrument(skip(self, scope), fields(scope = %scope, value = value))]
	pub async fn set_override(
		&self,
		scope: &OverrideScope,
		value: bool,
		expires_at: Option<DateTime<Utc>>,
		actor_is_super_admin: bool,
	) -> Result<Override> {
		self.authorize(scope, actor_is_super_admin)?;
		self.layer.upsert_override(scope, value, expires_at).await
	}

	/// Applies a partial update over the current active override.
	///
	/// Returns `None` without writing when there is no active override and the patch
	/// carries no value.
	#[instrument(skip(self, scope, patch), fields(scope = %scope))]
	pub async fn patch_override(
		&self,
		scope: &OverrideScope,
		patch: OverridePatch,
		actor_is_super_admin: bool,
	) -> Result<Option<Override>> {
		self.authorize(scope, actor_is_super_admin)?;

		let current = self.layer.get_override(scope).await?;
		let Some(next) = patch.apply(current) else {
			return Ok(None);
		};

		let stored = self
			.layer
			.upsert_override(scope, next.value, next.expires_at)
			.await?;
		Ok(Some(stored))
	}

	#[instrument(skip(self, scope), fields(scope = %scope))]
	pub async fn clear_override(&self, scope: &OverrideScope, actor_is_super_admin: bool) -> Result<()> {
		self.authorize(scope, actor_is_super_admin)?;
		self.layer.soft_delete_override(scope).await
	}

	pub async fn get_override(&self, scope: &OverrideScope) -> Result<Option<OverrideValue>> {
		scope.validate()?;
		self.layer.get_override(scope).await
	}

	/// Physically removes up to `limit` expired or cleared overrides.
	pub async fn sweep_expired_overrides(&self, now: DateTime<Utc>, limit: u32) -> Result<u64> {
		sweep_expired_overrides(self.layer.override_store().as_ref(), now, limit).await
	}

	/// Flushes queued exposures and stops background tasks started by [`from_config`](Self::from_config).
	pub async fn shutdown(mut self) {
		if let Some(background) = self.background.take() {
			background.exposure.shutdown();
			if let Err(e) = background.flusher.await {
				tracing::warn!(error = %e, "Exposure flusher ended abnormally");
			}
			background.listener.abort();
		}
	}
}
