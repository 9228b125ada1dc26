// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Cache-aside wrapper around the flag and override stores.
//!
//! Reads consult the cache first and populate it on a store hit; misses are not
//! cached. Writes go to the store, delete the cache entry, then publish an
//! invalidation event for peer instances. Every cache, store and bus call is
//! bounded by the configured timeout.
//!
//! Cache failures on the read path are logged and the read falls through to the
//! store. A failed delete on the write path is returned to the caller after the
//! invalidation event has been published. Publish failures are logged and counted only.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use loom_toggles_core::{
	FlagDefinition, InvalidationEvent, Override, OverrideScope, OverrideValue, INVALIDATION_TOPIC,
};

use crate::bus::InvalidationBus;
use crate::cache::{flag_cache_key, override_cache_key, Cache};
use crate::error::{Result, TogglesServerError};
use crate::metrics::TogglesMetrics;
use crate::repository::{FlagStore, FlagWrite, OverrideStore, UpsertOutcome};

#[derive(Debug, Clone)]
pub struct CacheAsideSettings {
	pub ttl: Duration,
	pub timeout: Duration,
	pub topic: String,
}

impl Default for CacheAsideSettings {
	fn default() -> Self {
		Self {
			ttl: Duration::from_secs(30),
			timeout: Duration::from_millis(500),
			topic: INVALIDATION_TOPIC.to_string(),
		}
	}
}

#[derive(Clone)]
pub struct CacheAside {
	flags: Arc<dyn FlagStore>,
	overrides: Arc<dyn OverrideStore>,
	cache: Arc<dyn Cache>,
	bus: Arc<dyn InvalidationBus>,
	metrics: Arc<TogglesMetrics>,
	settings: CacheAsideSettings,
}

impl CacheAside {
	pub fn new(
		flags: Arc<dyn FlagStore>,
		overrides: Arc<dyn OverrideStore>,
		cache: Arc<dyn Cache>,
		bus: Arc<dyn InvalidationBus>,
		metrics: Arc<TogglesMetrics>,
		settings: CacheAsideSettings,
	) -> Self {
		Self {
			flags,
			overrides,
			cache,
			bus,
			metrics,
			settings,
		}
	}

	pub fn override_store(&self) -> &Arc<dyn OverrideStore> {
		&self.overrides
	}

	async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
	where
		F: Future<Output = Result<T>>,
	{
		match tokio::time::timeout(self.settings.timeout, fut).await {
			Ok(result) => result,
			Err(_) => {
				self.metrics.store_timeouts.with_label_values(&[operation]).inc();
				Err(TogglesServerError::Timeout { operation })
			}
		}
	}

	async fn cached<T: DeserializeOwned>(&self, kind: &str, cache_key: &str) -> Option<T> {
		let raw = match self.bounded("cache get", self.cache.get(cache_key)).await {
			Ok(Some(raw)) => raw,
			Ok(None) => {
				self.metrics.cache_lookups.with_label_values(&[kind, "miss"]).inc();
				return None;
			}
			Err(e) => {
				self.metrics.cache_lookups.with_label_values(&[kind, "error"]).inc();
				warn!(error = %e, cache_key = %cache_key, "Cache read failed, reading store");
				return None;
			}
		};

		match serde_json::from_str(&raw) {
			Ok(value) => {
				self.metrics.cache_lookups.with_label_values(&[kind, "hit"]).inc();
				Some(value)
			}
			Err(e) => {
				self.metrics.cache_lookups.with_label_values(&[kind, "error"]).inc();
				warn!(error = %e, cache_key = %cache_key, "Discarding unreadable cache entry");
				self.evict(cache_key).await;
				None
			}
		}
	}

	async fn populate<T: Serialize>(&self, cache_key: &str, value: &T) {
		let payload = match serde_json::to_string(value) {
			Ok(payload) => payload,
			Err(e) => {
				warn!(error = %e, cache_key = %cache_key, "Failed to serialize cache entry");
				return;
			}
		};

		if let Err(e) = self
			.bounded("cache set", self.cache.set(cache_key, payload, self.settings.ttl))
			.await
		{
			warn!(error = %e, cache_key = %cache_key, "Cache write failed");
		}
	}

	async fn evict(&self, cache_key: &str) {
		if let Err(e) = self.bounded("cache del", self.cache.del(cache_key)).await {
			warn!(error = %e, cache_key = %cache_key, "Failed to evict cache entry");
		}
	}

	/// Drops the local entry and publishes `event`. The event goes out even when the
	/// local delete fails; the delete error is returned afterwards.
	async fn invalidate(&self, cache_key: &str, event: InvalidationEvent) -> Result<()> {
		let deleted = self.bounded("cache del", self.cache.del(cache_key)).await;
		if let Err(e) = &deleted {
			warn!(error = %e, cache_key = %cache_key, "Failed to drop cache entry after write");
		}

		match self
			.bounded("bus publish", self.bus.publish(&self.settings.topic, &event))
			.await
		{
			Ok(receivers) => {
				self.metrics
					.invalidations_published
					.with_label_values(&[event.event_type()])
					.inc();
				debug!(cache_key = %cache_key, receivers, "Invalidation published");
			}
			Err(e) => {
				self.metrics.invalidation_failures.inc();
				warn!(error = %e, cache_key = %cache_key, "Failed to publish invalidation");
			}
		}
		deleted
	}

	#[instrument(skip(self), fields(environment = %environment, key = %key))]
	pub async fn get_flag(&self, environment: &str, key: &str) -> Result<Option<FlagDefinition>> {
		let cache_key = flag_cache_key(environment, key);
		if let Some(flag) = self.cached::<FlagDefinition>("flag", &cache_key).await {
			return Ok(Some(flag));
		}

		let flag = self
			.bounded("flag lookup", self.flags.get(environment, key))
			.await?;
		if let Some(flag) = &flag {
			self.populate(&cache_key, flag).await;
		}
		Ok(flag)
	}

	/// Active override for a scope, checked for expiry against wall-clock time.
	pub async fn get_override(&self, scope: &OverrideScope) -> Result<Option<OverrideValue>> {
		self.get_override_at(scope, Utc::now()).await
	}

	#[instrument(skip(self, scope), fields(scope = %scope))]
	pub async fn get_override_at(
		&self,
		scope: &OverrideScope,
		now: DateTime<Utc>,
	) -> Result<Option<OverrideValue>> {
		let cache_key = override_cache_key(scope);
		if let Some(value) = self.cached::<OverrideValue>("override", &cache_key).await {
			if value.is_active(now) {
				return Ok(Some(value));
			}
			debug!(cache_key = %cache_key, "Cached override expired");
			self.evict(&cache_key).await;
			return Ok(None);
		}

		let value = self
			.bounded("override lookup", self.overrides.find(scope, now))
			.await?;
		if let Some(value) = &value {
			self.populate(&cache_key, value).await;
		}
		Ok(value)
	}

	/// Versioned flag write. A stale `expected_version` becomes a `VersionConflict` error.
	#[instrument(
		skip(self, write),
		fields(environment = %write.environment, key = %write.key, expected_version = ?expected_version)
	)]
	pub async fn write_flag(&self, write: &FlagWrite, expected_version: Option<i64>) -> Result<FlagDefinition> {
		let outcome = self
			.bounded("flag write", self.flags.upsert(write, expected_version))
			.await?;

		let flag = match outcome {
			UpsertOutcome::Written(flag) => flag,
			UpsertOutcome::Conflict { current_version } => {
				self.metrics.version_conflicts.inc();
				return Err(TogglesServerError::VersionConflict {
					environment: write.environment.clone(),
					key: write.key.clone(),
					expected: expected_version.unwrap_or_default(),
					actual: current_version,
				});
			}
		};

		self.invalidate(
			&flag_cache_key(&flag.environment, &flag.key),
			InvalidationEvent::flag_updated(&flag.environment, &flag.key, flag.snapshot_version),
		)
		.await?;
		Ok(flag)
	}

	#[instrument(skip(self, scope), fields(scope = %scope, value = value))]
	pub async fn upsert_override(
		&self,
		scope: &OverrideScope,
		value: bool,
		expires_at: Option<DateTime<Utc>>,
	) -> Result<Override> {
		let stored = self
			.bounded("override write", self.overrides.upsert(scope, value, expires_at))
			.await?;
		self.invalidate_override(scope).await?;
		Ok(stored)
	}

	#[instrument(skip(self, scope), fields(scope = %scope))]
	pub async fn soft_delete_override(&self, scope: &OverrideScope) -> Result<()> {
		self.bounded("override delete", self.overrides.soft_delete(scope))
			.await?;
		self.invalidate_override(scope).await
	}

	async fn invalidate_override(&self, scope: &OverrideScope) -> Result<()> {
		self.invalidate(
			&override_cache_key(scope),
			InvalidationEvent::override_changed(
				&scope.environment,
				&scope.key,
				scope.scope_type,
				&scope.scope_id,
			),
		)
		.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::BroadcastBus;
	use crate::cache::InMemoryCache;
	use crate::repository::{SqliteFlagStore, SqliteOverrideStore};
	use crate::testing::create_test_pool;
	use async_trait::async_trait;
	use chrono::Duration as ChronoDuration;
	use loom_toggles_core::Rule;

	struct BrokenCache;

	#[async_trait]
	impl Cache for BrokenCache {
		async fn get(&self, _key: &str) -> Result<Option<String>> {
			Err(TogglesServerError::Cache("connection refused".to_string()))
		}
		async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<()> {
			Err(TogglesServerError::Cache("connection refused".to_string()))
		}
		async fn del(&self, _key: &str) -> Result<()> {
			Err(TogglesServerError::Cache("connection refused".to_string()))
		}
	}

	struct SlowFlagStore;

	#[async_trait]
	impl FlagStore for SlowFlagStore {
		async fn get(&self, _environment: &str, _key: &str) -> Result<Option<FlagDefinition>> {
			tokio::time::sleep(Duration::from_secs(60)).await;
			Ok(None)
		}
		async fn upsert(&self, _write: &FlagWrite, _expected: Option<i64>) -> Result<UpsertOutcome> {
			tokio::time::sleep(Duration::from_secs(60)).await;
			Ok(UpsertOutcome::Conflict { current_version: None })
		}
	}

	struct Fixture {
		layer: CacheAside,
		cache: Arc<InMemoryCache>,
		bus: Arc<BroadcastBus>,
		metrics: Arc<TogglesMetrics>,
	}

	async fn fixture() -> Fixture {
		let pool = create_test_pool().await;
		let cache = Arc::new(InMemoryCache::default());
		let bus = Arc::new(BroadcastBus::with_defaults());
		let metrics = Arc::new(TogglesMetrics::new().unwrap());
		let layer = CacheAside::new(
			Arc::new(SqliteFlagStore::new(pool.clone())),
			Arc::new(SqliteOverrideStore::new(pool)),
			cache.clone(),
			bus.clone(),
			metrics.clone(),
			CacheAsideSettings::default(),
		);
		Fixture {
			layer,
			cache,
			bus,
			metrics,
		}
	}

	fn write(enabled_default: bool) -> FlagWrite {
		FlagWrite {
			environment: "prod".to_string(),
			key: "beta_dashboard".to_string(),
			enabled_default,
			rules: vec![Rule::catch_all(true)],
			last_editor_id: None,
		}
	}

	#[tokio::test]
	async fn read_populates_cache_and_miss_does_not() {
		let f = fixture().await;
		let key = flag_cache_key("prod", "beta_dashboard");

		assert!(f.layer.get_flag("prod", "beta_dashboard").await.unwrap().is_none());
		assert!(f.cache.get(&key).await.unwrap().is_none());

		f.layer.write_flag(&write(false), None).await.unwrap();
		assert!(f.cache.get(&key).await.unwrap().is_none());

		let flag = f.layer.get_flag("prod", "beta_dashboard").await.unwrap().unwrap();
		assert_eq!(flag.snapshot_version, 1);
		assert!(f.cache.get(&key).await.unwrap().is_some());

		f.layer.get_flag("prod", "beta_dashboard").await.unwrap();
		assert_eq!(
			f.metrics.cache_lookups.with_label_values(&["flag", "hit"]).get(),
			1.0
		);
	}

	#[tokio::test]
	async fn write_invalidates_and_publishes() {
		let f = fixture().await;
		let mut events = f.bus.subscribe(INVALIDATION_TOPIC).await;

		f.layer.write_flag(&write(false), None).await.unwrap();
		f.layer.get_flag("prod", "beta_dashboard").await.unwrap();

		let updated = f.layer.write_flag(&write(true), Some(1)).await.unwrap();
		assert_eq!(updated.snapshot_version, 2);
		assert!(f
			.cache
			.get(&flag_cache_key("prod", "beta_dashboard"))
			.await
			.unwrap()
			.is_none());

		let first = events.recv().await.unwrap();
		let second = events.recv().await.unwrap();
		assert!(matches!(first, InvalidationEvent::FlagUpdated(ref d) if d.snapshot_version == 1));
		assert!(matches!(second, InvalidationEvent::FlagUpdated(ref d) if d.snapshot_version == 2));

		assert!(f.layer.get_flag("prod", "beta_dashboard").await.unwrap().unwrap().enabled_default);
	}

	#[tokio::test]
	async fn stale_write_is_a_conflict() {
		let f = fixture().await;
		f.layer.write_flag(&write(false), None).await.unwrap();
		f.layer.write_flag(&write(false), None).await.unwrap();

		let err = f.layer.write_flag(&write(true), Some(1)).await.unwrap_err();
		assert!(matches!(
			err,
			TogglesServerError::VersionConflict {
				expected: 1,
				actual: Some(2),
				..
			}
		));
		assert_eq!(f.metrics.version_conflicts.get(), 1.0);
	}

	#[tokio::test]
	async fn cached_override_is_rechecked_for_expiry() {
		let f = fixture().await;
		let scope = OverrideScope::user("prod", "beta_dashboard", "u1");
		let now = Utc::now();
		let expires_at = now + ChronoDuration::minutes(5);

		f.layer.upsert_override(&scope, true, Some(expires_at)).await.unwrap();
		assert!(f.layer.get_override_at(&scope, now).await.unwrap().is_some());
		assert!(f.cache.get(&override_cache_key(&scope)).await.unwrap().is_some());

		let later = expires_at + ChronoDuration::seconds(1);
		assert!(f.layer.get_override_at(&scope, later).await.unwrap().is_none());
		assert!(f.cache.get(&override_cache_key(&scope)).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn clearing_override_drops_cached_copy() {
		let f = fixture().await;
		let scope = OverrideScope::tenant("prod", "billing_enabled", "t1");

		f.layer.upsert_override(&scope, false, None).await.unwrap();
		assert_eq!(
			f.layer.get_override(&scope).await.unwrap().map(|v| v.value),
			Some(false)
		);

		f.layer.soft_delete_override(&scope).await.unwrap();
		assert!(f.layer.get_override(&scope).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn broken_cache_falls_through_on_read_and_fails_write() {
		let pool = create_test_pool().await;
		let flags = Arc::new(SqliteFlagStore::new(pool.clone()));
		flags.upsert(&write(true), None).await.unwrap();

		let metrics = Arc::new(TogglesMetrics::new().unwrap());
		let layer = CacheAside::new(
			flags,
			Arc::new(SqliteOverrideStore::new(pool)),
			Arc::new(BrokenCache),
			Arc::new(BroadcastBus::with_defaults()),
			metrics.clone(),
			CacheAsideSettings::default(),
		);

		let flag = layer.get_flag("prod", "beta_dashboard").await.unwrap().unwrap();
		assert!(flag.enabled_default);
		assert_eq!(metrics.cache_lookups.with_label_values(&["flag", "error"]).get(), 1.0);

		let err = layer.write_flag(&write(false), None).await.unwrap_err();
		assert!(matches!(err, TogglesServerError::Cache(_)));
	}

	#[tokio::test]
	async fn failed_local_delete_still_notifies_peers() {
		let pool = create_test_pool().await;
		let flags = Arc::new(SqliteFlagStore::new(pool.clone()));
		let bus = Arc::new(BroadcastBus::with_defaults());
		let mut events = bus.subscribe(INVALIDATION_TOPIC).await;

		let layer = CacheAside::new(
			flags.clone(),
			Arc::new(SqliteOverrideStore::new(pool)),
			Arc::new(BrokenCache),
			bus,
			Arc::new(TogglesMetrics::new().unwrap()),
			CacheAsideSettings::default(),
		);

		let err = layer.write_flag(&write(true), None).await.unwrap_err();
		assert!(matches!(err, TogglesServerError::Cache(_)));

		let stored = flags.get("prod", "beta_dashboard").await.unwrap().unwrap();
		assert_eq!(stored.snapshot_version, 1);

		let event = events.try_recv().unwrap();
		assert!(matches!(event, InvalidationEvent::FlagUpdated(ref d) if d.snapshot_version == 1));

		let scope = OverrideScope::user("prod", "beta_dashboard", "u1");
		assert!(layer.upsert_override(&scope, true, None).await.is_err());
		assert!(matches!(events.try_recv().unwrap(), InvalidationEvent::OverrideChanged(_)));
	}

	#[tokio::test]
	async fn slow_store_times_out() {
		let pool = create_test_pool().await;
		let metrics = Arc::new(TogglesMetrics::new().unwrap());
		let layer = CacheAside::new(
			Arc::new(SlowFlagStore),
			Arc::new(SqliteOverrideStore::new(pool)),
			Arc::new(InMemoryCache::default()),
			Arc::new(BroadcastBus::with_defaults()),
			metrics.clone(),
			CacheAsideSettings {
				timeout: Duration::from_millis(50),
				..Default::default()
			},
		);

		let err = layer.get_flag("prod", "beta_dashboard").await.unwrap_err();
		assert!(matches!(err, TogglesServerError::Timeout { operation: "flag lookup" }));
		assert_eq!(metrics.store_timeouts.with_label_values(&["flag lookup"]).get(), 1.0);
	}
}
