// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;

use loom_server_toggles::testing::{create_test_pool, RecordingExposureSink};
use loom_server_toggles::{
	flag_cache_key, override_cache_key, BatchEvaluator, BroadcastBus, Cache, CacheAside,
	CacheAsideSettings, Condition, EvaluationContext, ExposureSink, InMemoryCache, InvalidationListener, NoOpExposureSink,
	OverrideFailurePolicy, OverrideResolver, OverrideScope, PlatformGuard, ResolutionReason, Rule,
	SqliteFlagStore, SqliteOverrideStore, TogglesMetrics, TogglesServerError, TogglesService,
	INVALIDATION_TOPIC,
};

struct Instance {
	service: TogglesService,
	cache: Arc<InMemoryCache>,
}

async fn instance(pool: SqlitePool, bus: Arc<BroadcastBus>, sink: Arc<dyn ExposureSink>) -> Instance {
	let metrics = Arc::new(TogglesMetrics::new().unwrap());
	let cache = Arc::new(InMemoryCache::default());
	InvalidationListener::spawn(&bus, INVALIDATION_TOPIC, cache.clone()).await;

	let layer = CacheAside::new(
		Arc::new(SqliteFlagStore::new(pool.clone())),
		Arc::new(SqliteOverrideStore::new(pool)),
		cache.clone(),
		bus,
		metrics.clone(),
		CacheAsideSettings::default(),
	);
	let resolver = OverrideResolver::new(layer.clone(), metrics.clone(), OverrideFailurePolicy::Propagate);
	let evaluator = BatchEvaluator::new(resolver, sink, metrics.clone(), "prod");

	Instance {
		service: TogglesService::new(layer, evaluator, PlatformGuard::default(), metrics),
		cache,
	}
}

async fn single(sink: Arc<dyn ExposureSink>) -> TogglesService {
	let pool = create_test_pool().await;
	instance(pool, Arc::new(BroadcastBus::with_defaults()), sink)
		.await
		.service
}

#[tokio::test]
async fn quarter_rollout_over_ten_thousand_users() {
	let svc = single(Arc::new(NoOpExposureSink)).await;
	svc.write_flag(
		"prod",
		"beta_dashboard",
		false,
		vec![Rule::new(vec![Condition::percentage(25)], true)],
		None,
		None,
	)
	.await
	.unwrap();

	let mut enabled = 0;
	for i in 0..10_000 {
		let ctx = EvaluationContext::new().with_user_id(format!("user-{i}"));
		let result = svc
			.evaluate_many(Some("prod"), &["beta_dashboard"], &ctx)
			.await
			.unwrap();
		if result["beta_dashboard"] {
			enabled += 1;
		}
	}

	assert!(
		(2_300..=2_700).contains(&enabled),
		"expected ~25% enabled, got {enabled}/10000"
	);
}

#[tokio::test]
async fn tenant_override_disables_billing() {
	let sink = Arc::new(RecordingExposureSink::new());
	let svc = single(sink.clone()).await;

	svc.write_flag("prod", "billing_enabled", true, vec![Rule::catch_all(true)], None, None)
		.await
		.unwrap();
	svc.set_override(&OverrideScope::tenant("prod", "billing_enabled", "t1"), false, None, false)
		.await
		.unwrap();

	let ctx = EvaluationContext::new().with_tenant_id("t1");
	let result = svc.evaluate_many(None, &["billing_enabled"], &ctx).await.unwrap();
	assert_eq!(result.len(), 1);
	assert!(!result["billing_enabled"]);

	let other = EvaluationContext::new().with_tenant_id("t2");
	assert!(svc.evaluate_many(None, &["billing_enabled"], &other).await.unwrap()["billing_enabled"]);

	tokio::time::timeout(Duration::from_secs(1), async {
		while sink.records().await.len() < 2 {
			tokio::task::yield_now().await;
		}
	})
	.await
	.unwrap();
	let records = sink.records().await;
	assert_eq!(records[0].reason, ResolutionReason::TenantOverride);
	assert_eq!(records[0].tenant_id.as_deref(), Some("t1"));
}

#[tokio::test]
async fn user_override_takes_precedence() {
	let svc = single(Arc::new(NoOpExposureSink)).await;
	svc.write_flag("prod", "beta_dashboard", false, vec![Rule::catch_all(false)], None, None)
		.await
		.unwrap();
	svc.set_override(&OverrideScope::tenant("prod", "beta_dashboard", "t1"), false, None, false)
		.await
		.unwrap();
	svc.set_override(&OverrideScope::user("prod", "beta_dashboard", "u1"), true, None, false)
		.await
		.unwrap();

	let ctx = EvaluationContext::new().with_tenant_id("t1").with_user_id("u1");
	let result = svc
		.evaluate_many_detailed(None, &["beta_dashboard"], &ctx)
		.await
		.unwrap();
	assert!(result["beta_dashboard"].value);
	assert_eq!(result["beta_dashboard"].reason, ResolutionReason::UserOverride);
}

#[tokio::test]
async fn expired_override_is_invisible() {
	let svc = single(Arc::new(NoOpExposureSink)).await;
	let scope = OverrideScope::user("prod", "beta_dashboard", "u1");
	svc.write_flag("prod", "beta_dashboard", true, Vec::new(), None, None)
		.await
		.unwrap();

	let expires_at = Utc::now() + chrono::Duration::milliseconds(200);
	svc.set_override(&scope, false, Some(expires_at), false).await.unwrap();

	let ctx = EvaluationContext::new().with_user_id("u1");
	assert!(!svc.evaluate_many(None, &["beta_dashboard"], &ctx).await.unwrap()["beta_dashboard"]);
	assert!(svc.get_override(&scope).await.unwrap().is_some());

	tokio::time::sleep(Duration::from_millis(300)).await;

	assert!(svc.get_override(&scope).await.unwrap().is_none());
	assert!(svc.evaluate_many(None, &["beta_dashboard"], &ctx).await.unwrap()["beta_dashboard"]);
}

#[tokio::test]
async fn concurrent_stale_writes_have_one_winner() {
	let svc = single(Arc::new(NoOpExposureSink)).await;
	let initial = svc
		.write_flag("prod", "beta_dashboard", false, Vec::new(), Some("admin-1"), None)
		.await
		.unwrap();
	let expected = Some(initial.snapshot_version);

	let (a, b) = tokio::join!(
		svc.write_flag("prod", "beta_dashboard", true, Vec::new(), Some("admin-2"), expected),
		svc.write_flag("prod", "beta_dashboard", false, vec![Rule::catch_all(true)], Some("admin-3"), expected),
	);

	let outcomes = [a, b];
	let winners = outcomes.iter().filter(|r| r.is_ok()).count();
	let conflicts = outcomes
		.iter()
		.filter(|r| matches!(r, Err(TogglesServerError::VersionConflict { .. })))
		.count();
	assert_eq!(winners, 1);
	assert_eq!(conflicts, 1);

	let stored = svc.get_flag("prod", "beta_dashboard").await.unwrap().unwrap();
	assert_eq!(stored.snapshot_version, initial.snapshot_version + 1);
}

#[tokio::test]
async fn never_written_flag_is_disabled() {
	let svc = single(Arc::new(NoOpExposureSink)).await;
	let ctx = EvaluationContext::new().with_user_id("u1").with_tenant_id("t1");
	let result = svc
		.evaluate_many_detailed(None, &["never_written"], &ctx)
		.await
		.unwrap();
	assert!(!result["never_written"].value);
	assert_eq!(result["never_written"].reason, ResolutionReason::FlagNotFound);
}

#[tokio::test]
async fn peer_cache_is_invalidated_by_bus() {
	let pool = create_test_pool().await;
	let bus = Arc::new(BroadcastBus::with_defaults());
	let a = instance(pool.clone(), bus.clone(), Arc::new(NoOpExposureSink)).await;
	a.service
		.write_flag("prod", "beta_dashboard", false, Vec::new(), None, None)
		.await
		.unwrap();
	let b = instance(pool, bus, Arc::new(NoOpExposureSink)).await;
	assert!(!b.service.get_flag("prod", "beta_dashboard").await.unwrap().unwrap().enabled_default);

	let key = flag_cache_key("prod", "beta_dashboard");
	assert!(b.cache.get(&key).await.unwrap().is_some());

	a.service
		.write_flag("prod", "beta_dashboard", true, Vec::new(), None, Some(1))
		.await
		.unwrap();

	wait_for_eviction(&b.cache, &key).await;

	let fresh = b.service.get_flag("prod", "beta_dashboard").await.unwrap().unwrap();
	assert!(fresh.enabled_default);
	assert_eq!(fresh.snapshot_version, 2);
}

#[tokio::test]
async fn peer_override_cache_is_invalidated_by_bus() {
	let pool = create_test_pool().await;
	let bus = Arc::new(BroadcastBus::with_defaults());
	let a = instance(pool.clone(), bus.clone(), Arc::new(NoOpExposureSink)).await;
	let scope = OverrideScope::tenant("prod", "billing_enabled", "t1");
	let key = override_cache_key(&scope);

	a.service.set_override(&scope, false, None, false).await.unwrap();
	let b = instance(pool, bus, Arc::new(NoOpExposureSink)).await;
	assert_eq!(b.service.get_override(&scope).await.unwrap().map(|v| v.value), Some(false));
	assert!(b.cache.get(&key).await.unwrap().is_some());

	a.service.set_override(&scope, true, None, false).await.unwrap();
	wait_for_eviction(&b.cache, &key).await;
	assert_eq!(b.service.get_override(&scope).await.unwrap().map(|v| v.value), Some(true));
	assert!(b.cache.get(&key).await.unwrap().is_some());

	a.service.clear_override(&scope, false).await.unwrap();
	wait_for_eviction(&b.cache, &key).await;
	assert!(b.service.get_override(&scope).await.unwrap().is_none());
}

async fn wait_for_eviction(cache: &InMemoryCache, key: &str) {
	tokio::time::timeout(Duration::from_secs(1), async {
		while cache.get(key).await.unwrap().is_some() {
			tokio::task::yield_now().await;
		}
	})
	.await
	.unwrap();
}
