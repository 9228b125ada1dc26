// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Feature toggles server implementation for Loom.
//!
//! Resolves boolean toggles for a caller context with three-tier precedence
//! (user override, tenant override, flag rules), persists flags and overrides in
//! SQLite behind repository traits, and keeps a short-TTL cache coherent across
//! instances with invalidation events.
//!
//! # Architecture
//!
//! - `repository` - Flag and override stores, versioned flag upsert, sweep support
//! - `cache` / `cache_aside` - TTL cache port and the read-through, delete-on-write layer
//! - `bus` - Invalidation publish/subscribe and the peer listener
//! - `resolver` - Override precedence over the core rule evaluator
//! - `batch` - Concurrent multi-key evaluation with fire-and-forget exposures
//! - `exposure` - Exposure sinks (no-op, tracing, SQLite, batching)
//! - `service` - Public facade tying everything together
//!
//! # Example
//!
//! ```ignore
//! use loom_server_toggles::{load_config, TogglesService, EvaluationContext};
//!
//! let config = load_config(None)?;
//! let service = TogglesService::from_config(&config).await?;
//!
//! let ctx = EvaluationContext::new().with_tenant_id("t1").with_user_id("u1");
//! let flags = service.evaluate_many(Some("prod"), &["billing_enabled"], &ctx).await?;
//! ```

pub mod batch;
pub mod bus;
pub mod cache;
pub mod cache_aside;
pub mod config;
pub mod error;
pub mod exposure;
pub mod guard;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod repository;
pub mod resolver;
pub mod schema;
pub mod service;
pub mod testing;

pub use batch::BatchEvaluator;
pub use bus::{BroadcastBus, ChannelStats, InvalidationBus, InvalidationListener};
pub use cache::{flag_cache_key, override_cache_key, Cache, InMemoryCache};
pub use cache_aside::{CacheAside, CacheAsideSettings};
pub use config::{load_config, ConfigError, OverrideFailurePolicy, TogglesConfig, TogglesConfigLayer};
pub use error::{Result, TogglesServerError};
pub use exposure::{
	BatchingExposureSink, ExposureSink, NoOpExposureSink, SqliteExposureSink, TracingExposureSink,
};
pub use guard::PlatformGuard;
pub use logging::init_logging;
pub use metrics::TogglesMetrics;
pub use pool::create_pool;
pub use repository::{
	sweep_expired_overrides, FlagStore, FlagWrite, OverrideStore, SqliteFlagStore,
	SqliteOverrideStore, UpsertOutcome,
};
pub use resolver::OverrideResolver;
pub use service::TogglesService;

// Re-export core types for convenience
pub use loom_toggles_core::*;
