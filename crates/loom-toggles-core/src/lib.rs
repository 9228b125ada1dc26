// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom feature toggles engine.
//!
//! This crate holds the pure part of toggle evaluation: flag definitions, ordered
//! rules, targeting conditions, overrides and the evaluation context. It does no
//! I/O and is shared by the server crate (`loom-server-toggles`) and anything
//! that needs to evaluate a definition it already has in hand.
//!
//! # Overview
//!
//! - Boolean flags scoped per environment with an ordered rule list
//! - A closed set of conditions: plan, country, email domain, tenant tag,
//!   time window and deterministic percentage rollout
//! - Per-user and per-tenant overrides with optional expiry
//! - Invalidation events for cross-instance cache coherence
//!
//! # Example
//!
//! ```
//! use loom_toggles_core::{apply_rules, Condition, EvaluationContext, FlagDefinition, Rule};
//!
//! let flag = FlagDefinition {
//!     environment: "prod".to_string(),
//!     key: "beta_dashboard".to_string(),
//!     enabled_default: false,
//!     rules: vec![Rule::new(vec![Condition::plan_in(["enterprise"])], true)],
//!     snapshot_version: 1,
//!     last_editor_id: None,
//!     created_at: chrono::Utc::now(),
//!     updated_at: chrono::Utc::now(),
//! };
//!
//! let ctx = EvaluationContext::new().with_plan("enterprise");
//! assert!(apply_rules(Some(&flag), &ctx));
//! ```

pub mod condition;
pub mod context;
pub mod error;
pub mod evaluation;
pub mod events;
pub mod flag;
pub mod overrides;
pub mod platform;
pub mod rules;

pub use condition::{bucket_for, in_rollout, Condition, BUCKET_COUNT};
pub use context::{EvaluationContext, ANONYMOUS_SUBJECT};
pub use error::{Result, ValidationError};
pub use evaluation::{ExposureRecord, Resolution, ResolutionReason};
pub use events::{FlagUpdatedData, InvalidationEvent, OverrideChangedData, INVALIDATION_TOPIC};
pub use flag::{FlagDefinition, Rule, RuleOutcome};
pub use overrides::{
	Override, OverrideId, OverridePatch, OverrideScope, OverrideValue, ScopeType,
};
pub use platform::{is_platform_only, PLATFORM_ONLY_FLAGS};
pub use rules::{apply_rules, evaluate_rules};
