// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Three-tier precedence: user override, then tenant override, then the flag's rules.

use std::sync::Arc;

use tracing::{instrument, warn};

use loom_toggles_core::{
	evaluate_rules, EvaluationContext, OverrideScope, OverrideValue, Resolution, ResolutionReason,
};

use crate::cache_aside::CacheAside;
use crate::config::OverrideFailurePolicy;
use crate::error::Result;
use crate::metrics::TogglesMetrics;

#[derive(Clone)]
pub struct OverrideResolver {
	layer: CacheAside,
	metrics: Arc<TogglesMetrics>,
	failure_policy: OverrideFailurePolicy,
}

impl OverrideResolver {
	pub fn new(layer: CacheAside, metrics: Arc<TogglesMetrics>, failure_policy: OverrideFailurePolicy) -> Self {
		Self {
			layer,
			metrics,
			failure_policy,
		}
	}

	/// Resolves one flag, short-circuiting at the first tier that has an answer.
	///
	/// Performs at most three reads. An absent flag resolves to `false`.
	#[instrument(
		skip(self, ctx),
		fields(environment = %environment, key = %key, tenant_id = ?tenant_id, user_id = ?user_id)
	)]
	pub async fn resolve(
		&self,
		environment: &str,
		key: &str,
		tenant_id: Option<&str>,
		user_id: Option<&str>,
		ctx: &EvaluationContext,
	) -> Result<Resolution> {
		let resolution = self
			.resolve_inner(environment, key, tenant_id, user_id, ctx)
			.await?;
		self.metrics
			.evaluations
			.with_label_values(&[resolution.reason.as_str()])
			.inc();
		Ok(resolution)
	}

	/// Same as [`resolve`](Self::resolve), without the reason.
	pub async fn resolve_value(
		&self,
		environment: &str,
		key: &str,
		tenant_id: Option<&str>,
		user_id: Option<&str>,
		ctx: &EvaluationContext,
	) -> Result<bool> {
		Ok(self
			.resolve(environment, key, tenant_id, user_id, ctx)
			.await?
			.value)
	}

	async fn resolve_inner(
		&self,
		environment: &str,
		key: &str,
		tenant_id: Option<&str>,
		user_id: Option<&str>,
		ctx: &EvaluationContext,
	) -> Result<Resolution> {
		if let Some(user_id) = user_id {
			let scope = OverrideScope::user(environment, key, user_id);
			if let Some(found) = self.lookup_override(&scope).await? {
				return Ok(Resolution::new(found.value, ResolutionReason::UserOverride));
			}
		}

		if let Some(tenant_id) = tenant_id {
			let scope = OverrideScope::tenant(environment, key, tenant_id);
			if let Some(found) = self.lookup_override(&scope).await? {
				return Ok(Resolution::new(found.value, ResolutionReason::TenantOverride));
			}
		}

		let flag = self.layer.get_flag(environment, key).await?;
		Ok(evaluate_rules(flag.as_ref(), ctx))
	}

	async fn lookup_override(&self, scope: &OverrideScope) -> Result<Option<OverrideValue>> {
		match self.layer.get_override(scope).await {
			Ok(found) => Ok(found),
			Err(e)
				if e.is_infrastructure()
					&& self.failure_policy == OverrideFailurePolicy::TreatAsAbsent =>
			{
				warn!(error = %e, scope = %scope, "Override lookup failed; treating as absent");
				Ok(None)
			}
			Err(e) => Err(e),
		}
	}
}
