// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures::future::try_join_all;
use tracing::{debug, instrument, warn};

use loom_toggles_core::{
	EvaluationContext, ExposureRecord, FlagDefinition, Resolution, ValidationError,
};

use crate::error::Result;
use crate::exposure::ExposureSink;
use crate::metrics::TogglesMetrics;
use crate::resolver::OverrideResolver;

/// Evaluates many keys for one context and hands one exposure batch to the sink.
#[derive(Clone)]
pub struct BatchEvaluator {
	resolver: OverrideResolver,
	sink: Arc<dyn ExposureSink>,
	metrics: Arc<TogglesMetrics>,
	default_environment: String,
}

impl BatchEvaluator {
	pub fn new(
		resolver: OverrideResolver,
		sink: Arc<dyn ExposureSink>,
		metrics: Arc<TogglesMetrics>,
		default_environment: impl Into<String>,
	) -> Self {
		Self {
			resolver,
			sink,
			metrics,
			default_environment: default_environment.into(),
		}
	}

	pub async fn evaluate_many<K: AsRef<str>>(
		&self,
		environment: Option<&str>,
		keys: &[K],
		ctx: &EvaluationContext,
	) -> Result<HashMap<String, bool>> {
		Ok(self
			.evaluate_many_detailed(environment, keys, ctx)
			.await?
			.into_iter()
			.map(|(key, resolution)| (key, resolution.value))
			.collect())
	}

	/// Like [`evaluate_many`](Self::evaluate_many), keeping the resolution reason per key.
	///
	/// Input is validated before any read. Keys are evaluated concurrently against one
	/// pinned instant; duplicates are evaluated once.
	#[instrument(skip(self, keys, ctx), fields(environment = ?environment, key_count = keys.len()))]
	pub async fn evaluate_many_detailed<K: AsRef<str>>(
		&self,
		environment: Option<&str>,
		keys: &[K],
		ctx: &EvaluationContext,
	) -> Result<HashMap<String, Resolution>> {
		let environment = environment.unwrap_or(&self.default_environment);
		let keys = validate_request(environment, keys)?;
		self.metrics.batch_keys.observe(keys.len() as f64);

		let now = Utc::now();
		let ctx = ctx.pinned(now);
		let tenant_id = ctx.tenant_id.as_deref();
		let user_id = ctx.user_id.as_deref();

		let resolutions = try_join_all(keys.iter().map(|key| {
			let ctx = &ctx;
			async move {
				let resolution = self
					.resolver
					.resolve(environment, key, tenant_id, user_id, ctx)
					.await?;
				Ok::<_, crate::error::TogglesServerError>((key.to_string(), resolution))
			}
		}))
		.await?;

		let timestamp = ctx.effective_now();
		let records = resolutions
			.iter()
			.map(|(key, resolution)| ExposureRecord {
				environment: environment.to_string(),
				flag_key: key.clone(),
				value: resolution.value,
				reason: resolution.reason,
				user_id: ctx.user_id.clone(),
				tenant_id: ctx.tenant_id.clone(),
				timestamp,
			})
			.collect();
		self.dispatch_exposures(records);

		Ok(resolutions.into_iter().collect())
	}

	fn dispatch_exposures(&self, records: Vec<ExposureRecord>) {
		let sink = self.sink.clone();
		let metrics = self.metrics.clone();
		let count = records.len();

		tokio::spawn(async move {
			match sink.log_batch(records).await {
				Ok(()) => {
					metrics.exposure_records_sent.inc_by(count as f64);
					debug!(count, "Exposure batch logged");
				}
				Err(e) => {
					metrics.exposure_failures.inc();
					warn!(error = %e, count, "Failed to log exposure batch");
				}
			}
		});
	}
}

fn validate_request<'a, K: AsRef<str>>(
	environment: &str,
	keys: &'a [K],
) -> std::result::Result<BTreeSet<&'a str>, ValidationError> {
	if keys.is_empty() {
		return Err(ValidationError::EmptyKeys);
	}
	if !FlagDefinition::validate_environment(environment) {
		return Err(ValidationError::InvalidEnvironment(environment.to_string()));
	}

	keys.iter()
		.map(|key| {
			let key = key.as_ref();
			if FlagDefinition::validate_key(key) {
				Ok(key)
			} else {
				Err(ValidationError::InvalidFlagKey(key.to_string()))
			}
		})
		.collect()
}
