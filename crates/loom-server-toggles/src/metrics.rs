// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use prometheus::{
	Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

/// Prometheus metrics for evaluation, caching, writes and exposure telemetry.
pub struct TogglesMetrics {
	registry: Registry,

	pub evaluations: CounterVec,
	pub cache_lookups: CounterVec,
	pub store_timeouts: CounterVec,
	pub invalidations_published: CounterVec,
	pub invalidation_failures: Counter,
	pub version_conflicts: Counter,
	pub forbidden_attempts: Counter,

	pub exposure_records_sent: Counter,
	pub exposure_failures: Counter,
	pub exposure_records_dropped: Counter,
	pub batch_keys: Histogram,
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<CounterVec> {
	let metric = CounterVec::new(Opts::new(name, help), labels)?;
	registry.register(Box::new(metric.clone()))?;
	Ok(metric)
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<Counter> {
	let metric = Counter::new(name, help)?;
	registry.register(Box::new(metric.clone()))?;
	Ok(metric)
}

impl TogglesMetrics {
	pub fn new() -> prometheus::Result<Self> {
		let registry = Registry::new();

		let evaluations = counter_vec(
			&registry,
			"loom_toggles_evaluations_total",
			"Flag evaluations by resolution reason",
			&["reason"],
		)?;
		let cache_lookups = counter_vec(
			&registry,
			"loom_toggles_cache_lookups_total",
			"Cache lookups by entry kind and outcome",
			&["kind", "outcome"],
		)?;
		let store_timeouts = counter_vec(
			&registry,
			"loom_toggles_store_timeouts_total",
			"Cache or store calls that exceeded the timeout",
			&["operation"],
		)?;
		let invalidations_published = counter_vec(
			&registry,
			"loom_toggles_invalidations_published_total",
			"Invalidation events published",
			&["event_type"],
		)?;
		let invalidation_failures = counter(
			&registry,
			"loom_toggles_invalidation_failures_total",
			"Invalidation events that could not be published",
		)?;
		let version_conflicts = counter(
			&registry,
			"loom_toggles_version_conflicts_total",
			"Flag writes rejected by the version check",
		)?;
		let forbidden_attempts = counter(
			&registry,
			"loom_toggles_forbidden_attempts_total",
			"Platform-only override changes rejected",
		)?;
		let exposure_records_sent = counter(
			&registry,
			"loom_toggles_exposure_records_sent_total",
			"Exposure records accepted by the sink",
		)?;
		let exposure_failures = counter(
			&registry,
			"loom_toggles_exposure_failures_total",
			"Exposure batches the sink failed to log",
		)?;
		let exposure_records_dropped = counter(
			&registry,
			"loom_toggles_exposure_records_dropped_total",
			"Exposure records dropped on queue overflow",
		)?;

		let batch_keys = Histogram::with_opts(
			HistogramOpts::new("loom_toggles_batch_keys", "Keys per batch evaluation")
				.buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]),
		)?;
		registry.register(Box::new(batch_keys.clone()))?;

		Ok(Self {
			registry,
			evaluations,
			cache_lookups,
			store_timeouts,
			invalidations_published,
			invalidation_failures,
			version_conflicts,
			forbidden_attempts,
			exposure_records_sent,
			exposure_failures,
			exposure_records_dropped,
			batch_keys,
		})
	}

	pub fn registry(&self) -> &Registry {
		&self.registry
	}

	/// Renders all metrics in the Prometheus text format.
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		let mut buffer = Vec::new();
		if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
			tracing::warn!(error = %e, "failed to encode metrics");
		}
		String::from_utf8(buffer).unwrap_or_default()
	}
}
