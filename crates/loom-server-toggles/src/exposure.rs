// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Exposure telemetry sinks.
//!
//! A sink receives one batch of [`ExposureRecord`]s per evaluation call. Sinks are
//! injected into the batch evaluator; callers never see their failures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use loom_toggles_core::ExposureRecord;

use crate::config::ExposureConfig;
use crate::error::{Result, TogglesServerError};
use crate::metrics::TogglesMetrics;
use crate::schema::format_ts;

#[async_trait]
pub trait ExposureSink: Send + Sync {
	async fn log_batch(&self, records: Vec<ExposureRecord>) -> Result<()>;
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpExposureSink;

#[async_trait]
impl ExposureSink for NoOpExposureSink {
	async fn log_batch(&self, _records: Vec<ExposureRecord>) -> Result<()> {
		Ok(())
	}
}

/// Emits one `tracing` event per record on the `loom_toggles::exposure` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExposureSink;

#[async_trait]
impl ExposureSink for TracingExposureSink {
	async fn log_batch(&self, records: Vec<ExposureRecord>) -> Result<()> {
		for record in &records {
			info!(
				target: "loom_toggles::exposure",
				environment = %record.environment,
				flag_key = %record.flag_key,
				value = record.value,
				reason = %record.reason,
				user_id = record.user_id.as_deref(),
				tenant_id = record.tenant_id.as_deref(),
				timestamp = %record.timestamp,
				"flag exposure"
			);
		}
		Ok(())
	}
}

/// Appends records to the `toggle_exposures` table.
#[derive(Clone)]
pub struct SqliteExposureSink {
	pool: SqlitePool,
}

impl SqliteExposureSink {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}
}

#[async_trait]
impl ExposureSink for SqliteExposureSink {
	#[tracing::instrument(skip(self, records), fields(count = records.len()))]
	async fn log_batch(&self, records: Vec<ExposureRecord>) -> Result<()> {
		let mut tx = self.pool.begin().await?;

		for record in &records {
			sqlx::query(
				r#"
				INSERT INTO toggle_exposures
					(environment, flag_key, value, reason, user_id, tenant_id, timestamp)
				VALUES (?, ?, ?, ?, ?, ?, ?)
				"#,
			)
			.bind(&record.environment)
			.bind(&record.flag_key)
			.bind(record.value)
			.bind(record.reason.to_string())
			.bind(&record.user_id)
			.bind(&record.tenant_id)
			.bind(format_ts(record.timestamp))
			.execute(&mut *tx)
			.await?;
		}

		tx.commit().await?;
		Ok(())
	}
}

/// Queues records and forwards them to an inner sink in batches.
///
/// A flush happens when the queue reaches `max_batch_size` or every `flush_interval`,
/// whichever comes first. When the queue is full the oldest records are dropped.
pub struct BatchingExposureSink {
	config: ExposureConfig,
	inner: Arc<dyn ExposureSink>,
	metrics: Arc<TogglesMetrics>,
	queue: Mutex<VecDeque<ExposureRecord>>,
	shutdown: AtomicBool,
	flush_notify: Notify,
}

impl BatchingExposureSink {
	pub fn new(config: ExposureConfig, inner: Arc<dyn ExposureSink>, metrics: Arc<TogglesMetrics>) -> Self {
		Self {
			config,
			inner,
			metrics,
			queue: Mutex::new(VecDeque::new()),
			shutdown: AtomicBool::new(false),
			flush_notify: Notify::new(),
		}
	}

	/// Creates the sink and spawns its flush loop.
	pub fn spawn(
		config: ExposureConfig,
		inner: Arc<dyn ExposureSink>,
		metrics: Arc<TogglesMetrics>,
	) -> (Arc<Self>, JoinHandle<()>) {
		let sink = Arc::new(Self::new(config, inner, metrics));
		let runner = sink.clone();
		let handle = tokio::spawn(async move { runner.run().await });
		(sink, handle)
	}

	pub async fn queue_len(&self) -> usize {
		self.queue.lock().await.len()
	}

	/// Sends everything queued to the inner sink, `max_batch_size` records at a time.
	pub async fn flush(&self) -> Result<()> {
		let records: Vec<ExposureRecord> = {
			let mut queue = self.queue.lock().await;
			queue.drain(..).collect()
		};

		if records.is_empty() {
			return Ok(());
		}

		debug!(count = records.len(), "Flushing exposure batch");
		let mut first_error = None;
		for chunk in records.chunks(self.config.max_batch_size.max(1)) {
			if let Err(e) = self.inner.log_batch(chunk.to_vec()).await {
				self.metrics.exposure_failures.inc();
				first_error.get_or_insert(e);
			}
		}

		match first_error {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	pub fn shutdown(&self) {
		self.shutdown.store(true, Ordering::SeqCst);
		self.flush_notify.notify_one();
	}

	pub fn is_shutdown(&self) -> bool {
		self.shutdown.load(Ordering::SeqCst)
	}

	/// Background flush loop. Returns after a final flush once shut down.
	pub async fn run(&self) {
		info!(
			flush_interval_ms = self.config.flush_interval.as_millis() as u64,
			max_batch_size = self.config.max_batch_size,
			"Starting exposure batch processor"
		);

		loop {
			tokio::select! {
				_ = tokio::time::sleep(self.flush_interval()) => {}
				_ = self.flush_notify.notified() => {}
			}

			if let Err(e) = self.flush().await {
				error!(error = %e, "Failed to flush exposure batch");
			}
			if self.is_shutdown() {
				break;
			}
		}

		info!("Exposure batch processor stopped");
	}

	fn flush_interval(&self) -> Duration {
		self.config.flush_interval.max(Duration::from_millis(1))
	}
}

#[async_trait]
impl ExposureSink for BatchingExposureSink {
	async fn log_batch(&self, records: Vec<ExposureRecord>) -> Result<()> {
		if self.is_shutdown() {
			return Err(TogglesServerError::Internal("exposure sink is shut down".to_string()));
		}

		let mut queue = self.queue.lock().await;
		for record in records {
			if queue.len() >= self.config.max_queue_size.max(1) {
				if let Some(dropped) = queue.pop_front() {
					self.metrics.exposure_records_dropped.inc();
					warn!(
						flag_key = %dropped.flag_key,
						environment = %dropped.environment,
						"Dropped exposure record due to queue overflow"
					);
				}
			}
			queue.push_back(record);
		}

		if queue.len() >= self.config.max_batch_size {
			drop(queue);
			self.flush_notify.notify_one();
		}
		Ok(())
	}
}
