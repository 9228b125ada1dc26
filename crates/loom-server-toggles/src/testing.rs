// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Helpers for tests in this crate and its integration suite.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;

use loom_toggles_core::ExposureRecord;

use crate::error::{Result, TogglesServerError};
use crate::exposure::ExposureSink;
use crate::schema::ensure_schema;

/// In-memory pool with the toggles schema.
///
/// Limited to one connection: each `:memory:` connection opens its own database.
pub async fn create_test_pool() -> SqlitePool {
	let pool = SqlitePoolOptions::new()
		.max_connections(1)
		.connect(":memory:")
		.await
		.unwrap();
	ensure_schema(&pool).await.unwrap();
	pool
}

/// Exposure sink that keeps every batch it receives, or fails every call.
#[derive(Default)]
pub struct RecordingExposureSink {
	batches: Mutex<Vec<Vec<ExposureRecord>>>,
	fail: bool,
}

impl RecordingExposureSink {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn failing() -> Self {
		Self {
			batches: Mutex::new(Vec::new()),
			fail: true,
		}
	}

	pub async fn batches(&self) -> Vec<Vec<ExposureRecord>> {
		self.batches.lock().await.clone()
	}

	pub async fn records(&self) -> Vec<ExposureRecord> {
		self.batches.lock().await.iter().flatten().cloned().collect()
	}
}

#[async_trait]
impl ExposureSink for RecordingExposureSink {
	async fn log_batch(&self, records: Vec<ExposureRecord>) -> Result<()> {
		if self.fail {
			return Err(TogglesServerError::Internal("analytics backend unavailable".to_string()));
		}
		self.batches.lock().await.push(records);
		Ok(())
	}
}
