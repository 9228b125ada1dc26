// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use std::str::FromStr;

use crate::error::{Result, TogglesServerError};

/// Create a SqlitePool with WAL mode, then make sure the toggles tables exist.
///
/// # Arguments
/// * `database_url` - SQLite connection string (e.g., "sqlite:./loom-toggles.db")
///
/// # Errors
/// Returns `TogglesServerError::Internal` if the URL is invalid, or
/// `TogglesServerError::Database` if connecting or migrating fails.
#[tracing::instrument(skip(database_url))]
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
	let options = SqliteConnectOptions::from_str(database_url)
		.map_err(|e| TogglesServerError::Internal(format!("Invalid database URL: {e}")))?
		.journal_mode(SqliteJournalMode::Wal)
		.synchronous(SqliteSynchronous::Normal)
		.create_if_missing(true);

	let pool = SqlitePool::connect_with(options).await?;
	crate::schema::ensure_schema(&pool).await?;

	tracing::debug!("toggles database pool created");
	Ok(pool)
}
