// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Table definitions for flags, overrides and exposures.
//!
//! Timestamps are stored as fixed-width RFC3339 text (microseconds, `Z` suffix)
//! so that string comparison orders them chronologically.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;

use crate::error::{Result, TogglesServerError};

const STATEMENTS: &[&str] = &[
	r#"
	CREATE TABLE IF NOT EXISTS toggle_flags (
		environment TEXT NOT NULL,
		key TEXT NOT NULL,
		enabled_default INTEGER NOT NULL,
		rules TEXT NOT NULL,
		snapshot_version INTEGER NOT NULL,
		last_editor_id TEXT,
		created_at TEXT NOT NULL,
		updated_at TEXT NOT NULL,
		PRIMARY KEY (environment, key)
	)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS toggle_overrides (
		id TEXT PRIMARY KEY,
		environment TEXT NOT NULL,
		key TEXT NOT NULL,
		scope_type TEXT NOT NULL,
		scope_id TEXT NOT NULL,
		value INTEGER NOT NULL,
		expires_at TEXT,
		deleted_at TEXT,
		created_at TEXT NOT NULL,
		updated_at TEXT NOT NULL,
		UNIQUE (environment, key, scope_type, scope_id)
	)
	"#,
	r#"
	CREATE INDEX IF NOT EXISTS idx_toggle_overrides_expires_at
		ON toggle_overrides (expires_at)
	"#,
	r#"
	CREATE TABLE IF NOT EXISTS toggle_exposures (
		id INTEGER PRIMARY KEY AUTOINCREMENT,
		environment TEXT NOT NULL,
		flag_key TEXT NOT NULL,
		value INTEGER NOT NULL,
		reason TEXT NOT NULL,
		user_id TEXT,
		tenant_id TEXT,
		timestamp TEXT NOT NULL
	)
	"#,
];

/// Creates the toggles tables if they are missing.
#[tracing::instrument(skip(pool))]
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
	for statement in STATEMENTS {
		sqlx::query(statement).execute(pool).await?;
	}
	Ok(())
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
	ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str, column: &str) -> Result<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(raw)
		.map(|dt| dt.with_timezone(&Utc))
		.map_err(|_| TogglesServerError::Internal(format!("Invalid {column}")))
}

pub(crate) fn parse_opt_ts(raw: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>> {
	raw.map(|s| parse_ts(&s, column)).transpose()
}
