// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

use loom_toggles_core::{FlagDefinition, Override, OverrideId, OverrideScope, OverrideValue, Rule};

use crate::error::{Result, TogglesServerError};
use crate::schema::{format_ts, parse_opt_ts, parse_ts};

/// Input to a flag write. The store assigns the version and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagWrite {
	pub environment: String,
	pub key: String,
	pub enabled_default: bool,
	pub rules: Vec<Rule>,
	pub last_editor_id: Option<String>,
}

/// Result of a versioned flag upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
	Written(FlagDefinition),
	/// The expected version did not match; nothing was changed.
	Conflict { current_version: Option<i64> },
}

/// Persistence port for flag definitions.
#[async_trait]
pub trait FlagStore: Send + Sync {
	async fn get(&self, environment: &str, key: &str) -> Result<Option<FlagDefinition>>;

	/// Writes a flag, incrementing `snapshot_version` by one.
	///
	/// With `expected_version = Some(v)` the write only applies if the stored version is `v`
	/// (`Some(0)` means "must not exist yet"). The check and increment are one atomic statement.
	async fn upsert(&self, write: &FlagWrite, expected_version: Option<i64>) -> Result<UpsertOutcome>;
}

/// Persistence port for per-scope overrides.
#[async_trait]
pub trait OverrideStore: Send + Sync {
	/// Active value for a scope. Expired and soft-deleted rows are filtered out here.
	async fn find(&self, scope: &OverrideScope, now: DateTime<Utc>) -> Result<Option<OverrideValue>>;

	/// Last-writer-wins upsert. Revives a soft-deleted row.
	async fn upsert(
		&self,
		scope: &OverrideScope,
		value: bool,
		expires_at: Option<DateTime<Utc>>,
	) -> Result<Override>;

	async fn soft_delete(&self, scope: &OverrideScope) -> Result<()>;

	/// Soft-deleted or expired rows, oldest first, for the sweep job.
	async fn list_expired_for_cleanup(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Override>>;

	/// Physically removes the listed rows that are still soft-deleted or expired at
	/// `now`. Rows revived since they were listed are kept. Returns how many were deleted.
	async fn purge(&self, ids: &[OverrideId], now: DateTime<Utc>) -> Result<u64>;
}

/// One pass of the expired-override sweep. Returns the number of rows removed.
#[instrument(skip(store))]
pub async fn sweep_expired_overrides(
	store: &dyn OverrideStore,
	now: DateTime<Utc>,
	limit: u32,
) -> Result<u64> {
	let expired = store.list_expired_for_cleanup(now, limit).await?;
	if expired.is_empty() {
		return Ok(0);
	}

	let ids: Vec<OverrideId> = expired.iter().map(|o| o.id).collect();
	let removed = store.purge(&ids, now).await?;
	tracing::info!(removed, "swept expired overrides");
	Ok(removed)
}

/// SQLite implementation of [`FlagStore`].
#[derive(Clone)]
pub struct SqliteFlagStore {
	pool: SqlitePool,
}

impl SqliteFlagStore {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	async fn current_version(&self, environment: &str, key: &str) -> Result<Option<i64>> {
		let row: Option<(i64,)> = sqlx::query_as(
			r#"
			SELECT snapshot_version FROM toggle_flags
			WHERE environment = ? AND key = ?
			"#,
		)
		.bind(environment)
		.bind(key)
		.fetch_optional(&self.pool)
		.await?;

		Ok(row.map(|(v,)| v))
	}
}

const FLAG_COLUMNS: &str =
	"environment, key, enabled_default, rules, snapshot_version, last_editor_id, created_at, updated_at";

#[async_trait]
impl FlagStore for SqliteFlagStore {
	#[instrument(skip(self), fields(environment = %environment, key = %key))]
	async fn get(&self, environment: &str, key: &str) -> Result<Option<FlagDefinition>> {
		let row = sqlx::query_as::<_, FlagRow>(&format!(
			"SELECT {FLAG_COLUMNS} FROM toggle_flags WHERE environment = ? AND key = ?"
		))
		.bind(environment)
		.bind(key)
		.fetch_optional(&self.pool)
		.await?;

		row.map(TryInto::try_into).transpose()
	}

	#[instrument(
		skip(self, write),
		fields(environment = %write.environment, key = %write.key, expected_version = ?expected_version)
	)]
	async fn upsert(&self, write: &FlagWrite, expected_version: Option<i64>) -> Result<UpsertOutcome> {
		let rules = serde_json::to_string(&write.rules)?;
		let now = format_ts(Utc::now());

		let row = match expected_version {
			None => {
				sqlx::query_as::<_, FlagRow>(&format!(
					r#"
					INSERT INTO toggle_flags ({FLAG_COLUMNS})
					VALUES (?, ?, ?, ?, 1, ?, ?, ?)
					ON CONFLICT (environment, key) DO UPDATE SET
						enabled_default = excluded.enabled_default,
						rules = excluded.rules,
						last_editor_id = excluded.last_editor_id,
						updated_at = excluded.updated_at,
						snapshot_version = toggle_flags.snapshot_version + 1
					RETURNING {FLAG_COLUMNS}
					"#
				))
				.bind(&write.environment)
				.bind(&write.key)
				.bind(write.enabled_default)
				.bind(&rules)
				.bind(&write.last_editor_id)
				.bind(&now)
				.bind(&now)
				.fetch_optional(&self.pool)
				.await?
			}
			Some(0) => {
				sqlx::query_as::<_, FlagRow>(&format!(
					r#"
					INSERT INTO toggle_flags ({FLAG_COLUMNS})
					VALUES (?, ?, ?, ?, 1, ?, ?, ?)
					ON CONFLICT (environment, key) DO NOTHING
					RETURNING {FLAG_COLUMNS}
					"#
				))
				.bind(&write.environment)
				.bind(&write.key)
				.bind(write.enabled_default)
				.bind(&rules)
				.bind(&write.last_editor_id)
				.bind(&now)
				.bind(&now)
				.fetch_optional(&self.pool)
				.await?
			}
			Some(expected) => {
				sqlx::query_as::<_, FlagRow>(&format!(
					r#"
					UPDATE toggle_flags SET
						enabled_default = ?,
						rules = ?,
						last_editor_id = ?,
						updated_at = ?,
						snapshot_version = snapshot_version + 1
					WHERE environment = ? AND key = ? AND snapshot_version = ?
					RETURNING {FLAG_COLUMNS}
					"#
				))
				.bind(write.enabled_default)
				.bind(&rules)
				.bind(&write.last_editor_id)
				.bind(&now)
				.bind(&write.environment)
				.bind(&write.key)
				.bind(expected)
				.fetch_optional(&self.pool)
				.await?
			}
		};

		match row {
			Some(row) => Ok(UpsertOutcome::Written(row.try_into()?)),
			None => {
				let current_version = self.current_version(&write.environment, &write.key).await?;
				tracing::debug!(?current_version, "flag write lost version check");
				Ok(UpsertOutcome::Conflict { current_version })
			}
		}
	}
}

/// SQLite implementation of [`OverrideStore`].
#[derive(Clone)]
pub struct SqliteOverrideStore {
	pool: SqlitePool,
}

impl SqliteOverrideStore {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}
}

const OVERRIDE_COLUMNS: &str =
	"id, environment, key, scope_type, scope_id, value, expires_at, deleted_at, created_at, updated_at";

#[async_trait]
impl OverrideStore for SqliteOverrideStore {
	#[instrument(skip(self, scope), fields(scope = %scope))]
	async fn find(&self, scope: &OverrideScope, now: DateTime<Utc>) -> Result<Option<OverrideValue>> {
		let row: Option<(bool, Option<String>)> = sqlx::query_as(
			r#"
			SELECT value, expires_at FROM toggle_overrides
			WHERE environment = ? AND key = ? AND scope_type = ? AND scope_id = ?
				AND deleted_at IS NULL
				AND (expires_at IS NULL OR expires_at > ?)
			"#,
		)
		.bind(&scope.environment)
		.bind(&scope.key)
		.bind(scope.scope_type.as_str())
		.bind(&scope.scope_id)
		.bind(format_ts(now))
		.fetch_optional(&self.pool)
		.await?;

		row.map(|(value, expires_at)| {
			Ok(OverrideValue {
				value,
				expires_at: parse_opt_ts(expires_at, "expires_at")?,
			})
		})
		.transpose()
	}

	#[instrument(skip(self, scope), fields(scope = %scope, value = value))]
	async fn upsert(
		&self,
		scope: &OverrideScope,
		value: bool,
		expires_at: Option<DateTime<Utc>>,
	) -> Result<Override> {
		let now = format_ts(Utc::now());

		let row = sqlx::query_as::<_, OverrideRow>(&format!(
			r#"
			INSERT INTO toggle_overrides ({OVERRIDE_COLUMNS})
			VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
			ON CONFLICT (environment, key, scope_type, scope_id) DO UPDATE SET
				value = excluded.value,
				expires_at = excluded.expires_at,
				deleted_at = NULL,
				updated_at = excluded.updated_at
			RETURNING {OVERRIDE_COLUMNS}
			"#
		))
		.bind(OverrideId::new().to_string())
		.bind(&scope.environment)
		.bind(&scope.key)
		.bind(scope.scope_type.as_str())
		.bind(&scope.scope_id)
		.bind(value)
		.bind(expires_at.map(format_ts))
		.bind(&now)
		.bind(&now)
		.fetch_one(&self.pool)
		.await?;

		row.try_into()
	}

	#[instrument(skip(self, scope), fields(scope = %scope))]
	async fn soft_delete(&self, scope: &OverrideScope) -> Result<()> {
		let now = format_ts(Utc::now());

		let result = sqlx::query(
			r#"
			UPDATE toggle_overrides SET deleted_at = ?, updated_at = ?
			WHERE environment = ? AND key = ? AND scope_type = ? AND scope_id = ?
				AND deleted_at IS NULL
			"#,
		)
		.bind(&now)
		.bind(&now)
		.bind(&scope.environment)
		.bind(&scope.key)
		.bind(scope.scope_type.as_str())
		.bind(&scope.scope_id)
		.execute(&self.pool)
		.await?;

		tracing::debug!(rows = result.rows_affected(), "override soft-deleted");
		Ok(())
	}

	#[instrument(skip(self))]
	async fn list_expired_for_cleanup(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Override>> {
		let rows = sqlx::query_as::<_, OverrideRow>(&format!(
			r#"
			SELECT {OVERRIDE_COLUMNS} FROM toggle_overrides
			WHERE deleted_at IS NOT NULL
				OR (expires_at IS NOT NULL AND expires_at <= ?)
			ORDER BY updated_at ASC
			LIMIT ?
			"#
		))
		.bind(format_ts(now))
		.bind(i64::from(limit))
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(TryInto::try_into).collect()
	}

	#[instrument(skip(self, ids), fields(count = ids.len()))]
	async fn purge(&self, ids: &[OverrideId], now: DateTime<Utc>) -> Result<u64> {
		let now = format_ts(now);
		let mut tx = self.pool.begin().await?;
		let mut removed = 0;

		for id in ids {
			let result = sqlx::query(
				r#"
				DELETE FROM toggle_overrides
				WHERE id = ?
					AND (deleted_at IS NOT NULL
						OR (expires_at IS NOT NULL AND expires_at <= ?))
				"#,
			)
			.bind(id.to_string())
			.bind(&now)
			.execute(&mut *tx)
			.await?;
			removed += result.rows_affected();
		}

		tx.commit().await?;
		Ok(removed)
	}
}

#[derive(sqlx::FromRow)]
struct FlagRow {
	environment: String,
	key: String,
	enabled_default: bool,
	rules: String,
	snapshot_version: i64,
	last_editor_id: Option<String>,
	created_at: String,
	updated_at: String,
}

impl TryFrom<FlagRow> for FlagDefinition {
	type Error = TogglesServerError;

	fn try_from(row: FlagRow) -> Result<Self> {
		Ok(FlagDefinition {
			rules: serde_json::from_str(&row.rules)?,
			created_at: parse_ts(&row.created_at, "created_at")?,
			updated_at: parse_ts(&row.updated_at, "updated_at")?,
			environment: row.environment,
			key: row.key,
			enabled_default: row.enabled_default,
			snapshot_version: row.snapshot_version,
			last_editor_id: row.last_editor_id,
		})
	}
}

#[derive(sqlx::FromRow)]
struct OverrideRow {
	id: String,
	environment: String,
	key: String,
	scope_type: String,
	scope_id: String,
	value: bool,
	expires_at: Option<String>,
	deleted_at: Option<String>,
	created_at: String,
	updated_at: String,
}

impl TryFrom<OverrideRow> for Override {
	type Error = TogglesServerError;

	fn try_from(row: OverrideRow) -> Result<Self> {
		Ok(Override {
			id: row
				.id
				.parse()
				.map_err(|_| TogglesServerError::Internal("Invalid override ID".to_string()))?,
			scope_type: row
				.scope_type
				.parse()
				.map_err(TogglesServerError::Internal)?,
			expires_at: parse_opt_ts(row.expires_at, "expires_at")?,
			deleted_at: parse_opt_ts(row.deleted_at, "deleted_at")?,
			created_at: parse_ts(&row.created_at, "created_at")?,
			updated_at: parse_ts(&row.updated_at, "updated_at")?,
			environment: row.environment,
			key: row.key,
			scope_id: row.scope_id,
			value: row.value,
		})
	}
}
