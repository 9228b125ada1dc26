// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::error::{Result, ValidationError};

/// An environment-scoped boolean toggle.
///
/// Identified by `(environment, key)`. Never hard-deleted; disable it by writing
/// `enabled_default = false` with no rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagDefinition {
	pub environment: String,
	pub key: String,
	pub enabled_default: bool,
	/// Evaluated in order; the first full match wins.
	pub rules: Vec<Rule>,
	/// Incremented by exactly one on every successful write.
	pub snapshot_version: i64,
	pub last_editor_id: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl FlagDefinition {
	/// Validates the flag key format.
	///
	/// - Lowercase alphanumeric with underscores and dots
	/// - 3-100 characters
	/// - Must start with a lowercase letter
	pub fn validate_key(key: &str) -> bool {
		if key.len() < 3 || key.len() > 100 {
			return false;
		}

		let mut chars = key.chars();

		match chars.next() {
			Some(c) if c.is_ascii_lowercase() => {}
			_ => return false,
		}

		chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.')
	}

	/// Validates an environment name: lowercase alphanumeric with underscores, 2-50 chars.
	pub fn validate_environment(name: &str) -> bool {
		if name.len() < 2 || name.len() > 50 {
			return false;
		}

		let mut chars = name.chars();

		match chars.next() {
			Some(c) if c.is_ascii_lowercase() => {}
			_ => return false,
		}

		chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
	}

	/// Checks identity and rule contents before a write.
	pub fn validate_write(environment: &str, key: &str, rules: &[Rule]) -> Result<()> {
		if !Self::validate_environment(environment) {
			return Err(ValidationError::InvalidEnvironment(environment.to_string()));
		}
		if !Self::validate_key(key) {
			return Err(ValidationError::InvalidFlagKey(key.to_string()));
		}
		rules
			.iter()
			.flat_map(|rule| rule.conditions.iter())
			.try_for_each(Condition::validate)
	}
}

/// An ordered (conditions, value) pair. Conditions are AND-ed; an empty list always matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
	#[serde(rename = "if", default)]
	pub conditions: Vec<Condition>,
	pub then: RuleOutcome,
}

impl Rule {
	pub fn new(conditions: Vec<Condition>, value: bool) -> Self {
		Self {
			conditions,
			then: RuleOutcome { value },
		}
	}

	/// A rule with no conditions, matching every context.
	pub fn catch_all(value: bool) -> Self {
		Self::new(Vec::new(), value)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleOutcome {
	pub value: bool,
}
