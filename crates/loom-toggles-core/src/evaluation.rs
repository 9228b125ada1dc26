// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which precedence tier produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolutionReason {
	UserOverride,
	TenantOverride,
	RuleMatch { rule_index: usize },
	Default,
	FlagNotFound,
}

impl ResolutionReason {
	/// Stable label for metrics and exposure records.
	pub fn as_str(&self) -> &'static str {
		match self {
			ResolutionReason::UserOverride => "user_override",
			ResolutionReason::TenantOverride => "tenant_override",
			ResolutionReason::RuleMatch { .. } => "rule_match",
			ResolutionReason::Default => "default",
			ResolutionReason::FlagNotFound => "flag_not_found",
		}
	}
}

impl fmt::Display for ResolutionReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ResolutionReason::RuleMatch { rule_index } => write!(f, "rule_match[{rule_index}]"),
			other => f.write_str(other.as_str()),
		}
	}
}

/// A resolved flag value and where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
	pub value: bool,
	pub reason: ResolutionReason,
}

impl Resolution {
	pub fn new(value: bool, reason: ResolutionReason) -> Self {
		Self { value, reason }
	}
}

/// Write-only telemetry for one evaluation decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureRecord {
	pub environment: String,
	pub flag_key: String,
	pub value: bool,
	pub reason: ResolutionReason,
	pub user_id: Option<String>,
	pub tenant_id: Option<String>,
	pub timestamp: DateTime<Utc>,
}
