// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Invalidation events exchanged between service instances.
//!
//! Every successful write publishes one event so peers drop their cached copy.
//! Delivery is at-most-once; a peer that misses an event serves the stale entry
//! until its TTL runs out.
//!
//! # Events
//!
//! - `flag.updated` - Flag definition written, carries the new snapshot version
//! - `override.changed` - Override set or cleared for one scope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::overrides::ScopeType;

/// Default bus topic for toggle invalidations.
pub const INVALIDATION_TOPIC: &str = "toggles.invalidate";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum InvalidationEvent {
	#[serde(rename = "flag.updated")]
	FlagUpdated(FlagUpdatedData),

	#[serde(rename = "override.changed")]
	OverrideChanged(OverrideChangedData),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlagUpdatedData {
	pub env: String,
	pub key: String,
	pub snapshot_version: i64,
	pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverrideChangedData {
	pub env: String,
	pub key: String,
	pub scope_type: ScopeType,
	pub scope_id: String,
	pub timestamp: DateTime<Utc>,
}

impl InvalidationEvent {
	pub fn event_type(&self) -> &'static str {
		match self {
			InvalidationEvent::FlagUpdated(_) => "flag.updated",
			InvalidationEvent::OverrideChanged(_) => "override.changed",
		}
	}

	pub fn flag_updated(env: impl Into<String>, key: impl Into<String>, snapshot_version: i64) -> Self {
		InvalidationEvent::FlagUpdated(FlagUpdatedData {
			env: env.into(),
			key: key.into(),
			snapshot_version,
			timestamp: Utc::now(),
		})
	}

	pub fn override_changed(
		env: impl Into<String>,
		key: impl Into<String>,
		scope_type: ScopeType,
		scope_id: impl Into<String>,
	) -> Self {
		InvalidationEvent::OverrideChanged(OverrideChangedData {
			env: env.into(),
			key: key.into(),
			scope_type,
			scope_id: scope_id.into(),
			timestamp: Utc::now(),
		})
	}

	pub fn env(&self) -> &str {
		match self {
			InvalidationEvent::FlagUpdated(data) => &data.env,
			InvalidationEvent::OverrideChanged(data) => &data.env,
		}
	}

	pub fn key(&self) -> &str {
		match self {
			InvalidationEvent::FlagUpdated(data) => &data.key,
			InvalidationEvent::OverrideChanged(data) => &data.key,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flag_updated_wire_format() {
		let event = InvalidationEvent::flag_updated("prod", "beta_dashboard", 4);
		let json = serde_json::to_value(&event).unwrap();
		assert_eq!(json["event"], "flag.updated");
		assert_eq!(json["data"]["env"], "prod");
		assert_eq!(json["data"]["key"], "beta_dashboard");
		assert_eq!(json["data"]["snapshotVersion"], 4);
	}

	#[test]
	fn override_changed_wire_format() {
		let event = InvalidationEvent::override_changed("prod", "billing_enabled", ScopeType::Tenant, "t1");
		let json = serde_json::to_value(&event).unwrap();
		assert_eq!(json["event"], "override.changed");
		assert_eq!(json["data"]["scopeType"], "tenant");
		assert_eq!(json["data"]["scopeId"], "t1");
	}

	#[test]
	fn event_type_matches_tag() {
		let events = vec![
			InvalidationEvent::flag_updated("prod", "a_flag", 1),
			InvalidationEvent::override_changed("prod", "a_flag", ScopeType::User, "u1"),
		];
		for event in events {
			let json = serde_json::to_string(&event).unwrap();
			assert!(json.contains(&format!(r#""event":"{}""#, event.event_type())));
			let parsed: InvalidationEvent = serde_json::from_str(&json).unwrap();
			assert_eq!(parsed.key(), "a_flag");
			assert_eq!(parsed.env(), "prod");
		}
	}
}
