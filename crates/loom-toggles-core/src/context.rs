// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subject used for percentage bucketing when neither a user nor a tenant is known.
pub const ANONYMOUS_SUBJECT: &str = "anon";

/// Per-call evaluation input. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tenant_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub email: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub country: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tenant_tags: Option<Vec<String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub plan: Option<String>,
	/// Evaluation instant. Falls back to wall-clock time when absent.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub now: Option<DateTime<Utc>>,
}

impl EvaluationContext {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
		self.user_id = Some(user_id.into());
		self
	}

	pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
		self.tenant_id = Some(tenant_id.into());
		self
	}

	pub fn with_email(mut self, email: impl Into<String>) -> Self {
		self.email = Some(email.into());
		self
	}

	pub fn with_country(mut self, country: impl Into<String>) -> Self {
		self.country = Some(country.into());
		self
	}

	pub fn with_tenant_tags<I, S>(mut self, tags: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.tenant_tags = Some(tags.into_iter().map(Into::into).collect());
		self
	}

	pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
		self.plan = Some(plan.into());
		self
	}

	pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
		self.now = Some(now);
		self
	}

	/// Stable identifier used for percentage bucketing.
	///
	/// Prefers the user, then the tenant, then [`ANONYMOUS_SUBJECT`].
	pub fn subject_id(&self) -> &str {
		self
			.user_id
			.as_deref()
			.or(self.tenant_id.as_deref())
			.unwrap_or(ANONYMOUS_SUBJECT)
	}

	/// The instant conditions are evaluated at.
	pub fn effective_now(&self) -> DateTime<Utc> {
		self.now.unwrap_or_else(Utc::now)
	}

	/// Returns a copy with `now` pinned, so every key in a batch sees the same instant.
	pub fn pinned(&self, now: DateTime<Utc>) -> Self {
		let mut ctx = self.clone();
		ctx.now.get_or_insert(now);
		ctx
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	#[test]
	fn subject_prefers_user_then_tenant() {
		let ctx = EvaluationContext::new()
			.with_user_id("u1")
			.with_tenant_id("t1");
		assert_eq!(ctx.subject_id(), "u1");

		let ctx = EvaluationContext::new().with_tenant_id("t1");
		assert_eq!(ctx.subject_id(), "t1");

		assert_eq!(EvaluationContext::new().subject_id(), "anon");
	}

	#[test]
	fn pinned_keeps_explicit_now() {
		let explicit = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
		let batch = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

		let ctx = EvaluationContext::new().with_now(explicit).pinned(batch);
		assert_eq!(ctx.now, Some(explicit));

		let ctx = EvaluationContext::new().pinned(batch);
		assert_eq!(ctx.now, Some(batch));
	}

	#[test]
	fn deserializes_camel_case() {
		let ctx: EvaluationContext = serde_json::from_str(
			r#"{"userId":"u1","tenantId":"t1","tenantTags":["beta"],"plan":"pro"}"#,
		)
		.unwrap();
		assert_eq!(ctx.user_id.as_deref(), Some("u1"));
		assert_eq!(ctx.tenant_id.as_deref(), Some("t1"));
		assert_eq!(ctx.tenant_tags, Some(vec!["beta".to_string()]));
		assert_eq!(ctx.plan.as_deref(), Some("pro"));
		assert!(ctx.email.is_none());
	}
}
