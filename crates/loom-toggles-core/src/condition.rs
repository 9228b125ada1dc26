// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Targeting conditions and the condition matcher.
//!
//! Conditions serialize as single-key objects, e.g. `{"planIn": ["pro"]}` or
//! `{"percentage": 25}`, so exactly one variant is populated per instance.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::context::EvaluationContext;
use crate::error::{Result, ValidationError};

/// Number of percentage buckets.
pub const BUCKET_COUNT: u32 = 100;

/// One atomic predicate over an [`EvaluationContext`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Condition {
	/// Plan id is one of the set.
	PlanIn(BTreeSet<String>),
	/// Country code is one of the set (case-insensitive).
	CountryIn(BTreeSet<String>),
	/// Domain after the last `@` of the email is one of the set (case-insensitive).
	EmailDomainIn(BTreeSet<String>),
	/// At least one tenant tag is in the set (case-insensitive).
	TenantTagIn(BTreeSet<String>),
	/// Evaluation instant lies within the inclusive window. Missing bounds are open.
	TimeWindow {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		from: Option<DateTime<Utc>>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		to: Option<DateTime<Utc>>,
	},
	/// Subject falls in one of the first `threshold` buckets out of 100.
	Percentage(u8),
}

impl Condition {
	pub fn plan_in<I, S>(plans: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Condition::PlanIn(plans.into_iter().map(Into::into).collect())
	}

	pub fn country_in<I, S>(countries: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Condition::CountryIn(lowercase_set(countries))
	}

	pub fn email_domain_in<I, S>(domains: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Condition::EmailDomainIn(lowercase_set(domains))
	}

	pub fn tenant_tag_in<I, S>(tags: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Condition::TenantTagIn(lowercase_set(tags))
	}

	pub fn time_window(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
		Condition::TimeWindow { from, to }
	}

	pub fn percentage(threshold: u8) -> Self {
		Condition::Percentage(threshold)
	}

	/// Short name of the variant, used in logs.
	pub fn kind(&self) -> &'static str {
		match self {
			Condition::PlanIn(_) => "planIn",
			Condition::CountryIn(_) => "countryIn",
			Condition::EmailDomainIn(_) => "emailDomainIn",
			Condition::TenantTagIn(_) => "tenantTagIn",
			Condition::TimeWindow { .. } => "timeWindow",
			Condition::Percentage(_) => "percentage",
		}
	}

	/// Rejects conditions that can never be stored.
	pub fn validate(&self) -> Result<()> {
		match self {
			Condition::Percentage(threshold) if *threshold > 100 => {
				Err(ValidationError::PercentageOutOfRange(*threshold))
			}
			Condition::TimeWindow {
				from: Some(from),
				to: Some(to),
			} if from > to => Err(ValidationError::InvertedTimeWindow),
			_ => Ok(()),
		}
	}

	/// Evaluates this condition against a context.
	///
	/// Total: a context field the variant needs but that is missing yields `false`.
	pub fn matches(&self, context: &EvaluationContext) -> bool {
		match self {
			Condition::PlanIn(plans) => context
				.plan
				.as_ref()
				.is_some_and(|plan| plans.contains(plan)),
			Condition::CountryIn(countries) => context
				.country
				.as_deref()
				.is_some_and(|country| contains_ignore_case(countries, country)),
			Condition::EmailDomainIn(domains) => context
				.email
				.as_deref()
				.and_then(email_domain)
				.is_some_and(|domain| contains_ignore_case(domains, domain)),
			Condition::TenantTagIn(tags) => context.tenant_tags.as_ref().is_some_and(|have| {
				have.iter().any(|tag| contains_ignore_case(tags, tag))
			}),
			Condition::TimeWindow { from, to } => {
				let now = context.effective_now();
				from.map_or(true, |from| now >= from) && to.map_or(true, |to| now <= to)
			}
			Condition::Percentage(threshold) => in_rollout(context.subject_id(), *threshold),
		}
	}
}

/// Bucket in `[0, 99]` for a subject.
///
/// SHA-1 of the UTF-8 subject, first four digest bytes read as a big-endian `u32`,
/// reduced modulo 100. The mapping is part of the rollout contract: changing it
/// reshuffles every subject in every partial rollout.
pub fn bucket_for(subject: &str) -> u32 {
	let digest = Sha1::digest(subject.as_bytes());
	let prefix = [digest[0], digest[1], digest[2], digest[3]];
	u32::from_be_bytes(prefix) % BUCKET_COUNT
}

/// Whether `subject` is inside a rollout of `threshold` percent.
pub fn in_rollout(subject: &str, threshold: u8) -> bool {
	bucket_for(subject) < u32::from(threshold)
}

fn email_domain(email: &str) -> Option<&str> {
	email
		.rsplit_once('@')
		.map(|(_, domain)| domain)
		.filter(|domain| !domain.is_empty())
}

fn contains_ignore_case(set: &BTreeSet<String>, value: &str) -> bool {
	let value = value.to_lowercase();
	set.contains(&value) || set.iter().any(|member| member.to_lowercase() == value)
}

fn lowercase_set<I, S>(values: I) -> BTreeSet<String>
where
	I: IntoIterator<Item = S>,
	S: Into<String>,
{
	values.into_iter().map(|v| v.into().to_lowercase()).collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
		Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
	}

	#[test]
	fn plan_in_requires_plan() {
		let cond = Condition::plan_in(["pro", "enterprise"]);
		assert!(cond.matches(&EvaluationContext::new().with_plan("pro")));
		assert!(!cond.matches(&EvaluationContext::new().with_plan("free")));
		assert!(!cond.matches(&EvaluationContext::new()));
	}

	#[test]
	fn plan_in_is_case_sensitive() {
		let cond = Condition::plan_in(["pro"]);
		assert!(!cond.matches(&EvaluationContext::new().with_plan("PRO")));
	}

	#[test]
	fn country_in_ignores_case() {
		let cond = Condition::country_in(["us", "ca"]);
		assert!(cond.matches(&EvaluationContext::new().with_country("US")));
		assert!(cond.matches(&EvaluationContext::new().with_country("ca")));
		assert!(!cond.matches(&EvaluationContext::new().with_country("DE")));
		assert!(!cond.matches(&EvaluationContext::new()));
	}

	#[test]
	fn country_in_tolerates_uppercase_set() {
		let cond = Condition::CountryIn(["US".to_string()].into_iter().collect());
		assert!(cond.matches(&EvaluationContext::new().with_country("us")));
	}

	#[test]
	fn email_domain_uses_last_at() {
		let cond = Condition::email_domain_in(["example.com"]);
		assert!(cond.matches(&EvaluationContext::new().with_email("jo@Example.COM")));
		assert!(cond.matches(&EvaluationContext::new().with_email("odd@name@example.com")));
		assert!(!cond.matches(&EvaluationContext::new().with_email("jo@example.org")));
	}

	#[test]
	fn email_domain_rejects_unparseable() {
		let cond = Condition::email_domain_in(["example.com"]);
		assert!(!cond.matches(&EvaluationContext::new().with_email("example.com")));
		assert!(!cond.matches(&EvaluationContext::new().with_email("jo@")));
		assert!(!cond.matches(&EvaluationContext::new()));
	}

	#[test]
	fn tenant_tag_intersection() {
		let cond = Condition::tenant_tag_in(["Beta", "internal"]);
		assert!(cond.matches(&EvaluationContext::new().with_tenant_tags(["BETA"])));
		assert!(cond.matches(&EvaluationContext::new().with_tenant_tags(["x", "internal"])));
		assert!(!cond.matches(&EvaluationContext::new().with_tenant_tags(["x"])));
		assert!(!cond.matches(&EvaluationContext::new().with_tenant_tags(Vec::<String>::new())));
		assert!(!cond.matches(&EvaluationContext::new()));
	}

	#[test]
	fn time_window_is_inclusive() {
		let cond = Condition::time_window(Some(at(2024, 1, 1)), Some(at(2024, 2, 1)));
		assert!(cond.matches(&EvaluationContext::new().with_now(at(2024, 1, 1))));
		assert!(cond.matches(&EvaluationContext::new().with_now(at(2024, 2, 1))));
		assert!(cond.matches(&EvaluationContext::new().with_now(at(2024, 1, 15))));
		assert!(!cond.matches(&EvaluationContext::new().with_now(at(2023, 12, 31))));
		assert!(!cond.matches(&EvaluationContext::new().with_now(at(2024, 2, 2))));
	}

	#[test]
	fn time_window_open_bounds() {
		let after = Condition::time_window(Some(at(2024, 1, 1)), None);
		assert!(after.matches(&EvaluationContext::new().with_now(at(2099, 1, 1))));
		assert!(!after.matches(&EvaluationContext::new().with_now(at(2000, 1, 1))));

		let before = Condition::time_window(None, Some(at(2024, 1, 1)));
		assert!(before.matches(&EvaluationContext::new().with_now(at(2000, 1, 1))));

		let always = Condition::time_window(None, None);
		assert!(always.matches(&EvaluationContext::new()));
	}

	#[test]
	fn time_window_defaults_to_wall_clock() {
		let past = Condition::time_window(None, Some(at(2000, 1, 1)));
		assert!(!past.matches(&EvaluationContext::new()));
	}

	#[test]
	fn percentage_edges() {
		for i in 0..200 {
			let ctx = EvaluationContext::new().with_user_id(format!("user{i}"));
			assert!(!Condition::percentage(0).matches(&ctx));
			assert!(Condition::percentage(100).matches(&ctx));
		}
	}

	#[test]
	fn percentage_uses_subject_fallbacks() {
		let anon = EvaluationContext::new();
		assert_eq!(
			Condition::percentage(50).matches(&anon),
			in_rollout("anon", 50)
		);

		let tenant = EvaluationContext::new().with_tenant_id("t-42");
		assert_eq!(
			Condition::percentage(50).matches(&tenant),
			in_rollout("t-42", 50)
		);
	}

	#[test]
	fn bucket_matches_sha1_prefix() {
		// sha1("abc") = a9993e36...
		assert_eq!(bucket_for("abc"), 0xa999_3e36_u32 % 100);
		// sha1("") = da39a3ee...
		assert_eq!(bucket_for(""), 0xda39_a3ee_u32 % 100);
	}

	#[test]
	fn serializes_as_single_key_object() {
		let json = serde_json::to_value(Condition::percentage(25)).unwrap();
		assert_eq!(json, serde_json::json!({"percentage": 25}));

		let json = serde_json::to_value(Condition::plan_in(["pro"])).unwrap();
		assert_eq!(json, serde_json::json!({"planIn": ["pro"]}));

		let cond: Condition =
			serde_json::from_str(r#"{"timeWindow":{"from":"2024-01-01T00:00:00Z"}}"#).unwrap();
		assert_eq!(cond, Condition::time_window(Some(at(2024, 1, 1)), None));
	}

	#[test]
	fn rejects_multiple_variants() {
		let result: std::result::Result<Condition, _> =
			serde_json::from_str(r#"{"planIn":["pro"],"percentage":10}"#);
		assert!(result.is_err());
	}

	#[test]
	fn validate_rejects_bad_conditions() {
		assert_eq!(
			Condition::percentage(101).validate(),
			Err(ValidationError::PercentageOutOfRange(101))
		);
		assert_eq!(
			Condition::time_window(Some(at(2024, 2, 1)), Some(at(2024, 1, 1))).validate(),
			Err(ValidationError::InvertedTimeWindow)
		);
		assert!(Condition::percentage(100).validate().is_ok());
		assert!(Condition::time_window(Some(at(2024, 1, 1)), Some(at(2024, 1, 1)))
			.validate()
			.is_ok());
	}
}
