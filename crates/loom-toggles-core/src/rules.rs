// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::context::EvaluationContext;
use crate::evaluation::{Resolution, ResolutionReason};
use crate::flag::{FlagDefinition, Rule};

/// Resolves a flag from its rules alone.
///
/// Rules are walked in stored order and the first rule whose conditions all match
/// decides the value; later rules are never looked at. With no match the flag's
/// `enabled_default` applies. A missing flag resolves to `false`.
pub fn evaluate_rules(flag: Option<&FlagDefinition>, context: &EvaluationContext) -> Resolution {
	let Some(flag) = flag else {
		return Resolution::new(false, ResolutionReason::FlagNotFound);
	};

	match first_match(&flag.rules, context) {
		Some((rule_index, rule)) => {
			Resolution::new(rule.then.value, ResolutionReason::RuleMatch { rule_index })
		}
		None => Resolution::new(flag.enabled_default, ResolutionReason::Default),
	}
}

/// Boolean-only form of [`evaluate_rules`].
pub fn apply_rules(flag: Option<&FlagDefinition>, context: &EvaluationContext) -> bool {
	evaluate_rules(flag, context).value
}

fn first_match<'a>(rules: &'a [Rule], context: &EvaluationContext) -> Option<(usize, &'a Rule)> {
	rules.iter().enumerate().find(|(_, rule)| {
		rule
			.conditions
			.iter()
			.all(|condition| condition.matches(context))
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::condition::Condition;
	use chrono::Utc;

	fn flag(enabled_default: bool, rules: Vec<Rule>) -> FlagDefinition {
		FlagDefinition {
			environment: "prod".to_string(),
			key: "beta_dashboard".to_string(),
			enabled_default,
			rules,
			snapshot_version: 1,
			last_editor_id: None,
			created_at: Utc::now(),
			updated_at: Utc::now(),
		}
	}

	#[test]
	fn missing_flag_is_false() {
		let result = evaluate_rules(None, &EvaluationContext::new());
		assert!(!result.value);
		assert_eq!(result.reason, ResolutionReason::FlagNotFound);
	}

	#[test]
	fn no_rules_uses_default() {
		let ctx = EvaluationContext::new();
		assert!(apply_rules(Some(&flag(true, vec![])), &ctx));
		assert!(!apply_rules(Some(&flag(false, vec![])), &ctx));
		assert_eq!(
			evaluate_rules(Some(&flag(true, vec![])), &ctx).reason,
			ResolutionReason::Default
		);
	}

	#[test]
	fn first_matching_rule_wins() {
		let f = flag(
			false,
			vec![
				Rule::new(vec![Condition::plan_in(["pro"])], true),
				Rule::new(vec![Condition::plan_in(["pro", "free"])], false),
			],
		);

		let ctx = EvaluationContext::new().with_plan("pro");
		let result = evaluate_rules(Some(&f), &ctx);
		assert!(result.value);
		assert_eq!(result.reason, ResolutionReason::RuleMatch { rule_index: 0 });

		let ctx = EvaluationContext::new().with_plan("free");
		let result = evaluate_rules(Some(&f), &ctx);
		assert!(!result.value);
		assert_eq!(result.reason, ResolutionReason::RuleMatch { rule_index: 1 });
	}

	#[test]
	fn conditions_are_conjunctive() {
		let f = flag(
			false,
			vec![Rule::new(
				vec![Condition::plan_in(["enterprise"]), Condition::country_in(["us"])],
				true,
			)],
		);

		let both = EvaluationContext::new()
			.with_plan("enterprise")
			.with_country("US");
		assert!(apply_rules(Some(&f), &both));

		let plan_only = EvaluationContext::new()
			.with_plan("enterprise")
			.with_country("DE");
		assert!(!apply_rules(Some(&f), &plan_only));

		let country_only = EvaluationContext::new()
			.with_plan("free")
			.with_country("US");
		assert!(!apply_rules(Some(&f), &country_only));
	}

	#[test]
	fn empty_conditions_catch_all() {
		let f = flag(
			true,
			vec![
				Rule::new(vec![Condition::plan_in(["pro"])], true),
				Rule::catch_all(false),
			],
		);
		let result = evaluate_rules(Some(&f), &EvaluationContext::new());
		assert!(!result.value);
		assert_eq!(result.reason, ResolutionReason::RuleMatch { rule_index: 1 });
	}

	#[test]
	fn unmatched_rules_fall_to_default() {
		let f = flag(true, vec![Rule::new(vec![Condition::plan_in(["pro"])], false)]);
		let result = evaluate_rules(Some(&f), &EvaluationContext::new().with_plan("free"));
		assert!(result.value);
		assert_eq!(result.reason, ResolutionReason::Default);
	}
}
