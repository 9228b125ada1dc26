// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ValidationError};
use crate::flag::FlagDefinition;

/// Unique identifier for a stored override row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverrideId(pub Uuid);

impl OverrideId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for OverrideId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for OverrideId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for OverrideId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

/// Targeting dimension of an override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
	User,
	Tenant,
}

impl ScopeType {
	pub fn as_str(&self) -> &'static str {
		match self {
			ScopeType::User => "user",
			ScopeType::Tenant => "tenant",
		}
	}
}

impl fmt::Display for ScopeType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ScopeType {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s {
			"user" => Ok(ScopeType::User),
			"tenant" => Ok(ScopeType::Tenant),
			other => Err(format!("unknown scope type: {other}")),
		}
	}
}

/// The four-part identity of an override.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideScope {
	pub environment: String,
	pub key: String,
	pub scope_type: ScopeType,
	pub scope_id: String,
}

impl OverrideScope {
	pub fn new(
		environment: impl Into<String>,
		key: impl Into<String>,
		scope_type: ScopeType,
		scope_id: impl Into<String>,
	) -> Self {
		Self {
			environment: environment.into(),
			key: key.into(),
			scope_type,
			scope_id: scope_id.into(),
		}
	}

	pub fn user(environment: impl Into<String>, key: impl Into<String>, user_id: impl Into<String>) -> Self {
		Self::new(environment, key, ScopeType::User, user_id)
	}

	pub fn tenant(
		environment: impl Into<String>,
		key: impl Into<String>,
		tenant_id: impl Into<String>,
	) -> Self {
		Self::new(environment, key, ScopeType::Tenant, tenant_id)
	}

	pub fn validate(&self) -> Result<()> {
		if !FlagDefinition::validate_environment(&self.environment) {
			return Err(ValidationError::InvalidEnvironment(self.environment.clone()));
		}
		if !FlagDefinition::validate_key(&self.key) {
			return Err(ValidationError::InvalidFlagKey(self.key.clone()));
		}
		if self.scope_id.trim().is_empty() {
			return Err(ValidationError::EmptyScopeId);
		}
		Ok(())
	}
}

impl fmt::Display for OverrideScope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}/{}/{}:{}",
			self.environment, self.key, self.scope_type, self.scope_id
		)
	}
}

/// A forced value for one flag in one scope.
///
/// Identified by `(environment, key, scope_type, scope_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Override {
	pub id: OverrideId,
	pub environment: String,
	pub key: String,
	pub scope_type: ScopeType,
	pub scope_id: String,
	pub value: bool,
	pub expires_at: Option<DateTime<Utc>>,
	/// Soft-delete marker. Deleted rows stay until swept.
	pub deleted_at: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Override {
	/// Visible to readers: not soft-deleted and not past its expiry.
	pub fn is_active(&self, now: DateTime<Utc>) -> bool {
		self.deleted_at.is_none() && self.value_state().is_active(now)
	}

	pub fn scope(&self) -> OverrideScope {
		OverrideScope::new(&self.environment, &self.key, self.scope_type, &self.scope_id)
	}

	pub fn value_state(&self) -> OverrideValue {
		OverrideValue {
			value: self.value,
			expires_at: self.expires_at,
		}
	}
}

/// What readers see of an override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideValue {
	pub value: bool,
	pub expires_at: Option<DateTime<Utc>>,
}

impl OverrideValue {
	/// Expiry is exclusive: an override expiring at `now` is already gone.
	pub fn is_active(&self, now: DateTime<Utc>) -> bool {
		self.expires_at.map_or(true, |expires_at| expires_at > now)
	}
}

/// Partial update for an override. `None` leaves a field as it is.
///
/// `expires_at: Some(None)` clears the expiry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverridePatch {
	#[serde(default)]
	pub value: Option<bool>,
	#[serde(default, with = "double_option")]
	pub expires_at: Option<Option<DateTime<Utc>>>,
}

impl OverridePatch {
	/// Patch that replaces every field.
	pub fn replace(value: bool, expires_at: Option<DateTime<Utc>>) -> Self {
		Self {
			value: Some(value),
			expires_at: Some(expires_at),
		}
	}

	/// Applies the patch on top of the current state.
	///
	/// Returns `None` when there is no current state and the patch does not set a value.
	pub fn apply(&self, current: Option<OverrideValue>) -> Option<OverrideValue> {
		let value = self.value.or(current.map(|c| c.value))?;
		let expires_at = match self.expires_at {
			Some(expires_at) => expires_at,
			None => current.and_then(|c| c.expires_at),
		};
		Some(OverrideValue { value, expires_at })
	}
}

mod double_option {
	use serde::{Deserialize, Deserializer, Serialize, Serializer};

	pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
	where
		T: Serialize,
		S: Serializer,
	{
		match value {
			Some(inner) => inner.serialize(serializer),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
	where
		T: Deserialize<'de>,
		D: Deserializer<'de>,
	{
		Option::<T>::deserialize(deserializer).map(Some)
	}
}
