// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use loom_toggles_core::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum TogglesServerError {
	#[error("Database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("Validation failed: {0}")]
	Validation(#[from] ValidationError),

	#[error("Version conflict on {environment}/{key}: expected {expected}, stored {actual:?}")]
	VersionConflict {
		environment: String,
		key: String,
		expected: i64,
		actual: Option<i64>,
	},

	#[error("Forbidden: {key} is a platform-only flag")]
	Forbidden { key: String },

	#[error("Timed out during {operation}")]
	Timeout { operation: &'static str },

	#[error("Cache error: {0}")]
	Cache(String),

	#[error("Bus error: {0}")]
	Bus(String),

	#[error("Internal: {0}")]
	Internal(String),
}

impl TogglesServerError {
	pub fn is_conflict(&self) -> bool {
		matches!(self, TogglesServerError::VersionConflict { .. })
	}

	pub fn is_forbidden(&self) -> bool {
		matches!(self, TogglesServerError::Forbidden { .. })
	}

	/// Cache, store or bus unavailable, as opposed to a rejected request.
	pub fn is_infrastructure(&self) -> bool {
		matches!(
			self,
			TogglesServerError::Database(_)
				| TogglesServerError::Timeout { .. }
				| TogglesServerError::Cache(_)
				| TogglesServerError::Bus(_)
		)
	}
}

pub type Result<T> = std::result::Result<T, TogglesServerError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classification() {
		let conflict = TogglesServerError::VersionConflict {
			environment: "prod".to_string(),
			key: "beta_dashboard".to_string(),
			expected: 1,
			actual: Some(2),
		};
		assert!(conflict.is_conflict());
		assert!(!conflict.is_infrastructure());

		let forbidden = TogglesServerError::Forbidden {
			key: "platform.read_only".to_string(),
		};
		assert!(forbidden.is_forbidden());

		let timeout = TogglesServerError::Timeout {
			operation: "override lookup",
		};
		assert!(timeout.is_infrastructure());
		assert!(TogglesServerError::Cache("down".to_string()).is_infrastructure());
		assert!(!TogglesServerError::from(ValidationError::EmptyKeys).is_infrastructure());
	}

	#[test]
	fn conflict_message_names_versions() {
		let err = TogglesServerError::VersionConflict {
			environment: "prod".to_string(),
			key: "beta_dashboard".to_string(),
			expected: 3,
			actual: Some(4),
		};
		assert_eq!(
			err.to_string(),
			"Version conflict on prod/beta_dashboard: expected 3, stored Some(4)"
		);
	}
}
