// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::HashSet;

use loom_toggles_core::PLATFORM_ONLY_FLAGS;

use crate::error::{Result, TogglesServerError};

/// Rejects override changes on platform-only keys unless the actor is a super-admin.
#[derive(Debug, Clone)]
pub struct PlatformGuard {
	keys: HashSet<String>,
}

impl PlatformGuard {
	pub fn new<I, S>(keys: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			keys: keys.into_iter().map(Into::into).collect(),
		}
	}

	pub fn is_platform_only(&self, key: &str) -> bool {
		self.keys.contains(key)
	}

	pub fn check(&self, key: &str, actor_is_super_admin: bool) -> Result<()> {
		if self.is_platform_only(key) && !actor_is_super_admin {
			tracing::warn!(key = %key, "Rejected platform-only override change");
			return Err(TogglesServerError::Forbidden {
				key: key.to_string(),
			});
		}
		Ok(())
	}
}

impl Default for PlatformGuard {
	fn default() -> Self {
		Self::new(PLATFORM_ONLY_FLAGS.iter().copied())
	}
}
