// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

/// Flags whose overrides only a super-administrator may set or clear.
pub const PLATFORM_ONLY_FLAGS: &[&str] = &[
	"platform.maintenance_mode",
	"platform.read_only",
	"platform.signups_enabled",
];

/// Checks membership in [`PLATFORM_ONLY_FLAGS`].
pub fn is_platform_only(key: &str) -> bool {
	PLATFORM_ONLY_FLAGS.contains(&key)
}
