// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

/// Input rejected before any I/O is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
	#[error("at least one flag key is required")]
	EmptyKeys,

	#[error("invalid flag key: {0:?}")]
	InvalidFlagKey(String),

	#[error("invalid environment name: {0:?}")]
	InvalidEnvironment(String),

	#[error("scope id must not be empty")]
	EmptyScopeId,

	#[error("percentage threshold {0} is greater than 100")]
	PercentageOutOfRange(u8),

	#[error("time window starts after it ends")]
	InvertedTimeWindow,
}

pub type Result<T> = std::result::Result<T, ValidationError>;
