// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Key-value cache port and an in-process TTL implementation.
//!
//! Values are JSON strings so any backend (in-process map, Redis) can hold them.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use loom_toggles_core::OverrideScope;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;

const KEY_PREFIX: &str = "toggles";

/// Cache key for a flag definition.
pub fn flag_cache_key(environment: &str, key: &str) -> String {
	format!("{KEY_PREFIX}:flag:{environment}:{key}")
}

/// Cache key for an override.
pub fn override_cache_key(scope: &OverrideScope) -> String {
	format!(
		"{KEY_PREFIX}:override:{}:{}:{}:{}",
		scope.environment,
		scope.key,
		scope.scope_type.as_str(),
		scope.scope_id
	)
}

#[async_trait]
pub trait Cache: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<String>>;
	async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
	async fn del(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
	value: String,
	expires_at: Instant,
	last_used: Instant,
}

/// Bounded in-process cache with per-entry TTL and LRU eviction.
#[derive(Debug)]
pub struct InMemoryCache {
	entries: Mutex<HashMap<String, CacheEntry>>,
	max_entries: usize,
}

impl InMemoryCache {
	pub fn new(max_entries: usize) -> Self {
		Self {
			entries: Mutex::new(HashMap::new()),
			max_entries: max_entries.max(1),
		}
	}

	pub async fn len(&self) -> usize {
		self.entries.lock().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.entries.lock().await.is_empty()
	}

	pub async fn cleanup_expired(&self) {
		let now = Instant::now();
		self.entries
			.lock()
			.await
			.retain(|_, entry| entry.expires_at > now);
	}
}

impl Default for InMemoryCache {
	fn default() -> Self {
		Self::new(10_000)
	}
}

fn evict_lru(entries: &mut HashMap<String, CacheEntry>) {
	if let Some(oldest) = entries
		.iter()
		.min_by_key(|(_, entry)| entry.last_used)
		.map(|(k, _)| k.clone())
	{
		entries.remove(&oldest);
	}
}

#[async_trait]
impl Cache for InMemoryCache {
	async fn get(&self, key: &str) -> Result<Option<String>> {
		let now = Instant::now();
		let mut entries = self.entries.lock().await;

		if let Some(entry) = entries.get_mut(key) {
			if entry.expires_at > now {
				entry.last_used = now;
				return Ok(Some(entry.value.clone()));
			}
			entries.remove(key);
		}

		Ok(None)
	}

	async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
		let now = Instant::now();
		let mut entries = self.entries.lock().await;

		if !entries.contains_key(key) && entries.len() >= self.max_entries {
			evict_lru(&mut entries);
		}

		entries.insert(
			key.to_string(),
			CacheEntry {
				value,
				expires_at: now + ttl,
				last_used: now,
			},
		);
		Ok(())
	}

	async fn del(&self, key: &str) -> Result<()> {
		self.entries.lock().await.remove(key);
		Ok(())
	}
}
