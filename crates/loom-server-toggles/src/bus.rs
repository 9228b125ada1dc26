// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Invalidation bus for cross-instance cache coherence.
//!
//! Writers publish an [`InvalidationEvent`] after deleting their own cache entry.
//! Every instance runs an [`InvalidationListener`] that drops the matching local
//! entry when an event arrives.
//!
//! Delivery is at-most-once. Events published while nobody is subscribed are
//! discarded, and a listener that lags behind skips what it missed. Either way the
//! cache TTL bounds how long a stale entry can be served.
//!
//! ```text
//! writer ──publish──> BroadcastBus ──topic channel──> InvalidationListener ──del──> Cache
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use loom_toggles_core::{InvalidationEvent, OverrideScope};

use crate::cache::{flag_cache_key, override_cache_key, Cache};
use crate::error::Result;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Publish side of the bus.
#[async_trait]
pub trait InvalidationBus: Send + Sync {
	/// Fire-and-forget publish. Returns how many subscribers received the event.
	async fn publish(&self, topic: &str, event: &InvalidationEvent) -> Result<usize>;
}

/// Statistics for one topic channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStats {
	pub receiver_count: usize,
	pub events_sent: u64,
	pub created_at: DateTime<Utc>,
	pub last_event_at: Option<DateTime<Utc>>,
}

struct ChannelState {
	sender: broadcast::Sender<InvalidationEvent>,
	stats: ChannelStats,
}

/// In-process bus backed by one tokio broadcast channel per topic.
pub struct BroadcastBus {
	channel_capacity: usize,
	channels: RwLock<HashMap<String, ChannelState>>,
	total_events: AtomicU64,
}

impl BroadcastBus {
	pub fn new(channel_capacity: usize) -> Self {
		Self {
			channel_capacity: channel_capacity.max(1),
			channels: RwLock::new(HashMap::new()),
			total_events: AtomicU64::new(0),
		}
	}

	pub fn with_defaults() -> Self {
		Self::new(DEFAULT_CHANNEL_CAPACITY)
	}

	pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<InvalidationEvent> {
		{
			let channels = self.channels.read().await;
			if let Some(state) = channels.get(topic) {
				return state.sender.subscribe();
			}
		}

		let mut channels = self.channels.write().await;
		let state = channels.entry(topic.to_string()).or_insert_with(|| {
			info!(topic = %topic, "Created invalidation channel");
			let (sender, _receiver) = broadcast::channel(self.channel_capacity);
			ChannelState {
				sender,
				stats: ChannelStats {
					receiver_count: 0,
					events_sent: 0,
					created_at: Utc::now(),
					last_event_at: None,
				},
			}
		});
		state.sender.subscribe()
	}

	pub async fn channel_stats(&self, topic: &str) -> Option<ChannelStats> {
		let channels = self.channels.read().await;
		channels.get(topic).map(|state| ChannelStats {
			receiver_count: state.sender.receiver_count(),
			..state.stats.clone()
		})
	}

	pub async fn channel_count(&self) -> usize {
		self.channels.read().await.len()
	}

	pub fn total_events_sent(&self) -> u64 {
		self.total_events.load(Ordering::Relaxed)
	}
}

impl Default for BroadcastBus {
	fn default() -> Self {
		Self::with_defaults()
	}
}

#[async_trait]
impl InvalidationBus for BroadcastBus {
	async fn publish(&self, topic: &str, event: &InvalidationEvent) -> Result<usize> {
		let mut channels = self.channels.write().await;

		let Some(state) = channels.get_mut(topic) else {
			debug!(topic = %topic, event_type = event.event_type(), "No channel for topic");
			return Ok(0);
		};

		match state.sender.send(event.clone()) {
			Ok(count) => {
				state.stats.events_sent += 1;
				state.stats.last_event_at = Some(Utc::now());
				self.total_events.fetch_add(1, Ordering::Relaxed);
				debug!(
					topic = %topic,
					event_type = event.event_type(),
					receiver_count = count,
					"Published invalidation"
				);
				Ok(count)
			}
			Err(_) => {
				debug!(topic = %topic, event_type = event.event_type(), "No receivers for invalidation");
				Ok(0)
			}
		}
	}
}

/// Cache key an event invalidates.
pub fn cache_key_for(event: &InvalidationEvent) -> String {
	match event {
		InvalidationEvent::FlagUpdated(data) => flag_cache_key(&data.env, &data.key),
		InvalidationEvent::OverrideChanged(data) => override_cache_key(&OverrideScope::new(
			&data.env,
			&data.key,
			data.scope_type,
			&data.scope_id,
		)),
	}
}

/// Drops local cache entries named by incoming invalidation events.
pub struct InvalidationListener;

impl InvalidationListener {
	/// Subscribes to `topic` and spawns the listening task.
	///
	/// The task ends when the bus is dropped.
	pub async fn spawn(bus: &BroadcastBus, topic: &str, cache: Arc<dyn Cache>) -> JoinHandle<()> {
		let receiver = bus.subscribe(topic).await;
		tokio::spawn(Self::run(receiver, cache))
	}

	async fn run(mut receiver: broadcast::Receiver<InvalidationEvent>, cache: Arc<dyn Cache>) {
		loop {
			match receiver.recv().await {
				Ok(event) => {
					let key = cache_key_for(&event);
					if let Err(e) = cache.del(&key).await {
						warn!(error = %e, cache_key = %key, "Failed to apply invalidation");
					} else {
						debug!(
							environment = %event.env(),
							flag_key = %event.key(),
							event_type = event.event_type(),
							"Applied invalidation"
						);
					}
				}
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					warn!(skipped, "Invalidation listener lagged; entries expire by TTL");
				}
				Err(broadcast::error::RecvError::Closed) => {
					debug!("Invalidation channel closed");
					break;
				}
			}
		}
	}
}
