//! Pending-order queue for the delivery dispatcher.
//!
//! Orders handed to a poll-based provider wait here until the polling
//! reconciler obtains an actionable status. Delivery is at-least-once:
//! [`QueueInterface::receive_ready`] leases entries for a visibility
//! timeout, and an entry that is neither acked nor requeued before the lease
//! expires becomes visible again.
//!
//! The queue holds at most one entry per order. Enqueueing an order that is
//! already present replaces its entry.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dispatch_storage::StorageService;
use dispatch_types::{ConfigSchema, ImplementationRegistry, PendingEntry};
use std::sync::Arc;
use thiserror::Error;

pub mod implementations {
	pub mod memory;
	pub mod storage;
}

#[derive(Debug, Error)]
pub enum QueueError {
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Backend error: {0}")]
	Backend(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
}

#[async_trait]
pub trait QueueInterface: Send + Sync {
	/// Inserts or replaces the entry for `entry.order_id` and makes it visible.
	async fn enqueue(&self, entry: PendingEntry) -> Result<(), QueueError>;

	/// Leases up to `max` visible entries with `next_eligible_poll_at <= now`,
	/// earliest first. Leased entries stay hidden until `now + visibility`.
	async fn receive_ready(
		&self,
		now: DateTime<Utc>,
		max: usize,
		visibility: Duration,
	) -> Result<Vec<PendingEntry>, QueueError>;

	/// Returns a leased entry to the queue with its updated schedule.
	async fn requeue(&self, entry: PendingEntry) -> Result<(), QueueError>;

	/// Removes the entry for `order_id`. Acking a missing entry succeeds.
	async fn ack(&self, order_id: &str) -> Result<(), QueueError>;

	async fn contains(&self, order_id: &str) -> Result<bool, QueueError>;

	/// Number of entries, leased or not.
	async fn len(&self) -> Result<usize, QueueError>;

	fn config_schema(&self) -> Box<dyn ConfigSchema>;
}

pub type QueueFactory =
	fn(&toml::Value, Arc<StorageService>) -> Result<Box<dyn QueueInterface>, QueueError>;

pub trait QueueRegistry: ImplementationRegistry<Factory = QueueFactory> {}

pub fn get_all_implementations() -> Vec<(&'static str, QueueFactory)> {
	use implementations::{memory, storage};

	vec![
		(memory::Registry::NAME, memory::Registry::factory()),
		(storage::Registry::NAME, storage::Registry::factory()),
	]
}

/// Front for the configured queue backend.
pub struct QueueService {
	backend: Box<dyn QueueInterface>,
}

impl QueueService {
	pub fn new(backend: Box<dyn QueueInterface>) -> Self {
		Self { backend }
	}

	pub async fn enqueue(&self, entry: PendingEntry) -> Result<(), QueueError> {
		tracing::debug!(
			order_id = %dispatch_types::truncate_id(&entry.order_id),
			provider = %entry.provider,
			next_poll = %entry.next_eligible_poll_at,
			"Enqueued pending order"
		);
		self.backend.enqueue(entry).await
	}

	pub async fn receive_ready(
		&self,
		now: DateTime<Utc>,
		max: usize,
		visibility: Duration,
	) -> Result<Vec<PendingEntry>, QueueError> {
		if max == 0 {
			return Ok(Vec::new());
		}
		self.backend.receive_ready(now, max, visibility).await
	}

	pub async fn requeue(&self, entry: PendingEntry) -> Result<(), QueueError> {
		self.backend.requeue(entry).await
	}

	pub async fn ack(&self, order_id: &str) -> Result<(), QueueError> {
		self.backend.ack(order_id).await
	}

	pub async fn contains(&self, order_id: &str) -> Result<bool, QueueError> {
		self.backend.contains(order_id).await
	}

	pub async fn len(&self) -> Result<usize, QueueError> {
		self.backend.len().await
	}

	pub async fn is_empty(&self) -> Result<bool, QueueError> {
		Ok(self.len().await? == 0)
	}
}
