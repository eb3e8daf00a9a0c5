//! In-memory pending-order queue backed by a priority queue keyed on the
//! next eligible poll time.

use crate::{QueueError, QueueInterface};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dispatch_storage::StorageService;
use dispatch_types::{ConfigSchema, PendingEntry, Schema, ValidationError};
use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Earliest poll time first, then order id.
type Slot = Reverse<(DateTime<Utc>, String)>;

#[derive(Default)]
struct QueueState {
	/// Visible entries.
	ready: PriorityQueue<String, Slot>,
	/// Leased entries and their lease expiry.
	leased: HashMap<String, DateTime<Utc>>,
	entries: HashMap<String, PendingEntry>,
}

impl QueueState {
	fn make_visible(&mut self, entry: PendingEntry) {
		let slot = Reverse((entry.next_eligible_poll_at, entry.order_id.clone()));
		self.leased.remove(&entry.order_id);
		self.ready.push(entry.order_id.clone(), slot);
		self.entries.insert(entry.order_id.clone(), entry);
	}

	/// Puts entries whose lease ran out back into the visible set.
	fn reclaim_expired(&mut self, now: DateTime<Utc>) {
		let expired: Vec<String> = self
			.leased
			.iter()
			.filter(|(_, until)| **until <= now)
			.map(|(id, _)| id.clone())
			.collect();

		for order_id in expired {
			if let Some(entry) = self.entries.get(&order_id).cloned() {
				tracing::debug!(order_id = %order_id, "Lease expired, entry visible again");
				self.make_visible(entry);
			}
		}
	}
}

pub struct MemoryQueue {
	state: Arc<Mutex<QueueState>>,
}

impl MemoryQueue {
	pub fn new() -> Self {
		Self {
			state: Arc::new(Mutex::new(QueueState::default())),
		}
	}
}

impl Default for MemoryQueue {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl QueueInterface for MemoryQueue {
	async fn enqueue(&self, entry: PendingEntry) -> Result<(), QueueError> {
		self.state.lock().await.make_visible(entry);
		Ok(())
	}

	async fn receive_ready(
		&self,
		now: DateTime<Utc>,
		max: usize,
		visibility: Duration,
	) -> Result<Vec<PendingEntry>, QueueError> {
		let mut state = self.state.lock().await;
		state.reclaim_expired(now);

		let mut batch = Vec::new();
		while batch.len() < max {
			let due = matches!(state.ready.peek(), Some((_, Reverse((at, _)))) if *at <= now);
			if !due {
				break;
			}
			let Some((order_id, _)) = state.ready.pop() else {
				break;
			};
			if let Some(entry) = state.entries.get(&order_id).cloned() {
				state.leased.insert(order_id, now + visibility);
				batch.push(entry);
			}
		}
		Ok(batch)
	}

	async fn requeue(&self, entry: PendingEntry) -> Result<(), QueueError> {
		let mut state = self.state.lock().await;
		if !state.entries.contains_key(&entry.order_id) {
			// Acked concurrently; keep it gone.
			return Ok(());
		}
		state.make_visible(entry);
		Ok(())
	}

	async fn ack(&self, order_id: &str) -> Result<(), QueueError> {
		let mut state = self.state.lock().await;
		state.ready.remove(order_id);
		state.leased.remove(order_id);
		state.entries.remove(order_id);
		Ok(())
	}

	async fn contains(&self, order_id: &str) -> Result<bool, QueueError> {
		Ok(self.state.lock().await.entries.contains_key(order_id))
	}

	async fn len(&self) -> Result<usize, QueueError> {
		Ok(self.state.lock().await.entries.len())
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryQueueSchema)
	}
}

pub struct MemoryQueueSchema;

impl ConfigSchema for MemoryQueueSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(vec![], vec![]).validate(config)
	}
}

pub fn create_queue(
	_config: &toml::Value,
	_storage: Arc<StorageService>,
) -> Result<Box<dyn QueueInterface>, QueueError> {
	Ok(Box::new(MemoryQueue::new()))
}

pub struct Registry;

impl dispatch_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = crate::QueueFactory;

	fn factory() -> Self::Factory {
		create_queue
	}
}

impl crate::QueueRegistry for Registry {}
