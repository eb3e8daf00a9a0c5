//! Durable pending-order queue persisted through the storage service.
//!
//! Entries survive restarts together with their lease. Receiving scans the
//! `pending_orders` namespace, so this backend suits the modest queue sizes
//! a single dispatcher produces.

use crate::{QueueError, QueueInterface};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dispatch_storage::{StorageError, StorageService};
use dispatch_types::{ConfigSchema, PendingEntry, Schema, StorageKey, ValidationError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntry {
	entry: PendingEntry,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	leased_until: Option<DateTime<Utc>>,
}

impl StoredEntry {
	fn is_visible(&self, now: DateTime<Utc>) -> bool {
		self.leased_until.is_none_or(|until| until <= now)
	}
}

pub struct StorageQueue {
	storage: Arc<StorageService>,
	/// Serializes read-modify-write cycles within this process.
	guard: Mutex<()>,
}

fn storage_err(e: StorageError) -> QueueError {
	QueueError::Storage(e.to_string())
}

const NAMESPACE: &str = StorageKey::PendingOrders.as_str();

impl StorageQueue {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self {
			storage,
			guard: Mutex::new(()),
		}
	}

	async fn put(&self, stored: &StoredEntry) -> Result<(), QueueError> {
		self.storage
			.store(NAMESPACE, &stored.entry.order_id, stored)
			.await
			.map_err(storage_err)
	}
}

#[async_trait]
impl QueueInterface for StorageQueue {
	async fn enqueue(&self, entry: PendingEntry) -> Result<(), QueueError> {
		let _guard = self.guard.lock().await;
		self.put(&StoredEntry {
			entry,
			leased_until: None,
		})
		.await
	}

	async fn receive_ready(
		&self,
		now: DateTime<Utc>,
		max: usize,
		visibility: Duration,
	) -> Result<Vec<PendingEntry>, QueueError> {
		let _guard = self.guard.lock().await;
		let mut ready: Vec<StoredEntry> = self
			.storage
			.retrieve_all::<StoredEntry>(NAMESPACE)
			.await
			.map_err(storage_err)?
			.into_iter()
			.map(|(_, stored)| stored)
			.filter(|stored| stored.is_visible(now) && stored.entry.is_ready(now))
			.collect();

		ready.sort_by(|a, b| {
			(a.entry.next_eligible_poll_at, &a.entry.order_id)
				.cmp(&(b.entry.next_eligible_poll_at, &b.entry.order_id))
		});
		ready.truncate(max);

		let mut batch = Vec::with_capacity(ready.len());
		for mut stored in ready {
			stored.leased_until = Some(now + visibility);
			self.put(&stored).await?;
			batch.push(stored.entry);
		}
		Ok(batch)
	}

	async fn requeue(&self, entry: PendingEntry) -> Result<(), QueueError> {
		let _guard = self.guard.lock().await;
		let exists = self
			.storage
			.exists(NAMESPACE, &entry.order_id)
			.await
			.map_err(storage_err)?;
		if !exists {
			return Ok(());
		}
		self.put(&StoredEntry {
			entry,
			leased_until: None,
		})
		.await
	}

	async fn ack(&self, order_id: &str) -> Result<(), QueueError> {
		let _guard = self.guard.lock().await;
		self.storage
			.remove(NAMESPACE, order_id)
			.await
			.map_err(storage_err)
	}

	async fn contains(&self, order_id: &str) -> Result<bool, QueueError> {
		self.storage
			.exists(NAMESPACE, order_id)
			.await
			.map_err(storage_err)
	}

	async fn len(&self) -> Result<usize, QueueError> {
		let entries = self
			.storage
			.retrieve_all::<StoredEntry>(NAMESPACE)
			.await
			.map_err(storage_err)?;
		Ok(entries.len())
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(StorageQueueSchema)
	}
}

pub struct StorageQueueSchema;

impl ConfigSchema for StorageQueueSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(vec![], vec![]).validate(config)
	}
}

/// Uses the primary storage backend; takes no options of its own.
pub fn create_queue(
	_config: &toml::Value,
	storage: Arc<StorageService>,
) -> Result<Box<dyn QueueInterface>, QueueError> {
	Ok(Box::new(StorageQueue::new(storage)))
}

pub struct Registry;

impl dispatch_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "storage";
	type Factory = crate::QueueFactory;

	fn factory() -> Self::Factory {
		create_queue
	}
}

impl crate::QueueRegistry for Registry {}
