//! In-memory storage backend.
//!
//! Nothing survives a restart. Used by tests and local runs.

use crate::{StorageError, StorageInterface};
use async_trait::async_trait;
use dispatch_types::{ConfigSchema, Schema, ValidationError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct MemoryStorage {
	store: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self {
			store: Arc::new(RwLock::new(HashMap::new())),
		}
	}
}

impl Default for MemoryStorage {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let store = self.store.read().await;
		store.get(key).cloned().ok_or(StorageError::NotFound)
	}

	async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
		self.store.write().await.insert(key.to_string(), value);
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		self.store.write().await.remove(key);
		Ok(())
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		Ok(self.store.read().await.contains_key(key))
	}

	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		let store = self.store.read().await;
		Ok(store
			.keys()
			.filter(|k| k.starts_with(prefix))
			.cloned()
			.collect())
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryStorageSchema)
	}
}

/// Memory storage takes no options.
pub struct MemoryStorageSchema;

impl ConfigSchema for MemoryStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(vec![], vec![]).validate(config)
	}
}

pub fn create_storage(_config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	Ok(Box::new(MemoryStorage::new()))
}

pub struct Registry;

impl dispatch_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = crate::StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl crate::StorageRegistry for Registry {}
