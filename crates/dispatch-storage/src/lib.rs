//! Storage module for the delivery dispatcher.
//!
//! Order records and durable pending-queue entries are persisted through a
//! key/value backend. Keys have the form `namespace:id`; values are JSON.

use async_trait::async_trait;
use dispatch_types::{ConfigSchema, ImplementationRegistry};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	#[error("Not found")]
	NotFound,
	#[error("Serialization error: {0}")]
	Serialization(String),
	#[error("Backend error: {0}")]
	Backend(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Low-level key/value backend.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Creates or overwrites the value at `key`.
	async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

	/// Deleting a missing key succeeds.
	async fn delete(&self, key: &str) -> Result<(), StorageError>;

	async fn exists(&self, key: &str) -> Result<bool, StorageError>;

	/// All keys starting with `prefix`, in no particular order.
	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

	fn config_schema(&self) -> Box<dyn ConfigSchema>;
}

pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>;

pub trait StorageRegistry: ImplementationRegistry<Factory = StorageFactory> {}

/// Every storage backend known to this crate, by configuration name.
pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{file, memory};

	vec![
		(file::Registry::NAME, file::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

/// Typed access to a storage backend.
pub struct StorageService {
	backend: Box<dyn StorageInterface>,
}

fn key(namespace: &str, id: &str) -> String {
	format!("{}:{}", namespace, id)
}

impl StorageService {
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	/// Serializes `data` to JSON and stores it under `namespace:id`.
	pub async fn store<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		let bytes =
			serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend.set_bytes(&key(namespace, id), bytes).await
	}

	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		let bytes = self.backend.get_bytes(&key(namespace, id)).await?;
		serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
	}

	/// Like [`retrieve`](Self::retrieve) but maps `NotFound` to `None`.
	pub async fn find<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<Option<T>, StorageError> {
		match self.retrieve(namespace, id).await {
			Ok(value) => Ok(Some(value)),
			Err(StorageError::NotFound) => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// Every record in `namespace`.
	///
	/// Records removed between listing and reading are skipped. Records that
	/// fail to deserialize are logged and skipped.
	pub async fn retrieve_all<T: DeserializeOwned>(
		&self,
		namespace: &str,
	) -> Result<Vec<(String, T)>, StorageError> {
		let prefix = key(namespace, "");
		let mut keys = self.backend.list_keys(&prefix).await?;
		keys.sort();

		let mut records = Vec::with_capacity(keys.len());
		for full_key in keys {
			let id = full_key[prefix.len()..].to_string();
			let bytes = match self.backend.get_bytes(&full_key).await {
				Ok(bytes) => bytes,
				Err(StorageError::NotFound) => continue,
				Err(e) => return Err(e),
			};
			match serde_json::from_slice(&bytes) {
				Ok(value) => records.push((id, value)),
				Err(e) => {
					tracing::warn!(key = %full_key, error = %e, "Skipping unreadable record");
				},
			}
		}
		Ok(records)
	}

	pub async fn remove(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
		self.backend.delete(&key(namespace, id)).await
	}

	/// Overwrites an existing record. Fails with `NotFound` if absent.
	pub async fn update<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
	) -> Result<(), StorageError> {
		if !self.backend.exists(&key(namespace, id)).await? {
			return Err(StorageError::NotFound);
		}
		self.store(namespace, id, data).await
	}

	pub async fn exists(&self, namespace: &str, id: &str) -> Result<bool, StorageError> {
		self.backend.exists(&key(namespace, id)).await
	}
}
