//! File-based storage backend.
//!
//! Each record lives at `<storage_path>/<namespace>/<id>.json`. Writes go to a
//! temporary file that is then renamed over the target, so readers never see
//! a partially written record.

use crate::{StorageError, StorageInterface};
use async_trait::async_trait;
use dispatch_types::{ConfigSchema, Field, FieldType, Schema, ValidationError};
use std::path::PathBuf;
use tokio::fs;

const EXTENSION: &str = "json";
const ROOT_NAMESPACE: &str = "_root";

pub struct FileStorage {
	base_path: PathBuf,
}

impl FileStorage {
	pub fn new(base_path: PathBuf) -> Self {
		Self { base_path }
	}

	fn get_file_path(&self, key: &str) -> PathBuf {
		let (namespace, id) = key.split_once(':').unwrap_or((ROOT_NAMESPACE, key));
		self.base_path
			.join(sanitize(namespace))
			.join(format!("{}.{}", sanitize(id), EXTENSION))
	}
}

/// Path separators and `:` cannot appear in a file name component.
fn sanitize(part: &str) -> String {
	let cleaned = part.replace(['/', '\\', ':'], "_");
	if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
		format!("_{}", cleaned)
	} else {
		cleaned
	}
}

fn backend_err(e: std::io::Error) -> StorageError {
	StorageError::Backend(e.to_string())
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		match fs::read(self.get_file_path(key)).await {
			Ok(data) => Ok(data),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound),
			Err(e) => Err(backend_err(e)),
		}
	}

	async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
		let path = self.get_file_path(key);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).await.map_err(backend_err)?;
		}

		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, value).await.map_err(backend_err)?;
		fs::rename(&temp_path, &path).await.map_err(backend_err)?;
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		match fs::remove_file(self.get_file_path(key)).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(backend_err(e)),
		}
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		fs::try_exists(self.get_file_path(key))
			.await
			.map_err(backend_err)
	}

	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		let mut keys = Vec::new();
		let mut namespaces = match fs::read_dir(&self.base_path).await {
			Ok(dir) => dir,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
			Err(e) => return Err(backend_err(e)),
		};

		while let Some(namespace_dir) = namespaces.next_entry().await.map_err(backend_err)? {
			if !namespace_dir.file_type().await.map_err(backend_err)?.is_dir() {
				continue;
			}
			let namespace = namespace_dir.file_name().to_string_lossy().into_owned();

			let mut entries = fs::read_dir(namespace_dir.path()).await.map_err(backend_err)?;
			while let Some(entry) = entries.next_entry().await.map_err(backend_err)? {
				let path = entry.path();
				if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
					continue;
				}
				let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
					tracing::debug!(path = ?path, "Skipping file with non UTF-8 name");
					continue;
				};
				let key = if namespace == ROOT_NAMESPACE {
					id.to_string()
				} else {
					format!("{}:{}", namespace, id)
				};
				if key.starts_with(prefix) {
					keys.push(key);
				}
			}
		}

		Ok(keys)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema)
	}
}

pub struct FileStorageSchema;

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![],
			vec![Field::new("storage_path", FieldType::String).with_validator(|v| {
				match v.as_str() {
					Some("") => Err("storage_path cannot be empty".to_string()),
					_ => Ok(()),
				}
			})],
		);
		schema.validate(config)
	}
}

/// Configuration parameters:
/// - `storage_path`: directory holding the records (default `./data/storage`)
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	FileStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;

	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage");

	Ok(Box::new(FileStorage::new(PathBuf::from(storage_path))))
}

pub struct Registry;

impl dispatch_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "file";
	type Factory = crate::StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl crate::StorageRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[tokio::test]
	async fn test_round_trip_and_delete() {
		let dir = TempDir::new().unwrap();
		let storage = FileStorage::new(dir.path().to_path_buf());

		storage
			.set_bytes("orders:o-1", br#"{"state":"NEW"}"#.to_vec())
			.await
			.unwrap();
		assert!(dir.path().join("orders").join("o-1.json").exists());
		assert_eq!(
			storage.get_bytes("orders:o-1").await.unwrap(),
			br#"{"state":"NEW"}"#
		);

		storage.delete("orders:o-1").await.unwrap();
		assert!(!storage.exists("orders:o-1").await.unwrap());
		assert!(matches!(
			storage.get_bytes("orders:o-1").await,
			Err(StorageError::NotFound)
		));
	}

	#[tokio::test]
	async fn test_list_keys_survives_new_instance() {
		let dir = TempDir::new().unwrap();
		{
			let storage = FileStorage::new(dir.path().to_path_buf());
			storage.set_bytes("orders:a", vec![1]).await.unwrap();
			storage.set_bytes("orders:b", vec![2]).await.unwrap();
			storage.set_bytes("pending_orders:a", vec![3]).await.unwrap();
		}

		let storage = FileStorage::new(dir.path().to_path_buf());
		let mut keys = storage.list_keys("orders:").await.unwrap();
		keys.sort();
		assert_eq!(keys, vec!["orders:a".to_string(), "orders:b".to_string()]);
	}

	#[tokio::test]
	async fn test_list_keys_on_missing_directory() {
		let dir = TempDir::new().unwrap();
		let storage = FileStorage::new(dir.path().join("absent"));
		assert!(storage.list_keys("orders:").await.unwrap().is_empty());
	}

	#[test]
	fn test_empty_path_rejected() {
		let config: toml::Value = toml::from_str("storage_path = \"\"").unwrap();
		assert!(create_storage(&config).is_err());
	}
}
