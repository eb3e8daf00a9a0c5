//! Multi-file configuration loading.
//!
//! A file may pull in other files with `include = "file.toml"` or
//! `include = ["a.toml", "b.toml"]`. Included files may include further
//! files. Every top-level section must come from exactly one file.

use crate::{resolve_env_vars, Config, ConfigError};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub struct ConfigLoader {
	/// Base path for resolving relative includes
	base_path: PathBuf,
	/// Canonical paths already read, for circular include detection
	loaded_files: HashSet<PathBuf>,
	/// Section name to the file that defined it
	section_sources: HashMap<String, PathBuf>,
}

impl ConfigLoader {
	pub fn new(base_path: impl AsRef<Path>) -> Self {
		Self {
			base_path: base_path.as_ref().to_path_buf(),
			loaded_files: HashSet::new(),
			section_sources: HashMap::new(),
		}
	}

	/// Loads a configuration file and all of its includes, then parses and
	/// validates the combined document.
	pub async fn load_config(
		&mut self,
		config_path: impl AsRef<Path>,
	) -> Result<Config, ConfigError> {
		let config_path = self.resolve_path(config_path)?;
		let mut combined = toml::Table::new();
		self.merge_file(&config_path, &mut combined).await?;

		let config_str = toml::to_string(&combined).map_err(|e| {
			ConfigError::Parse(format!("Failed to serialize combined config: {}", e))
		})?;
		config_str.parse()
	}

	/// Reads `path`, merges its sections into `combined` and recurses into
	/// its includes.
	async fn merge_file(
		&mut self,
		path: &Path,
		combined: &mut toml::Table,
	) -> Result<(), ConfigError> {
		let content = self.load_file(path).await?;
		let mut table: toml::Table = toml::from_str(&content)?;
		let includes = extract_includes(table.remove("include"))?;

		for (key, value) in table {
			if let Some(existing) = self.section_sources.get(&key) {
				return Err(ConfigError::Validation(format!(
					"Duplicate section '{}' found in {} and {}. \
					Each top-level section must be unique across all configuration files.",
					key,
					existing.display(),
					path.display()
				)));
			}
			self.section_sources.insert(key.clone(), path.to_path_buf());
			combined.insert(key, value);
		}

		for include in includes {
			let resolved = self.resolve_path(&include)?;
			Box::pin(self.merge_file(&resolved, combined)).await?;
		}

		Ok(())
	}

	/// Reads a file with environment variables resolved.
	async fn load_file(&mut self, path: &Path) -> Result<String, ConfigError> {
		let canonical_path = tokio::fs::canonicalize(path).await.map_err(|e| {
			ConfigError::Io(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("Cannot resolve path {}: {}", path.display(), e),
			))
		})?;

		if !self.loaded_files.insert(canonical_path.clone()) {
			return Err(ConfigError::Validation(format!(
				"Circular include detected: {} was already loaded",
				canonical_path.display()
			)));
		}

		let content = tokio::fs::read_to_string(path).await?;
		resolve_env_vars(&content)
	}

	fn resolve_path(&self, path: impl AsRef<Path>) -> Result<PathBuf, ConfigError> {
		let path = path.as_ref();
		let resolved = if path.is_absolute() {
			path.to_path_buf()
		} else {
			self.base_path.join(path)
		};

		if !resolved.exists() {
			return Err(ConfigError::Io(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("Configuration file not found: {}", resolved.display()),
			)));
		}

		Ok(resolved)
	}
}

fn extract_includes(value: Option<toml::Value>) -> Result<Vec<PathBuf>, ConfigError> {
	match value {
		None => Ok(Vec::new()),
		Some(toml::Value::String(path)) => Ok(vec![PathBuf::from(path)]),
		Some(toml::Value::Array(items)) => items
			.into_iter()
			.map(|item| match item {
				toml::Value::String(path) => Ok(PathBuf::from(path)),
				_ => Err(ConfigError::Validation(
					"Include array must contain only strings".into(),
				)),
			})
			.collect(),
		Some(_) => Err(ConfigError::Validation(
			"Include must be a string or array of strings".into(),
		)),
	}
}
