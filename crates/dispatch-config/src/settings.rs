//! Runtime settings snapshot and hot reload.

use crate::{Config, ConfigError, LifecycleConfig, PollingConfig};
use arc_swap::ArcSwap;
use dispatch_types::{AreaConfig, RetryPolicy, RuleConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// The part of the configuration that may change while orders are in flight.
///
/// Readers take one snapshot per transition or reconciler cycle and use it
/// throughout, so a reload never changes the rules halfway through a decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeSettings {
	pub lifecycle: LifecycleConfig,
	pub retry: RetryPolicy,
	pub polling: PollingConfig,
	pub rules: RuleConfig,
	pub areas: Vec<AreaConfig>,
}

impl RuntimeSettings {
	/// Checks internal consistency and that every rule names a configured
	/// provider.
	pub fn validate(&self, providers: &HashMap<String, toml::Value>) -> Result<(), ConfigError> {
		if self.lifecycle.max_fallback_depth == 0 {
			return Err(ConfigError::Validation(
				"max_fallback_depth must be at least 1".into(),
			));
		}
		if self.lifecycle.fulfillment_timeout_seconds == 0 {
			return Err(ConfigError::Validation(
				"fulfillment_timeout_seconds must be greater than 0".into(),
			));
		}
		if self.lifecycle.timeout_sweep_interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"timeout_sweep_interval_seconds must be greater than 0".into(),
			));
		}

		if self.retry.max_attempts == 0 {
			return Err(ConfigError::Validation(
				"retry.max_attempts must be at least 1".into(),
			));
		}
		if self.retry.multiplier < 1.0 {
			return Err(ConfigError::Validation(
				"retry.multiplier must be at least 1.0".into(),
			));
		}
		if !(0.0..=1.0).contains(&self.retry.randomization_factor) {
			return Err(ConfigError::Validation(
				"retry.randomization_factor must be between 0 and 1".into(),
			));
		}

		let polling = &self.polling;
		if polling.interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"polling.interval_seconds must be greater than 0".into(),
			));
		}
		if polling.max_poll_attempts == 0 {
			return Err(ConfigError::Validation(
				"polling.max_poll_attempts must be at least 1".into(),
			));
		}
		if polling.batch_size == 0 {
			return Err(ConfigError::Validation(
				"polling.batch_size must be at least 1".into(),
			));
		}
		if polling.backoff_base_seconds == 0 || polling.backoff_max_seconds < polling.backoff_base_seconds {
			return Err(ConfigError::Validation(
				"polling backoff requires 0 < backoff_base_seconds <= backoff_max_seconds".into(),
			));
		}
		for (provider, overrides) in &polling.providers {
			if overrides.interval_seconds == 0 {
				return Err(ConfigError::Validation(format!(
					"polling.providers.{}.interval_seconds must be greater than 0",
					provider
				)));
			}
		}

		for provider in self.rules.referenced_providers() {
			if !providers.contains_key(provider) {
				return Err(ConfigError::Validation(format!(
					"Rule references provider '{}' which is not configured in [providers]",
					provider
				)));
			}
		}

		for area in &self.areas {
			if area.name.is_empty() {
				return Err(ConfigError::Validation("Area name cannot be empty".into()));
			}
			if area.min_lat > area.max_lat || area.min_long > area.max_long {
				return Err(ConfigError::Validation(format!(
					"Bounding box of area '{}' is inverted",
					area.name
				)));
			}
		}

		Ok(())
	}
}

/// Shared, atomically swappable handle to the current [`RuntimeSettings`].
#[derive(Debug, Clone)]
pub struct SettingsHandle {
	inner: Arc<ArcSwap<RuntimeSettings>>,
}

impl SettingsHandle {
	pub fn new(settings: RuntimeSettings) -> Self {
		Self {
			inner: Arc::new(ArcSwap::from_pointee(settings)),
		}
	}

	/// Current snapshot.
	pub fn load(&self) -> Arc<RuntimeSettings> {
		self.inner.load_full()
	}

	pub fn replace(&self, settings: RuntimeSettings) {
		self.inner.store(Arc::new(settings));
	}
}

impl Default for SettingsHandle {
	fn default() -> Self {
		Self::new(RuntimeSettings::default())
	}
}

/// Re-reads the configuration file when its modification time changes and
/// publishes the new runtime settings.
///
/// Provider, storage and queue wiring is not reloaded; only the sections in
/// [`RuntimeSettings`] are. An invalid file leaves the current snapshot in
/// place.
pub struct SettingsWatcher {
	path: PathBuf,
	handle: SettingsHandle,
	providers: HashMap<String, toml::Value>,
	interval: Duration,
	last_modified: Option<SystemTime>,
}

impl SettingsWatcher {
	pub fn new(
		path: impl Into<PathBuf>,
		handle: SettingsHandle,
		providers: HashMap<String, toml::Value>,
		interval: Duration,
	) -> Self {
		let path = path.into();
		let last_modified = modified_at(&path);
		Self {
			path,
			handle,
			providers,
			interval,
			last_modified,
		}
	}

	/// Runs until the task is dropped.
	pub async fn run(mut self) {
		let mut ticker = tokio::time::interval(self.interval);
		ticker.tick().await;
		loop {
			ticker.tick().await;
			self.check().await;
		}
	}

	/// Reloads once if the file changed. Returns true when a new snapshot
	/// was published.
	pub async fn check(&mut self) -> bool {
		let modified = modified_at(&self.path);
		if modified.is_none() || modified == self.last_modified {
			return false;
		}
		self.last_modified = modified;

		let path = self.path.display().to_string();
		match self.reload(&path).await {
			Ok(settings) => {
				if *self.handle.load() == settings {
					tracing::debug!(path = %path, "Configuration touched without settings changes");
					return false;
				}
				self.handle.replace(settings);
				tracing::info!(path = %path, "Reloaded runtime settings");
				true
			},
			Err(e) => {
				tracing::warn!(path = %path, error = %e, "Ignoring invalid configuration update");
				false
			},
		}
	}

	async fn reload(&self, path: &str) -> Result<RuntimeSettings, ConfigError> {
		let config = Config::from_file(path).await?;
		let settings = config.runtime_settings();
		// Rules may only name providers wired at startup.
		settings.validate(&self.providers)?;
		Ok(settings)
	}
}

fn modified_at(path: &std::path::Path) -> Option<SystemTime> {
	std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
