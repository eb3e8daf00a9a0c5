//! Configuration module for the delivery dispatcher.
//!
//! This module provides the configuration structures for the dispatcher and
//! loads them from TOML files. Values may reference environment variables as
//! `${VAR}` or `${VAR:-default}`, and every configuration is validated before
//! it is handed to the rest of the system.
//!
//! ## Modular Configuration Support
//!
//! Configurations can be split into multiple files:
//! - Use `include = ["providers.toml", "rules.toml"]` to pull in other files
//! - Each top-level section must be unique across all files
//!
//! ## Hot reload
//!
//! The sections that drive per-order decisions (rules, areas, lifecycle,
//! retry and polling) form [`RuntimeSettings`]. They are published through a
//! [`SettingsHandle`] and can be swapped at runtime by [`SettingsWatcher`].

#[cfg(feature = "testing")]
pub mod builders;
mod loader;
mod settings;

pub use settings::{RuntimeSettings, SettingsHandle, SettingsWatcher};

use dispatch_types::{AreaConfig, RetryPolicy, RuleConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("Configuration error: {0}")]
	Parse(String),
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Keep the message only; the full error embeds the whole input.
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the dispatcher.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Identity and engine sizing.
	pub dispatch: DispatchConfig,
	#[serde(default)]
	pub lifecycle: LifecycleConfig,
	/// Retry policy for every provider call.
	#[serde(default)]
	pub retry: RetryPolicy,
	#[serde(default)]
	pub polling: PollingConfig,
	pub storage: StorageConfig,
	pub queue: QueueConfig,
	/// Provider id to raw adapter configuration. Each table carries an
	/// `implementation` key naming the adapter.
	pub providers: HashMap<String, toml::Value>,
	#[serde(default)]
	pub rules: RuleConfig,
	/// Demographic-area bounding boxes, checked in order.
	#[serde(default)]
	pub areas: Vec<AreaConfig>,
	pub api: Option<ApiConfig>,
	#[serde(default)]
	pub events: EventsConfig,
}

/// Configuration specific to the dispatcher instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
	pub id: String,
	/// Upper bound on concurrently running event handlers.
	#[serde(default = "default_max_concurrent_handlers")]
	pub max_concurrent_handlers: usize,
	/// How often the configuration file is checked for changes. 0 disables
	/// hot reload.
	#[serde(default = "default_reload_interval_seconds")]
	pub reload_interval_seconds: u64,
}

fn default_max_concurrent_handlers() -> usize {
	100
}

fn default_reload_interval_seconds() -> u64 {
	30
}

/// Order lifecycle limits.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
	/// Maximum number of providers tried for one order.
	pub max_fallback_depth: usize,
	/// Deadline for an accept/reject after a fulfillment request.
	pub fulfillment_timeout_seconds: u64,
	pub timeout_sweep_interval_seconds: u64,
}

impl Default for LifecycleConfig {
	fn default() -> Self {
		Self {
			max_fallback_depth: 3,
			fulfillment_timeout_seconds: 120,
			timeout_sweep_interval_seconds: 5,
		}
	}
}

impl LifecycleConfig {
	pub fn fulfillment_timeout(&self) -> Duration {
		Duration::from_secs(self.fulfillment_timeout_seconds)
	}
}

/// Polling reconciler cadence and backoff.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
	/// Cadence of reconciler cycles.
	pub interval_seconds: u64,
	/// Unknown statuses tolerated before an entry is surfaced as `poll_exhausted`.
	pub max_poll_attempts: u32,
	pub backoff_base_seconds: u64,
	pub backoff_max_seconds: u64,
	/// Maximum entries leased per cycle.
	pub batch_size: usize,
	/// How long a leased entry stays invisible to other consumers.
	pub visibility_timeout_seconds: u64,
	/// Per-provider overrides.
	pub providers: HashMap<String, ProviderPollingConfig>,
}

impl Default for PollingConfig {
	fn default() -> Self {
		Self {
			interval_seconds: 10,
			max_poll_attempts: 5,
			backoff_base_seconds: 10,
			backoff_max_seconds: 300,
			batch_size: 50,
			visibility_timeout_seconds: 60,
			providers: HashMap::new(),
		}
	}
}

impl PollingConfig {
	/// Base delay between polls of `provider`.
	pub fn base_delay_seconds(&self, provider: &str) -> u64 {
		self.providers
			.get(provider)
			.map(|p| p.interval_seconds)
			.unwrap_or(self.backoff_base_seconds)
	}

	/// Delay before the next poll once `poll_attempts` unknown results have
	/// been seen: `base * 2^(attempts - 1)`, capped at `backoff_max_seconds`.
	pub fn backoff_seconds(&self, provider: &str, poll_attempts: u32) -> u64 {
		let base = self.base_delay_seconds(provider);
		let exp = poll_attempts.saturating_sub(1).min(32);
		base.saturating_mul(1u64 << exp)
			.min(self.backoff_max_seconds.max(base))
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProviderPollingConfig {
	pub interval_seconds: u64,
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	pub primary: String,
	pub implementations: HashMap<String, toml::Value>,
}

/// Configuration for the pending-order queue backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
	pub primary: String,
	pub implementations: HashMap<String, toml::Value>,
}

/// Configuration for the HTTP ingress.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_api_host")]
	pub host: String,
	#[serde(default = "default_api_port")]
	pub port: u16,
	#[serde(default = "default_api_timeout")]
	pub timeout_seconds: u64,
	#[serde(default = "default_max_request_size")]
	pub max_request_size: usize,
	pub cors: Option<CorsConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
	pub allowed_origins: Vec<String>,
	pub allowed_headers: Vec<String>,
	pub allowed_methods: Vec<String>,
}

fn default_api_host() -> String {
	"127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
	3000
}

fn default_api_timeout() -> u64 {
	30
}

fn default_max_request_size() -> usize {
	1024 * 1024
}

/// Outbound event settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
	/// When set, every `ORDER_STATE_CHANGED` is POSTed here.
	pub outbound_url: Option<String>,
	/// Capacity of the in-process broadcast channel.
	pub bus_capacity: usize,
}

impl Default for EventsConfig {
	fn default() -> Self {
		Self {
			outbound_url: None,
			bus_capacity: 1000,
		}
	}
}

/// Returns the `implementation` key of a provider section.
pub fn provider_implementation(section: &toml::Value) -> Option<&str> {
	section.get("implementation").and_then(|v| v.as_str())
}

/// Resolves environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of `VAR_NAME` and supports
/// `${VAR_NAME:-default}`. Inputs larger than 1MB are rejected.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut missing = None;
	let resolved = re.replace_all(input, |caps: &regex::Captures<'_>| {
		let var_name = &caps[1];
		match (std::env::var(var_name), caps.get(2)) {
			(Ok(value), _) => value,
			(Err(_), Some(default)) => default.as_str().to_string(),
			(Err(_), None) => {
				missing.get_or_insert_with(|| var_name.to_string());
				String::new()
			},
		}
	});

	match missing {
		Some(var_name) => Err(ConfigError::Validation(format!(
			"Environment variable '{}' not found",
			var_name
		))),
		None => Ok(resolved.into_owned()),
	}
}

impl Config {
	/// Loads configuration from a file, following `include` directives.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let path_buf = Path::new(path);
		let base_dir = path_buf.parent().unwrap_or_else(|| Path::new("."));

		let mut loader = loader::ConfigLoader::new(base_dir);
		let file_name = path_buf
			.file_name()
			.ok_or_else(|| ConfigError::Validation(format!("Invalid path: {}", path)))?;
		loader.load_config(file_name).await
	}

	/// The hot-reloadable part of the configuration.
	pub fn runtime_settings(&self) -> RuntimeSettings {
		RuntimeSettings {
			lifecycle: self.lifecycle.clone(),
			retry: self.retry.clone(),
			polling: self.polling.clone(),
			rules: self.rules.clone(),
			areas: self.areas.clone(),
		}
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.dispatch.id.is_empty() {
			return Err(ConfigError::Validation(
				"Dispatcher ID cannot be empty".into(),
			));
		}
		if self.dispatch.max_concurrent_handlers == 0 {
			return Err(ConfigError::Validation(
				"max_concurrent_handlers must be at least 1".into(),
			));
		}

		validate_backend("storage", &self.storage.primary, &self.storage.implementations)?;
		validate_backend("queue", &self.queue.primary, &self.queue.implementations)?;

		if self.providers.is_empty() {
			return Err(ConfigError::Validation(
				"At least one provider must be configured".into(),
			));
		}
		for (id, section) in &self.providers {
			if provider_implementation(section).is_none() {
				return Err(ConfigError::Validation(format!(
					"Provider '{}' must declare an 'implementation'",
					id
				)));
			}
		}

		self.runtime_settings().validate(&self.providers)?;

		if let Some(api) = self.api.as_ref().filter(|api| api.enabled) {
			if api.timeout_seconds == 0 {
				return Err(ConfigError::Validation(
					"API timeout_seconds must be greater than 0".into(),
				));
			}
		}

		if self.events.bus_capacity == 0 {
			return Err(ConfigError::Validation(
				"events.bus_capacity must be greater than 0".into(),
			));
		}

		Ok(())
	}
}

fn validate_backend(
	section: &str,
	primary: &str,
	implementations: &HashMap<String, toml::Value>,
) -> Result<(), ConfigError> {
	if implementations.is_empty() {
		return Err(ConfigError::Validation(format!(
			"At least one {} implementation must be configured",
			section
		)));
	}
	if primary.is_empty() {
		return Err(ConfigError::Validation(format!(
			"{} primary implementation cannot be empty",
			section
		)));
	}
	if !implementations.contains_key(primary) {
		return Err(ConfigError::Validation(format!(
			"Primary {} '{}' not found in implementations",
			section, primary
		)));
	}
	Ok(())
}

/// Parses a TOML string, resolving environment variables, and validates it.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}
