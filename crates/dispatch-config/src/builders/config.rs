//! Fluent construction of [`Config`] values without going through TOML.

use crate::{
	ApiConfig, Config, DispatchConfig, EventsConfig, LifecycleConfig, PollingConfig, QueueConfig,
	StorageConfig,
};
use dispatch_types::{AreaConfig, ProviderRule, RetryPolicy, RuleConfig};
use std::collections::HashMap;

/// Builds a `Config` with in-memory storage and queue and no providers.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
	dispatch_id: String,
	storage_primary: String,
	queue_primary: String,
	providers: HashMap<String, toml::Value>,
	lifecycle: LifecycleConfig,
	retry: RetryPolicy,
	polling: PollingConfig,
	rules: RuleConfig,
	areas: Vec<AreaConfig>,
	api: Option<ApiConfig>,
}

impl Default for ConfigBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigBuilder {
	pub fn new() -> Self {
		Self {
			dispatch_id: "test-dispatcher".to_string(),
			storage_primary: "memory".to_string(),
			queue_primary: "memory".to_string(),
			providers: HashMap::new(),
			lifecycle: LifecycleConfig::default(),
			retry: RetryPolicy::no_retry(),
			polling: PollingConfig::default(),
			rules: RuleConfig::default(),
			areas: Vec::new(),
			api: None,
		}
	}

	pub fn dispatch_id(mut self, id: impl Into<String>) -> Self {
		self.dispatch_id = id.into();
		self
	}

	pub fn storage_primary(mut self, primary: impl Into<String>) -> Self {
		self.storage_primary = primary.into();
		self
	}

	pub fn queue_primary(mut self, primary: impl Into<String>) -> Self {
		self.queue_primary = primary.into();
		self
	}

	/// Adds a provider section. `section` is merged with
	/// `implementation = <implementation>`.
	pub fn provider(
		mut self,
		id: impl Into<String>,
		implementation: &str,
		mut section: toml::Table,
	) -> Self {
		section.insert(
			"implementation".to_string(),
			toml::Value::String(implementation.to_string()),
		);
		self.providers.insert(id.into(), toml::Value::Table(section));
		self
	}

	/// Adds an area rule list, in the given priority order.
	pub fn area_rules(mut self, area: impl Into<String>, providers: &[&str]) -> Self {
		let count = providers.len() as i64;
		let rules = providers
			.iter()
			.enumerate()
			.map(|(i, p)| ProviderRule::new(*p, count - i as i64))
			.collect();
		self.rules.areas.insert(area.into(), rules);
		self
	}

	pub fn default_rules(mut self, rules: Vec<ProviderRule>) -> Self {
		self.rules.default = rules;
		self
	}

	pub fn areas(mut self, areas: Vec<AreaConfig>) -> Self {
		self.areas = areas;
		self
	}

	pub fn lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
		self.lifecycle = lifecycle;
		self
	}

	pub fn retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	pub fn polling(mut self, polling: PollingConfig) -> Self {
		self.polling = polling;
		self
	}

	pub fn api(mut self, api: Option<ApiConfig>) -> Self {
		self.api = api;
		self
	}

	pub fn build(self) -> Config {
		let backend = |primary: &str| {
			HashMap::from([(primary.to_string(), toml::Value::Table(toml::Table::new()))])
		};

		Config {
			dispatch: DispatchConfig {
				id: self.dispatch_id,
				max_concurrent_handlers: 16,
				reload_interval_seconds: 0,
			},
			lifecycle: self.lifecycle,
			retry: self.retry,
			polling: self.polling,
			storage: StorageConfig {
				implementations: backend(&self.storage_primary),
				primary: self.storage_primary,
			},
			queue: QueueConfig {
				implementations: backend(&self.queue_primary),
				primary: self.queue_primary,
			},
			providers: self.providers,
			rules: self.rules,
			areas: self.areas,
			api: self.api,
			events: EventsConfig::default(),
		}
	}
}
