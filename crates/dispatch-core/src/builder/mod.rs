//! Builder for constructing dispatcher engines.
//!
//! Storage, queue and provider implementations are created from their
//! configuration sections through factory functions looked up by
//! implementation name. Tests can hand in provider instances directly.

use crate::engine::{event_bus::EventBus, DispatchEngine};
use dispatch_config::{provider_implementation, Config, SettingsHandle};
use dispatch_provider::{ProviderError, ProviderInterface, ProviderService};
use dispatch_queue::{QueueError, QueueInterface, QueueService};
use dispatch_storage::{StorageError, StorageInterface, StorageService};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing required component: {0}")]
	MissingComponent(String),
}

/// Factory functions for every pluggable component, keyed by
/// implementation name.
pub struct DispatchFactories<SF, QF, PF> {
	pub storage_factories: HashMap<String, SF>,
	pub queue_factories: HashMap<String, QF>,
	pub provider_factories: HashMap<String, PF>,
}

pub struct DispatchBuilder {
	config: Config,
	config_path: Option<PathBuf>,
	settings: Option<SettingsHandle>,
	providers: HashMap<String, Arc<dyn ProviderInterface>>,
}

impl DispatchBuilder {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			config_path: None,
			settings: None,
			providers: HashMap::new(),
		}
	}

	/// File watched for runtime settings changes.
	pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.config_path = Some(path.into());
		self
	}

	/// Shares an existing settings handle instead of creating one.
	pub fn with_settings(mut self, settings: SettingsHandle) -> Self {
		self.settings = Some(settings);
		self
	}

	/// Uses `provider` for `id` instead of building it from its section.
	pub fn with_provider(mut self, id: impl Into<String>, provider: Arc<dyn ProviderInterface>) -> Self {
		self.providers.insert(id.into(), provider);
		self
	}

	pub fn build<SF, QF, PF>(
		self,
		factories: DispatchFactories<SF, QF, PF>,
	) -> Result<DispatchEngine, BuilderError>
	where
		SF: Fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>,
		QF: Fn(&toml::Value, Arc<StorageService>) -> Result<Box<dyn QueueInterface>, QueueError>,
		PF: Fn(&toml::Value) -> Result<Box<dyn ProviderInterface>, ProviderError>,
	{
		let storage = Arc::new(StorageService::new(build_primary(
			"storage",
			&self.config.storage.primary,
			&self.config.storage.implementations,
			&factories.storage_factories,
			|factory, config| factory(config),
		)?));

		let queue = Arc::new(QueueService::new(build_primary(
			"queue",
			&self.config.queue.primary,
			&self.config.queue.implementations,
			&factories.queue_factories,
			|factory, config| factory(config, storage.clone()),
		)?));

		let mut providers = self.providers;
		for (id, section) in &self.config.providers {
			if providers.contains_key(id) {
				tracing::info!(component = "provider", provider = %id, "Using supplied instance");
				continue;
			}

			let implementation = provider_implementation(section).ok_or_else(|| {
				BuilderError::Config(format!("Provider '{}' has no implementation", id))
			})?;
			let factory = factories
				.provider_factories
				.get(implementation)
				.ok_or_else(|| {
					BuilderError::Config(format!(
						"Unknown implementation '{}' for provider '{}'",
						implementation, id
					))
				})?;

			match factory(section) {
				Ok(provider) => {
					tracing::info!(
						component = "provider",
						provider = %id,
						implementation = %implementation,
						kind = ?provider.kind(),
						"Loaded"
					);
					providers.insert(id.clone(), Arc::from(provider));
				},
				Err(e) => {
					tracing::error!(
						component = "provider",
						provider = %id,
						error = %e,
						"Failed to create provider"
					);
					return Err(BuilderError::Config(format!(
						"Failed to create provider '{}': {}",
						id, e
					)));
				},
			}
		}

		if providers.is_empty() {
			return Err(BuilderError::MissingComponent("provider".into()));
		}

		let settings = self
			.settings
			.unwrap_or_else(|| SettingsHandle::new(self.config.runtime_settings()));
		let event_bus = EventBus::new(self.config.events.bus_capacity);

		Ok(DispatchEngine::new(
			self.config,
			self.config_path,
			settings,
			storage,
			queue,
			Arc::new(ProviderService::new(providers)),
			event_bus,
		))
	}
}

/// Creates the primary implementation of a backend section.
fn build_primary<F, T, E: std::fmt::Display>(
	component: &str,
	primary: &str,
	implementations: &HashMap<String, toml::Value>,
	factories: &HashMap<String, F>,
	create: impl Fn(&F, &toml::Value) -> Result<T, E>,
) -> Result<T, BuilderError> {
	let config = implementations.get(primary).ok_or_else(|| {
		BuilderError::Config(format!(
			"Primary {} '{}' has no configuration",
			component, primary
		))
	})?;
	let factory = factories.get(primary).ok_or_else(|| {
		BuilderError::Config(format!("Unknown {} implementation '{}'", component, primary))
	})?;

	match create(factory, config) {
		Ok(implementation) => {
			tracing::info!(component = %component, implementation = %primary, "Loaded");
			Ok(implementation)
		},
		Err(e) => {
			tracing::error!(
				component = %component,
				implementation = %primary,
				error = %e,
				"Failed to create implementation"
			);
			Err(BuilderError::Config(format!(
				"Failed to create {} implementation '{}': {}",
				component, primary, e
			)))
		},
	}
}
