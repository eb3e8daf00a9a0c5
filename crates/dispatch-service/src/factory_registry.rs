//! Factory registry for dispatcher implementations.
//!
//! Every storage, queue and provider implementation registers its factory
//! here under its implementation name. The configuration then picks
//! implementations by name.

use dispatch_config::{provider_implementation, Config};
use dispatch_core::{DispatchBuilder, DispatchEngine, DispatchFactories};
use dispatch_provider::ProviderFactory;
use dispatch_queue::QueueFactory;
use dispatch_storage::StorageFactory;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

/// Global registry for all implementation factories
pub struct FactoryRegistry {
	pub storage: HashMap<String, StorageFactory>,
	pub queue: HashMap<String, QueueFactory>,
	pub provider: HashMap<String, ProviderFactory>,
}

impl FactoryRegistry {
	pub fn new() -> Self {
		Self {
			storage: HashMap::new(),
			queue: HashMap::new(),
			provider: HashMap::new(),
		}
	}

	pub fn register_storage(&mut self, name: impl Into<String>, factory: StorageFactory) {
		self.storage.insert(name.into(), factory);
	}

	pub fn register_queue(&mut self, name: impl Into<String>, factory: QueueFactory) {
		self.queue.insert(name.into(), factory);
	}

	pub fn register_provider(&mut self, name: impl Into<String>, factory: ProviderFactory) {
		self.provider.insert(name.into(), factory);
	}
}

static REGISTRY: OnceLock<FactoryRegistry> = OnceLock::new();

/// Initialize the global registry with all available implementations
pub fn initialize_registry() -> &'static FactoryRegistry {
	REGISTRY.get_or_init(|| {
		let mut registry = FactoryRegistry::new();

		for (name, factory) in dispatch_storage::get_all_implementations() {
			tracing::debug!("Registering storage implementation: {}", name);
			registry.register_storage(name, factory);
		}

		for (name, factory) in dispatch_queue::get_all_implementations() {
			tracing::debug!("Registering queue implementation: {}", name);
			registry.register_queue(name, factory);
		}

		for (name, factory) in dispatch_provider::get_all_implementations() {
			tracing::debug!("Registering provider implementation: {}", name);
			registry.register_provider(name, factory);
		}

		registry
	})
}

pub fn get_registry() -> &'static FactoryRegistry {
	initialize_registry()
}

/// Looks up each named implementation, failing on the first unknown name.
macro_rules! build_factories {
	($registry:expr, $names:expr, $registry_field:ident, $type_name:literal) => {{
		let mut factories = HashMap::new();
		for name in $names {
			if let Some(factory) = $registry.$registry_field.get(name) {
				factories.insert(name.to_string(), *factory);
			} else {
				let mut available: Vec<_> = $registry.$registry_field.keys().cloned().collect();
				available.sort();
				return Err(format!(
					"Unknown {} implementation '{}'. Available: [{}]",
					$type_name,
					name,
					available.join(", ")
				)
				.into());
			}
		}
		factories
	}};
}

/// Builds the dispatcher from the registry and `config`. `config_path` is
/// watched for runtime settings changes.
pub fn build_dispatcher_from_config(
	config: Config,
	config_path: &Path,
) -> Result<DispatchEngine, Box<dyn std::error::Error>> {
	let registry = get_registry();

	let storage_factories =
		build_factories!(registry, config.storage.implementations.keys(), storage, "storage");
	let queue_factories =
		build_factories!(registry, config.queue.implementations.keys(), queue, "queue");

	let mut provider_names = Vec::new();
	for (id, section) in &config.providers {
		let name = provider_implementation(section)
			.ok_or_else(|| format!("Provider '{}' has no implementation", id))?;
		provider_names.push(name);
	}
	let provider_factories = build_factories!(registry, provider_names, provider, "provider");

	let factories = DispatchFactories {
		storage_factories,
		queue_factories,
		provider_factories,
	};

	Ok(DispatchBuilder::new(config)
		.with_config_path(config_path)
		.build(factories)?)
}
