//! Shared harness for dispatcher scenario tests.

#![allow(dead_code)]

use dispatch_config::builders::ConfigBuilder;
use dispatch_config::{Config, LifecycleConfig, PollingConfig};
use dispatch_core::{DispatchBuilder, DispatchEngine, DispatchFactories, EventOutcome};
use dispatch_provider::implementations::mock::MockProvider;
use dispatch_provider::ProviderFactory;
use dispatch_queue::QueueFactory;
use dispatch_storage::StorageFactory;
use dispatch_types::{
	DispatchEvent, GeoPoint, InboundEvent, InboundPayload, NewOrder, Order, OrderState,
	OrderStateChanged, ProviderStatus,
};
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct Harness {
	pub engine: DispatchEngine,
	events: broadcast::Receiver<DispatchEvent>,
}

impl Harness {
	/// Builds an engine over in-memory backends with the given mocks.
	pub fn new(config: Config, providers: &[(&str, &Arc<MockProvider>)]) -> Self {
		let mut builder = DispatchBuilder::new(config);
		for (id, provider) in providers {
			builder = builder.with_provider(*id, (*provider).clone());
		}
		let engine = builder.build(factories()).unwrap();
		let events = engine.event_bus().subscribe();
		Self { engine, events }
	}

	pub async fn send(&self, event: InboundEvent) -> EventOutcome {
		self.engine
			.orchestrator()
			.handle_inbound(event)
			.await
			.unwrap()
	}

	pub async fn order(&self, order_id: &str) -> Order {
		self.engine
			.orchestrator()
			.get_order(order_id)
			.await
			.unwrap()
			.unwrap()
	}

	pub async fn queued(&self, order_id: &str) -> bool {
		self.engine.queue().contains(order_id).await.unwrap()
	}

	/// State changes published since the last call.
	pub fn state_changes(&mut self) -> Vec<OrderStateChanged> {
		let mut changes = Vec::new();
		while let Ok(event) = self.events.try_recv() {
			if let DispatchEvent::StateChanged(change) = event {
				changes.push(change);
			}
		}
		changes
	}
}

pub fn factories() -> DispatchFactories<StorageFactory, QueueFactory, ProviderFactory> {
	DispatchFactories {
		storage_factories: dispatch_storage::get_all_implementations()
			.into_iter()
			.map(|(name, factory)| (name.to_string(), factory))
			.collect(),
		queue_factories: dispatch_queue::get_all_implementations()
			.into_iter()
			.map(|(name, factory)| (name.to_string(), factory))
			.collect(),
		provider_factories: dispatch_provider::get_all_implementations()
			.into_iter()
			.map(|(name, factory)| (name.to_string(), factory))
			.collect(),
	}
}

/// Configuration with area `A` served by `providers` in priority order.
pub fn config(providers: &[&str]) -> ConfigBuilder {
	ConfigBuilder::new().area_rules("A", providers)
}

pub fn lifecycle(max_fallback_depth: usize) -> LifecycleConfig {
	LifecycleConfig {
		max_fallback_depth,
		..Default::default()
	}
}

pub fn polling(max_poll_attempts: u32) -> PollingConfig {
	PollingConfig {
		max_poll_attempts,
		..Default::default()
	}
}

pub fn request(area: &str) -> NewOrder {
	NewOrder {
		origin_id: "restaurant-7".into(),
		destination_id: "customer-42".into(),
		pickup_location: GeoPoint::new(1.30, 103.80),
		dropoff_location: GeoPoint::new(1.32, 103.84),
		demographic_area: Some(area.to_string()),
	}
}

pub fn new_order(order_id: &str, area: &str) -> InboundEvent {
	InboundEvent {
		order_id: order_id.to_string(),
		sequence: 1,
		payload: InboundPayload::NewOrder {
			order: request(area),
		},
	}
}

pub fn origin_ack(order_id: &str, sequence: u64) -> InboundEvent {
	InboundEvent {
		order_id: order_id.to_string(),
		sequence,
		payload: InboundPayload::OriginOrderAck,
	}
}

pub fn update(order_id: &str, sequence: u64, provider: &str, status: ProviderStatus) -> InboundEvent {
	InboundEvent {
		order_id: order_id.to_string(),
		sequence,
		payload: InboundPayload::OrderUpdate {
			provider: Some(provider.to_string()),
			provider_status: status,
		},
	}
}

pub fn cancel(order_id: &str, sequence: u64) -> InboundEvent {
	InboundEvent {
		order_id: order_id.to_string(),
		sequence,
		payload: InboundPayload::CancelOrder,
	}
}

pub fn states(order: &Order) -> Vec<OrderState> {
	order.history.iter().map(|entry| entry.state).collect()
}

pub fn last_reason(order: &Order) -> Option<&str> {
	order.history.last().and_then(|entry| entry.reason.as_deref())
}

pub fn shared(provider: MockProvider) -> Arc<MockProvider> {
	Arc::new(provider)
}
