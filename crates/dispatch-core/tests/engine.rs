mod common;

use common::*;
use dispatch_core::DispatchEngine;
use dispatch_provider::implementations::mock::MockProvider;
use dispatch_types::{DispatchEvent, OrderState, ProviderStatus};
use std::time::Duration;

fn start(engine: &DispatchEngine) {
	let engine = engine.clone();
	tokio::spawn(async move { engine.run().await });
}

/// Orders in `ids` not yet in `state`.
async fn pending(harness: &Harness, ids: &[String], state: OrderState) -> usize {
	let mut pending = 0;
	for id in ids {
		let order = harness.engine.orchestrator().get_order(id).await.unwrap();
		if order.map(|order| order.state) != Some(state) {
			pending += 1;
		}
	}
	pending
}

/// Waits up to ten seconds for every order in `ids` to reach `state` and
/// returns how many did not.
async fn settle(harness: &Harness, ids: &[String], state: OrderState) -> usize {
	for _ in 0..500 {
		if pending(harness, ids, state).await == 0 {
			return 0;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	pending(harness, ids, state).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_follows_creation_through_inbound_channel() {
	let acme = shared(MockProvider::push().with_delay(Duration::from_millis(1)));
	let harness = Harness::new(config(&["acme"]).build(), &[("acme", &acme)]);
	start(&harness.engine);

	let inbound = harness.engine.inbound_sender();
	let ids: Vec<String> = (0..200).map(|i| format!("o-{}", i)).collect();
	for id in &ids {
		inbound.send(new_order(id, "A")).unwrap();
		inbound.send(cancel(id, 2)).unwrap();
	}

	assert_eq!(settle(&harness, &ids, OrderState::Cancelled).await, 0);
	assert_eq!(acme.fulfillment_calls(), 200);
	assert_eq!(acme.cancel_calls(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_updates_apply_in_sequence_order() {
	let acme = shared(MockProvider::push().with_delay(Duration::from_millis(1)));
	let harness = Harness::new(config(&["acme"]).build(), &[("acme", &acme)]);
	let mut bus = harness.engine.event_bus().subscribe();
	start(&harness.engine);

	let inbound = harness.engine.inbound_sender();
	let ids: Vec<String> = (0..50).map(|i| format!("o-{}", i)).collect();
	for id in &ids {
		inbound.send(new_order(id, "A")).unwrap();
		inbound
			.send(update(id, 2, "acme", ProviderStatus::InProgress))
			.unwrap();
		inbound
			.send(update(id, 3, "acme", ProviderStatus::Delivered))
			.unwrap();
	}

	assert_eq!(settle(&harness, &ids, OrderState::Delivered).await, 0);

	let mut discarded = 0;
	while let Ok(event) = bus.try_recv() {
		if matches!(event, DispatchEvent::Discarded { .. }) {
			discarded += 1;
		}
	}
	assert_eq!(discarded, 0);

	let order = harness.order("o-0").await;
	assert_eq!(
		states(&order),
		vec![
			OrderState::New,
			OrderState::ProviderSelected,
			OrderState::FulfillmentRequested,
			OrderState::Accepted,
			OrderState::InProgress,
			OrderState::Delivered,
		]
	);
}
