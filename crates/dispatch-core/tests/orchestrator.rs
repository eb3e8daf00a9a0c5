mod common;

use chrono::{Duration, Utc};
use common::*;
use dispatch_core::EventOutcome;
use dispatch_provider::implementations::mock::{MockProvider, MockReply};
use dispatch_types::{DiscardReason, OrderState, ProviderStatus};

#[tokio::test]
async fn test_rejection_falls_back_to_next_provider() {
	let acme = shared(MockProvider::push().with_fulfillment_script(vec![MockReply::Reject(
		"no couriers".into(),
	)]));
	let zenith = shared(MockProvider::push());
	let mut harness = Harness::new(
		config(&["acme", "zenith"]).build(),
		&[("acme", &acme), ("zenith", &zenith)],
	);

	assert_eq!(harness.send(new_order("o-1", "A")).await, EventOutcome::Applied);

	let order = harness.order("o-1").await;
	assert_eq!(order.state, OrderState::Accepted);
	assert_eq!(order.selected_provider.as_deref(), Some("zenith"));
	assert_eq!(order.attempted_providers, vec!["acme", "zenith"]);
	assert_eq!(order.retry_count, 1);
	assert_eq!(
		states(&order),
		vec![
			OrderState::New,
			OrderState::ProviderSelected,
			OrderState::FulfillmentRequested,
			OrderState::ProviderSelected,
			OrderState::FulfillmentRequested,
			OrderState::Accepted,
		]
	);
	assert_eq!(
		order.history[3].reason.as_deref(),
		Some("provider_rejected: no couriers")
	);
	assert_eq!(acme.tokens(), vec!["o-1:1"]);
	assert_eq!(zenith.tokens(), vec!["o-1:2"]);

	// One published change per transition.
	let changes = harness.state_changes();
	assert_eq!(changes.len(), order.history.len() - 1);
	assert_eq!(changes[0].old_state, OrderState::New);
	assert_eq!(changes.last().unwrap().new_state, OrderState::Accepted);
	assert_eq!(changes.last().unwrap().provider.as_deref(), Some("zenith"));

	harness.send(origin_ack("o-1", 2)).await;
	harness
		.send(update("o-1", 3, "zenith", ProviderStatus::Delivered))
		.await;

	let order = harness.order("o-1").await;
	assert_eq!(order.state, OrderState::Delivered);
	assert_eq!(
		states(&order)[6..],
		[OrderState::InProgress, OrderState::Delivered]
	);
}

#[tokio::test]
async fn test_unreachable_provider_falls_back() {
	let acme = shared(MockProvider::push().with_default_reply(MockReply::Unreachable));
	let zenith = shared(MockProvider::push());
	let harness = Harness::new(
		config(&["acme", "zenith"]).build(),
		&[("acme", &acme), ("zenith", &zenith)],
	);

	harness.send(new_order("o-1", "A")).await;

	let order = harness.order("o-1").await;
	assert_eq!(order.state, OrderState::Accepted);
	assert_eq!(order.history[3].reason.as_deref(), Some("provider_unreachable"));
}

#[tokio::test]
async fn test_area_without_rules_fails() {
	let acme = shared(MockProvider::push());
	let harness = Harness::new(config(&["acme"]).build(), &[("acme", &acme)]);

	harness.send(new_order("o-1", "Z")).await;

	let order = harness.order("o-1").await;
	assert_eq!(order.state, OrderState::Failed);
	assert_eq!(states(&order), vec![OrderState::New, OrderState::Failed]);
	assert_eq!(last_reason(&order), Some("no_provider_available"));
	assert_eq!(acme.fulfillment_calls(), 0);
}

#[tokio::test]
async fn test_fallback_depth_is_bounded() {
	let providers: Vec<_> = (0..4)
		.map(|_| shared(MockProvider::push().with_default_reply(MockReply::Reject("busy".into()))))
		.collect();
	let harness = Harness::new(
		config(&["p1", "p2", "p3", "p4"]).lifecycle(lifecycle(3)).build(),
		&[
			("p1", &providers[0]),
			("p2", &providers[1]),
			("p3", &providers[2]),
			("p4", &providers[3]),
		],
	);

	harness.send(new_order("o-1", "A")).await;

	let order = harness.order("o-1").await;
	assert_eq!(order.state, OrderState::Failed);
	assert_eq!(last_reason(&order), Some("providers_exhausted"));
	assert_eq!(order.attempted_providers, vec!["p1", "p2", "p3"]);
	assert_eq!(providers[3].fulfillment_calls(), 0);
}

#[tokio::test]
async fn test_every_candidate_declines() {
	let acme = shared(MockProvider::push().with_default_reply(MockReply::RejectWithError));
	let harness = Harness::new(config(&["acme"]).build(), &[("acme", &acme)]);

	harness.send(new_order("o-1", "A")).await;

	let order = harness.order("o-1").await;
	assert_eq!(order.state, OrderState::Failed);
	assert_eq!(last_reason(&order), Some("providers_exhausted"));
	assert_eq!(acme.fulfillment_calls(), 1);
}

#[tokio::test]
async fn test_replayed_events_are_stale() {
	let acme = shared(MockProvider::push());
	let harness = Harness::new(config(&["acme"]).build(), &[("acme", &acme)]);

	harness.send(new_order("o-1", "A")).await;
	harness
		.send(update("o-1", 2, "acme", ProviderStatus::InProgress))
		.await;

	assert_eq!(
		harness.send(new_order("o-1", "A")).await,
		EventOutcome::Discarded(DiscardReason::Stale)
	);
	assert_eq!(
		harness
			.send(update("o-1", 2, "acme", ProviderStatus::Delivered))
			.await,
		EventOutcome::Discarded(DiscardReason::Stale)
	);

	let order = harness.order("o-1").await;
	assert_eq!(order.state, OrderState::InProgress);
	assert_eq!(order.last_sequence, 2);
	assert_eq!(acme.fulfillment_calls(), 1);
}

#[tokio::test]
async fn test_events_for_unknown_orders_are_discarded() {
	let acme = shared(MockProvider::push());
	let harness = Harness::new(config(&["acme"]).build(), &[("acme", &acme)]);

	assert_eq!(
		harness.send(cancel("ghost", 4)).await,
		EventOutcome::Discarded(DiscardReason::UnknownOrder)
	);
	assert!(harness
		.engine
		.orchestrator()
		.get_order("ghost")
		.await
		.unwrap()
		.is_none());
}

#[tokio::test]
async fn test_update_from_previous_provider_is_discarded() {
	let acme = shared(MockProvider::push().with_default_reply(MockReply::Reject("busy".into())));
	let zenith = shared(MockProvider::push());
	let harness = Harness::new(
		config(&["acme", "zenith"]).build(),
		&[("acme", &acme), ("zenith", &zenith)],
	);

	harness.send(new_order("o-1", "A")).await;

	assert_eq!(
		harness
			.send(update("o-1", 2, "acme", ProviderStatus::Delivered))
			.await,
		EventOutcome::Discarded(DiscardReason::ProviderMismatch)
	);
	let order = harness.order("o-1").await;
	assert_eq!(order.state, OrderState::Accepted);
	// Discarded events still consume their sequence number.
	assert_eq!(order.last_sequence, 2);
}

#[tokio::test]
async fn test_update_for_settled_order_is_invalid() {
	let acme = shared(MockProvider::push());
	let harness = Harness::new(config(&["acme"]).build(), &[("acme", &acme)]);

	harness.send(new_order("o-1", "A")).await;
	harness
		.send(update("o-1", 2, "acme", ProviderStatus::Delivered))
		.await;

	assert_eq!(
		harness
			.send(update("o-1", 3, "acme", ProviderStatus::InProgress))
			.await,
		EventOutcome::Discarded(DiscardReason::InvalidTransition)
	);
	assert_eq!(harness.order("o-1").await.state, OrderState::Delivered);
}

#[tokio::test]
async fn test_delivered_update_walks_through_implied_states() {
	let acme = shared(MockProvider::poll());
	let harness = Harness::new(config(&["acme"]).build(), &[("acme", &acme)]);

	harness.send(new_order("o-1", "A")).await;
	harness
		.send(update("o-1", 2, "acme", ProviderStatus::Delivered))
		.await;

	let order = harness.order("o-1").await;
	assert_eq!(
		states(&order)[3..],
		[
			OrderState::Accepted,
			OrderState::InProgress,
			OrderState::Delivered
		]
	);
	assert_eq!(
		order.history[3].reason.as_deref(),
		Some("implied_by_provider_update")
	);
	assert_eq!(last_reason(&order), Some("provider_delivered"));
	assert!(order.fulfillment_deadline.is_none());
}

#[tokio::test]
async fn test_origin_ack_before_acceptance_is_remembered() {
	let acme = shared(MockProvider::poll());
	let harness = Harness::new(config(&["acme"]).build(), &[("acme", &acme)]);

	harness.send(new_order("o-1", "A")).await;
	assert_eq!(harness.send(origin_ack("o-1", 2)).await, EventOutcome::Applied);

	let order = harness.order("o-1").await;
	assert_eq!(order.state, OrderState::FulfillmentRequested);
	assert!(order.origin_acknowledged);

	harness
		.send(update("o-1", 3, "acme", ProviderStatus::Accepted))
		.await;

	let order = harness.order("o-1").await;
	assert_eq!(order.state, OrderState::InProgress);
	assert_eq!(last_reason(&order), Some("origin_acknowledged"));
	assert_eq!(
		states(&order)[3..],
		[OrderState::Accepted, OrderState::InProgress]
	);
}

#[tokio::test]
async fn test_provider_failure_after_acceptance_falls_back() {
	let acme = shared(MockProvider::push());
	let zenith = shared(MockProvider::push());
	let harness = Harness::new(
		config(&["acme", "zenith"]).build(),
		&[("acme", &acme), ("zenith", &zenith)],
	);

	harness.send(new_order("o-1", "A")).await;
	harness.send(origin_ack("o-1", 2)).await;
	harness
		.send(update("o-1", 3, "acme", ProviderStatus::Failed))
		.await;

	let order = harness.order("o-1").await;
	assert_eq!(order.selected_provider.as_deref(), Some("zenith"));
	// The origin acknowledgement carries over to the new provider.
	assert_eq!(order.state, OrderState::InProgress);
	assert_eq!(order.history[5].reason.as_deref(), Some("provider_failed"));
}

#[tokio::test]
async fn test_cancel_in_progress_calls_provider_once() {
	let acme = shared(MockProvider::push());
	let harness = Harness::new(config(&["acme"]).build(), &[("acme", &acme)]);

	harness.send(new_order("o-1", "A")).await;
	harness.send(origin_ack("o-1", 2)).await;
	assert_eq!(harness.order("o-1").await.state, OrderState::InProgress);

	assert_eq!(harness.send(cancel("o-1", 3)).await, EventOutcome::Applied);
	assert_eq!(harness.send(cancel("o-1", 4)).await, EventOutcome::Ignored);

	let order = harness.order("o-1").await;
	assert_eq!(order.state, OrderState::Cancelled);
	assert_eq!(last_reason(&order), Some("cancel_requested"));
	assert!(order.pending_action.is_none());
	assert_eq!(acme.cancel_calls(), 1);
	// Cancel reuses the fulfillment attempt's token.
	assert_eq!(acme.tokens(), vec!["o-1:1", "o-1:1"]);
}

#[tokio::test]
async fn test_failed_cancel_is_kept_for_recovery() {
	let acme = shared(MockProvider::push().with_cancel_script(vec![MockReply::Unreachable]));
	let harness = Harness::new(config(&["acme"]).build(), &[("acme", &acme)]);

	harness.send(new_order("o-1", "A")).await;
	harness.send(cancel("o-1", 2)).await;

	let order = harness.order("o-1").await;
	assert_eq!(order.state, OrderState::Cancelled);
	assert!(order.pending_action.is_some());
}

#[tokio::test]
async fn test_cancel_after_failure_is_ignored() {
	let acme = shared(MockProvider::push());
	let harness = Harness::new(config(&["acme"]).build(), &[("acme", &acme)]);

	harness.send(new_order("o-1", "Z")).await;
	assert_eq!(harness.order("o-1").await.state, OrderState::Failed);
	assert_eq!(harness.send(cancel("o-1", 2)).await, EventOutcome::Ignored);
	assert_eq!(acme.cancel_calls(), 0);
}

#[tokio::test]
async fn test_cancel_removes_pending_entry() {
	let acme = shared(MockProvider::poll());
	let harness = Harness::new(config(&["acme"]).build(), &[("acme", &acme)]);

	harness.send(new_order("o-1", "A")).await;
	assert!(harness.queued("o-1").await);

	harness.send(cancel("o-1", 2)).await;

	assert!(!harness.queued("o-1").await);
	assert_eq!(acme.cancel_calls(), 1);
}

#[tokio::test]
async fn test_fulfillment_timeout_falls_back() {
	let acme = shared(MockProvider::poll());
	let zenith = shared(MockProvider::push());
	let harness = Harness::new(
		config(&["acme", "zenith"]).build(),
		&[("acme", &acme), ("zenith", &zenith)],
	);

	harness.send(new_order("o-1", "A")).await;
	let orchestrator = harness.engine.orchestrator();

	assert_eq!(orchestrator.expire_deadlines(Utc::now()).await, 0);
	assert_eq!(
		orchestrator
			.expire_deadlines(Utc::now() + Duration::hours(1))
			.await,
		1
	);

	let order = harness.order("o-1").await;
	assert_eq!(order.state, OrderState::Accepted);
	assert_eq!(order.selected_provider.as_deref(), Some("zenith"));
	assert_eq!(order.history[3].reason.as_deref(), Some("fulfillment_timeout"));
	assert_eq!(acme.cancel_calls(), 1);
	assert!(!harness.queued("o-1").await);

	// Nothing left to expire.
	assert_eq!(
		orchestrator
			.expire_deadlines(Utc::now() + Duration::hours(2))
			.await,
		0
	);
}

#[tokio::test]
async fn test_concurrent_events_for_one_order_serialize() {
	let acme = shared(MockProvider::push().with_delay(std::time::Duration::from_millis(20)));
	let harness = Harness::new(config(&["acme"]).build(), &[("acme", &acme)]);

	let orchestrator = harness.engine.orchestrator().clone();
	let first = tokio::spawn({
		let orchestrator = orchestrator.clone();
		async move { orchestrator.handle_inbound(new_order("o-1", "A")).await }
	});
	tokio::time::sleep(std::time::Duration::from_millis(5)).await;
	let second = orchestrator.handle_inbound(origin_ack("o-1", 2)).await.unwrap();

	first.await.unwrap().unwrap();
	assert_eq!(second, EventOutcome::Applied);
	assert_eq!(harness.order("o-1").await.state, OrderState::InProgress);
	assert_eq!(orchestrator.leases().active(), 0);
}
