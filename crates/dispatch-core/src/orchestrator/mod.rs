//! Order lifecycle orchestrator.
//!
//! Every event is applied under the order's lease, against one runtime
//! settings snapshot. State changes are appended to the order history and
//! persisted before any provider is called, then published on the event bus.
//!
//! Inbound events carry a per-order sequence number; anything not newer
//! than the last applied number is discarded as stale. Internal events
//! (polled statuses, timeouts) carry none and are instead checked against
//! the provider, and attempt, the order currently waits on.

mod dispatch;

use crate::engine::event_bus::EventBus;
use crate::lease::LeaseManager;
use crate::monitoring::DeadlineTracker;
use crate::state::{OrderStateError, OrderStateMachine};
use chrono::{DateTime, Utc};
use dispatch_config::{RuntimeSettings, SettingsHandle};
use dispatch_provider::ProviderService;
use dispatch_queue::QueueService;
use dispatch_types::{
	truncate_id, DiscardReason, DispatchEvent, FailureReason, IdempotencyToken, InboundEvent,
	InboundPayload, InternalEvent, NewOrder, Order, OrderState, OrderStateChanged, PendingAction,
	ProviderStatus,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum OrchestratorError {
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Queue error: {0}")]
	Queue(String),
	#[error("State error: {0}")]
	State(String),
}

impl From<OrderStateError> for OrchestratorError {
	fn from(err: OrderStateError) -> Self {
		match err {
			OrderStateError::Storage(msg) => OrchestratorError::Storage(msg),
			other => OrchestratorError::State(other.to_string()),
		}
	}
}

/// What applying an event did to its order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
	/// The order changed.
	Applied,
	/// The event was already reflected in the order; nothing changed.
	Ignored,
	/// The event was dropped without changing the order's state.
	Discarded(DiscardReason),
}

pub struct Orchestrator {
	state_machine: Arc<OrderStateMachine>,
	providers: Arc<ProviderService>,
	queue: Arc<QueueService>,
	settings: SettingsHandle,
	leases: LeaseManager,
	deadlines: Arc<DeadlineTracker>,
	event_bus: EventBus,
}

impl Orchestrator {
	pub fn new(
		state_machine: Arc<OrderStateMachine>,
		providers: Arc<ProviderService>,
		queue: Arc<QueueService>,
		settings: SettingsHandle,
		deadlines: Arc<DeadlineTracker>,
		event_bus: EventBus,
	) -> Self {
		Self {
			state_machine,
			providers,
			queue,
			settings,
			leases: LeaseManager::new(),
			deadlines,
			event_bus,
		}
	}

	pub fn leases(&self) -> &LeaseManager {
		&self.leases
	}

	pub async fn get_order(&self, order_id: &str) -> Result<Option<Order>, OrchestratorError> {
		Ok(self.state_machine.get_order(order_id).await?)
	}

	/// Applies an event delivered by the event router.
	#[instrument(skip_all, fields(
		order_id = %truncate_id(&event.order_id),
		sequence = event.sequence,
		kind = event.payload.kind(),
	))]
	pub async fn handle_inbound(&self, event: InboundEvent) -> Result<EventOutcome, OrchestratorError> {
		let _lease = self.leases.acquire(&event.order_id).await;
		let settings = self.settings.load();
		let now = Utc::now();

		let InboundEvent {
			order_id,
			sequence,
			payload,
		} = event;

		let Some(mut order) = self.state_machine.get_order(&order_id).await? else {
			return match payload {
				InboundPayload::NewOrder { order: request } => {
					self.create(order_id, sequence, request, &settings, now).await
				},
				_ => Ok(self.report(&order_id, Some(sequence), DiscardReason::UnknownOrder)),
			};
		};

		if sequence <= order.last_sequence {
			return Ok(self.report(&order_id, Some(sequence), DiscardReason::Stale));
		}
		order.last_sequence = sequence;

		let mut changes = Vec::new();
		let outcome = match payload {
			InboundPayload::NewOrder { .. } => EventOutcome::Discarded(DiscardReason::InvalidTransition),
			InboundPayload::OriginOrderAck => self.apply_origin_ack(&mut order, now, &mut changes)?,
			InboundPayload::OrderUpdate {
				provider,
				provider_status,
			} => {
				self.apply_provider_status(
					&mut order,
					provider.as_deref(),
					provider_status,
					&settings,
					now,
					&mut changes,
				)
				.await?
			},
			InboundPayload::CancelOrder => {
				self.apply_cancel(&mut order, &settings, now, &mut changes)
					.await?
			},
		};

		// The sequence number advances even when the event changes nothing.
		self.commit(&order, &mut changes).await?;

		Ok(match outcome {
			EventOutcome::Discarded(reason) => self.report(&order_id, Some(sequence), reason),
			other => other,
		})
	}

	/// Applies an event produced by the reconciler or the deadline sweeper.
	#[instrument(skip_all, fields(order_id = %truncate_id(event.order_id())))]
	pub async fn handle_internal(
		&self,
		event: InternalEvent,
	) -> Result<EventOutcome, OrchestratorError> {
		let order_id = event.order_id().to_string();
		let _lease = self.leases.acquire(&order_id).await;
		let settings = self.settings.load();
		let now = Utc::now();

		let Some(mut order) = self.state_machine.get_order(&order_id).await? else {
			return Ok(self.report(&order_id, None, DiscardReason::UnknownOrder));
		};

		let mut changes = Vec::new();
		let outcome = match event {
			InternalEvent::ProviderStatus {
				provider, status, ..
			} => {
				self.apply_provider_status(
					&mut order,
					Some(&provider),
					status,
					&settings,
					now,
					&mut changes,
				)
				.await?
			},
			InternalEvent::PollExhausted { provider, .. } => {
				if order.is_terminal() || order.selected_provider.as_deref() != Some(&provider) {
					EventOutcome::Discarded(DiscardReason::Stale)
				} else {
					tracing::warn!(provider = %provider, "Polling budget exhausted");
					self.fail(&mut order, FailureReason::PollExhausted, now, &mut changes)
						.await?;
					EventOutcome::Applied
				}
			},
			InternalEvent::FulfillmentTimeout {
				provider, attempt, ..
			} => {
				if !order.is_awaiting(&provider) || order.attempt() != attempt {
					EventOutcome::Discarded(DiscardReason::Stale)
				} else {
					self.time_out(&mut order, &settings, now, &mut changes)
						.await?;
					EventOutcome::Applied
				}
			},
		};

		match outcome {
			EventOutcome::Applied => {
				self.commit(&order, &mut changes).await?;
				Ok(outcome)
			},
			EventOutcome::Discarded(reason) => Ok(self.report(&order_id, None, reason)),
			EventOutcome::Ignored => Ok(outcome),
		}
	}

	/// Applies a timeout for every fulfillment deadline at or before `now`.
	/// Returns the number of orders that fell back.
	pub async fn expire_deadlines(&self, now: DateTime<Utc>) -> usize {
		let mut expired = 0;
		for event in self.deadlines.take_expired(now) {
			let order_id = event.order_id().to_string();
			match self.handle_internal(event).await {
				Ok(EventOutcome::Applied) => expired += 1,
				Ok(_) => {},
				Err(e) => {
					tracing::error!(
						order_id = %truncate_id(&order_id),
						error = %e,
						"Failed to apply fulfillment timeout"
					);
				},
			}
		}
		expired
	}

	async fn create(
		&self,
		order_id: String,
		sequence: u64,
		request: NewOrder,
		settings: &RuntimeSettings,
		now: DateTime<Utc>,
	) -> Result<EventOutcome, OrchestratorError> {
		let area = dispatch_rules::area_for(&request, &settings.areas);
		let mut order = Order::new(order_id, request, area, sequence, now);
		tracing::info!(area = %order.demographic_area, "Order created");
		self.state_machine.save(&order).await?;

		let mut changes = Vec::new();
		self.dispatch(&mut order, settings, now, None, &mut changes)
			.await?;
		self.commit(&order, &mut changes).await?;
		Ok(EventOutcome::Applied)
	}

	fn apply_origin_ack(
		&self,
		order: &mut Order,
		now: DateTime<Utc>,
		changes: &mut Vec<OrderStateChanged>,
	) -> Result<EventOutcome, OrchestratorError> {
		match order.state {
			OrderState::Accepted => {
				self.move_to(order, OrderState::InProgress, "origin_acknowledged", now, changes)?;
				Ok(EventOutcome::Applied)
			},
			// Remembered until the provider accepts.
			OrderState::New | OrderState::ProviderSelected | OrderState::FulfillmentRequested
				if !order.origin_acknowledged =>
			{
				order.origin_acknowledged = true;
				order.last_updated_at = now;
				Ok(EventOutcome::Applied)
			},
			_ => Ok(EventOutcome::Ignored),
		}
	}

	async fn apply_provider_status(
		&self,
		order: &mut Order,
		provider: Option<&str>,
		status: ProviderStatus,
		settings: &RuntimeSettings,
		now: DateTime<Utc>,
		changes: &mut Vec<OrderStateChanged>,
	) -> Result<EventOutcome, OrchestratorError> {
		use OrderState as O;
		use ProviderStatus as S;

		if order.is_terminal() {
			return Ok(EventOutcome::Discarded(DiscardReason::InvalidTransition));
		}
		if let Some(provider) = provider {
			if order.selected_provider.as_deref() != Some(provider) {
				return Ok(EventOutcome::Discarded(DiscardReason::ProviderMismatch));
			}
		}

		let path: &[OrderState] = match (order.state, status) {
			(_, S::Unknown) => return Ok(EventOutcome::Ignored),
			(O::FulfillmentRequested | O::Accepted | O::InProgress, S::Rejected | S::Failed) => {
				let reason = format!("provider_{}", status);
				self.fall_back(order, settings, now, reason, changes).await?;
				return Ok(EventOutcome::Applied);
			},
			(O::FulfillmentRequested, S::Accepted) => &[O::Accepted],
			(O::FulfillmentRequested, S::InProgress) => &[O::Accepted, O::InProgress],
			(O::FulfillmentRequested, S::Delivered) => &[O::Accepted, O::InProgress, O::Delivered],
			(O::Accepted, S::InProgress) => &[O::InProgress],
			(O::Accepted, S::Delivered) => &[O::InProgress, O::Delivered],
			(O::InProgress, S::Delivered) => &[O::Delivered],
			(O::Accepted, S::Accepted) | (O::InProgress, S::Accepted | S::InProgress) => {
				return Ok(EventOutcome::Ignored);
			},
			_ => return Ok(EventOutcome::Discarded(DiscardReason::InvalidTransition)),
		};

		if order.state == O::FulfillmentRequested {
			self.clear_deadline(order);
		}

		let reason = format!("provider_{}", status);
		let Some((last, implied)) = path.split_last() else {
			return Ok(EventOutcome::Ignored);
		};
		for state in implied {
			self.move_to(order, *state, "implied_by_provider_update", now, changes)?;
		}
		self.move_to(order, *last, &reason, now, changes)?;

		if order.state == O::Accepted && order.origin_acknowledged {
			self.move_to(order, O::InProgress, "origin_acknowledged", now, changes)?;
		}
		Ok(EventOutcome::Applied)
	}

	async fn apply_cancel(
		&self,
		order: &mut Order,
		settings: &RuntimeSettings,
		now: DateTime<Utc>,
		changes: &mut Vec<OrderStateChanged>,
	) -> Result<EventOutcome, OrchestratorError> {
		if order.is_terminal() {
			tracing::debug!(state = %order.state, "Cancel for settled order ignored");
			return Ok(EventOutcome::Ignored);
		}

		self.clear_deadline(order);
		order.pending_action = order
			.selected_provider
			.clone()
			.map(|provider| PendingAction::Cancel {
				provider,
				provider_ref: order.provider_ref.clone(),
			});
		self.move_to(order, OrderState::Cancelled, "cancel_requested", now, changes)?;
		self.commit(order, changes).await?;

		self.queue
			.ack(&order.order_id)
			.await
			.map_err(|e| OrchestratorError::Queue(e.to_string()))?;
		self.finish_cancel(order, settings).await?;
		Ok(EventOutcome::Applied)
	}

	/// Issues the recorded cancel, if any. A failed call leaves the action in
	/// place for recovery.
	pub(crate) async fn finish_cancel(
		&self,
		order: &mut Order,
		settings: &RuntimeSettings,
	) -> Result<(), OrchestratorError> {
		let Some(PendingAction::Cancel {
			provider,
			provider_ref,
		}) = order.pending_action.clone()
		else {
			return Ok(());
		};

		if let Some(provider_ref) = provider_ref {
			let token = IdempotencyToken::new(&order.order_id, order.attempt());
			if let Err(e) = self
				.providers
				.cancel(&provider, &provider_ref, &token, &settings.retry)
				.await
			{
				tracing::warn!(provider = %provider, error = %e, "Provider cancel failed");
				return Ok(());
			}
			tracing::info!(provider = %provider, "Provider cancelled fulfillment");
		}

		order.pending_action = None;
		self.state_machine.save(order).await?;
		Ok(())
	}

	/// The provider stayed silent past the deadline: withdraw the request
	/// and fall back.
	async fn time_out(
		&self,
		order: &mut Order,
		settings: &RuntimeSettings,
		now: DateTime<Utc>,
		changes: &mut Vec<OrderStateChanged>,
	) -> Result<(), OrchestratorError> {
		if let (Some(provider), Some(provider_ref)) =
			(order.selected_provider.clone(), order.provider_ref.clone())
		{
			tracing::warn!(provider = %provider, "Fulfillment deadline elapsed");
			let token = IdempotencyToken::new(&order.order_id, order.attempt());
			if let Err(e) = self
				.providers
				.cancel(&provider, &provider_ref, &token, &settings.retry)
				.await
			{
				tracing::warn!(provider = %provider, error = %e, "Withdrawing timed out request failed");
			}
		}
		self.fall_back(order, settings, now, "fulfillment_timeout".to_string(), changes)
			.await
	}

	async fn fall_back(
		&self,
		order: &mut Order,
		settings: &RuntimeSettings,
		now: DateTime<Utc>,
		reason: String,
		changes: &mut Vec<OrderStateChanged>,
	) -> Result<(), OrchestratorError> {
		self.clear_deadline(order);
		self.queue
			.ack(&order.order_id)
			.await
			.map_err(|e| OrchestratorError::Queue(e.to_string()))?;
		order.provider_ref = None;
		self.dispatch(order, settings, now, Some(reason), changes)
			.await
	}

	async fn fail(
		&self,
		order: &mut Order,
		reason: FailureReason,
		now: DateTime<Utc>,
		changes: &mut Vec<OrderStateChanged>,
	) -> Result<(), OrchestratorError> {
		self.clear_deadline(order);
		self.queue
			.ack(&order.order_id)
			.await
			.map_err(|e| OrchestratorError::Queue(e.to_string()))?;
		self.move_to(order, OrderState::Failed, reason.as_str(), now, changes)
	}

	fn clear_deadline(&self, order: &mut Order) {
		order.fulfillment_deadline = None;
		self.deadlines.clear(&order.order_id);
	}

	fn move_to(
		&self,
		order: &mut Order,
		to: OrderState,
		reason: &str,
		now: DateTime<Utc>,
		changes: &mut Vec<OrderStateChanged>,
	) -> Result<(), OrchestratorError> {
		let change = self
			.state_machine
			.transition(order, to, Some(reason.to_string()), now)?;
		tracing::info!(
			from = %change.old_state,
			to = %change.new_state,
			provider = change.provider.as_deref().unwrap_or("-"),
			reason = %reason,
			"Order state changed"
		);
		changes.push(change);
		Ok(())
	}

	/// Persists the order, then publishes the accumulated state changes.
	async fn commit(
		&self,
		order: &Order,
		changes: &mut Vec<OrderStateChanged>,
	) -> Result<(), OrchestratorError> {
		self.state_machine.save(order).await?;
		for change in changes.drain(..) {
			self.event_bus.publish(DispatchEvent::StateChanged(change));
		}
		Ok(())
	}

	fn report(&self, order_id: &str, sequence: Option<u64>, reason: DiscardReason) -> EventOutcome {
		match reason {
			DiscardReason::InvalidTransition | DiscardReason::ProviderMismatch => {
				tracing::warn!(?reason, "Discarding event")
			},
			DiscardReason::Stale | DiscardReason::UnknownOrder => {
				tracing::debug!(?reason, "Discarding event")
			},
		}
		self.event_bus.publish(DispatchEvent::Discarded {
			order_id: order_id.to_string(),
			sequence,
			reason,
		});
		EventOutcome::Discarded(reason)
	}
}
