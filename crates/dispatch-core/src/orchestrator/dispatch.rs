//! Provider selection, fulfillment requests and re-driving persisted orders.

use super::{Orchestrator, OrchestratorError};
use crate::recovery::RecoveryAction;
use chrono::{DateTime, Duration, Utc};
use dispatch_config::RuntimeSettings;
use dispatch_rules::{select_fallback, select_providers};
use dispatch_types::{
	truncate_id, FailureReason, FulfillmentOutcome, IdempotencyToken, Order, OrderState,
	OrderStateChanged, PendingAction, PendingEntry, ProviderKind,
};
use tracing::instrument;

impl Orchestrator {
	/// Selects a provider and requests fulfillment, moving on to the next
	/// candidate until one takes the order or the order fails.
	///
	/// An order already in `PROVIDER_SELECTED` is dispatched to its selected
	/// provider first.
	pub(super) async fn dispatch(
		&self,
		order: &mut Order,
		settings: &RuntimeSettings,
		now: DateTime<Utc>,
		mut reason: Option<String>,
		changes: &mut Vec<OrderStateChanged>,
	) -> Result<(), OrchestratorError> {
		loop {
			if order.state != OrderState::ProviderSelected
				&& !self.select(order, settings, now, reason.take(), changes).await?
			{
				return Ok(());
			}

			self.prepare_request(order, settings, now, changes).await?;
			match self.issue_request(order, settings, now, changes).await? {
				None => return Ok(()),
				Some(next) => reason = Some(next),
			}
		}
	}

	/// Moves the order to `PROVIDER_SELECTED` with the best remaining
	/// candidate. Returns false when the order failed instead.
	async fn select(
		&self,
		order: &mut Order,
		settings: &RuntimeSettings,
		now: DateTime<Utc>,
		reason: Option<String>,
		changes: &mut Vec<OrderStateChanged>,
	) -> Result<bool, OrchestratorError> {
		let depth = settings.lifecycle.max_fallback_depth;
		if order.attempted_providers.len() >= depth {
			tracing::warn!(depth, "Fallback depth exhausted");
			self.fail(order, FailureReason::ProvidersExhausted, now, changes)
				.await?;
			return Ok(false);
		}

		let candidates = if order.attempted_providers.is_empty() {
			select_providers(order, &settings.rules, now)
		} else {
			select_fallback(order, &settings.rules, now)
		};

		let provider = match candidates.map(|list| list.into_iter().next()) {
			Ok(Some(provider)) => provider,
			Ok(None) | Err(_) => {
				let failure = if order.attempted_providers.is_empty() {
					FailureReason::NoProviderAvailable
				} else {
					FailureReason::ProvidersExhausted
				};
				tracing::warn!(
					area = %order.demographic_area,
					reason = %failure,
					"No eligible provider"
				);
				self.fail(order, failure, now, changes).await?;
				return Ok(false);
			},
		};

		order.attempted_providers.push(provider.clone());
		order.selected_provider = Some(provider);
		order.retry_count = order.attempted_providers.len().saturating_sub(1) as u32;

		let change = self.state_machine.transition(
			order,
			OrderState::ProviderSelected,
			reason,
			now,
		)?;
		tracing::info!(
			provider = order.selected_provider.as_deref().unwrap_or("-"),
			attempt = order.attempt(),
			"Provider selected"
		);
		changes.push(change);
		Ok(true)
	}

	/// Records the request and its deadline, then persists the order so the
	/// request can be re-issued after a crash.
	async fn prepare_request(
		&self,
		order: &mut Order,
		settings: &RuntimeSettings,
		now: DateTime<Utc>,
		changes: &mut Vec<OrderStateChanged>,
	) -> Result<(), OrchestratorError> {
		let provider = order
			.selected_provider
			.clone()
			.ok_or_else(|| OrchestratorError::State("No provider selected".into()))?;

		order.pending_action = Some(PendingAction::RequestFulfillment {
			provider,
			attempt: order.attempt(),
		});
		order.fulfillment_deadline = Some(
			now + Duration::seconds(settings.lifecycle.fulfillment_timeout_seconds as i64),
		);
		self.move_to(
			order,
			OrderState::FulfillmentRequested,
			"fulfillment_requested",
			now,
			changes,
		)?;
		self.commit(order, changes).await
	}

	/// Calls the provider for the recorded request. Returns the reason to
	/// fall back with when the provider did not take the order.
	pub(super) async fn issue_request(
		&self,
		order: &mut Order,
		settings: &RuntimeSettings,
		now: DateTime<Utc>,
		changes: &mut Vec<OrderStateChanged>,
	) -> Result<Option<String>, OrchestratorError> {
		let Some(PendingAction::RequestFulfillment { provider, attempt }) =
			order.pending_action.clone()
		else {
			return Err(OrchestratorError::State(
				"No fulfillment request recorded".into(),
			));
		};

		let token = IdempotencyToken::new(&order.order_id, attempt);
		let result = self
			.providers
			.request_fulfillment(&provider, order, &token, &settings.retry)
			.await;
		order.pending_action = None;

		let response = match result {
			Ok(response) => response,
			Err(e) => {
				tracing::warn!(provider = %provider, error = %e, "Fulfillment request failed");
				let reason = if e.is_transient() {
					"provider_unreachable"
				} else {
					"provider_rejected"
				};
				return Ok(Some(reason.to_string()));
			},
		};

		order.provider_ref = response.provider_ref;
		match response.outcome {
			FulfillmentOutcome::Accepted => {
				self.clear_deadline(order);
				self.move_to(order, OrderState::Accepted, "provider_accepted", now, changes)?;
				if order.origin_acknowledged {
					self.move_to(order, OrderState::InProgress, "origin_acknowledged", now, changes)?;
				}
				Ok(None)
			},
			FulfillmentOutcome::Rejected { reason } => {
				tracing::info!(provider = %provider, reason = %reason, "Provider declined order");
				order.provider_ref = None;
				Ok(Some(format!("provider_rejected: {}", reason)))
			},
			FulfillmentOutcome::Pending => {
				let Some(provider_ref) = order.provider_ref.clone() else {
					tracing::warn!(provider = %provider, "Acknowledgement without provider reference");
					return Ok(Some("provider_invalid_response".to_string()));
				};

				let first_poll =
					now + Duration::seconds(settings.polling.base_delay_seconds(&provider) as i64);
				self.queue
					.enqueue(PendingEntry::new(
						&order.order_id,
						&provider,
						provider_ref,
						now,
						first_poll,
					))
					.await
					.map_err(|e| OrchestratorError::Queue(e.to_string()))?;

				if let Some(deadline) = order.fulfillment_deadline {
					self.deadlines
						.track(&order.order_id, &provider, attempt, deadline);
				}
				Ok(None)
			},
		}
	}

	/// Continues a persisted order from wherever it stopped, re-issuing any
	/// external action not known to have completed.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn resume(&self, order_id: &str) -> Result<RecoveryAction, OrchestratorError> {
		let _lease = self.leases.acquire(order_id).await;
		let settings = self.settings.load();
		let now = Utc::now();

		let Some(mut order) = self.state_machine.get_order(order_id).await? else {
			return Ok(RecoveryAction::None);
		};

		let mut changes = Vec::new();
		let action = match (order.state, order.pending_action.clone()) {
			(OrderState::Cancelled, Some(PendingAction::Cancel { .. })) => {
				self.queue
					.ack(order_id)
					.await
					.map_err(|e| OrchestratorError::Queue(e.to_string()))?;
				self.finish_cancel(&mut order, &settings).await?;
				RecoveryAction::ReissuedCancel
			},
			_ if order.is_terminal() => RecoveryAction::None,
			(OrderState::New | OrderState::ProviderSelected, _) => {
				self.dispatch(
					&mut order,
					&settings,
					now,
					Some("recovered".to_string()),
					&mut changes,
				)
				.await?;
				RecoveryAction::Redispatched
			},
			(OrderState::FulfillmentRequested, Some(PendingAction::RequestFulfillment { .. })) => {
				tracing::info!("Re-issuing unfinished fulfillment request");
				if let Some(reason) = self
					.issue_request(&mut order, &settings, now, &mut changes)
					.await?
				{
					self.dispatch(&mut order, &settings, now, Some(reason), &mut changes)
						.await?;
				}
				RecoveryAction::ReissuedFulfillment
			},
			_ => self.rearm(&order, now).await?,
		};

		self.commit(&order, &mut changes).await?;
		Ok(action)
	}

	/// Restores in-memory tracking for an order waiting on its provider.
	async fn rearm(
		&self,
		order: &Order,
		now: DateTime<Utc>,
	) -> Result<RecoveryAction, OrchestratorError> {
		let Some(provider) = order.selected_provider.as_deref() else {
			return Ok(RecoveryAction::None);
		};

		let mut action = RecoveryAction::None;
		if order.state == OrderState::FulfillmentRequested {
			if let Some(deadline) = order.fulfillment_deadline {
				self.deadlines
					.track(&order.order_id, provider, order.attempt(), deadline);
				action = RecoveryAction::DeadlineRearmed;
			}
		}

		let polled = matches!(self.providers.kind(provider), Ok(ProviderKind::Poll));
		if let (true, Some(provider_ref)) = (polled, order.provider_ref.as_deref()) {
			let queued = self
				.queue
				.contains(&order.order_id)
				.await
				.map_err(|e| OrchestratorError::Queue(e.to_string()))?;
			if !queued {
				self.queue
					.enqueue(PendingEntry::new(
						&order.order_id,
						provider,
						provider_ref,
						now,
						now,
					))
					.await
					.map_err(|e| OrchestratorError::Queue(e.to_string()))?;
				action = RecoveryAction::Requeued;
			}
		}

		Ok(action)
	}
}
