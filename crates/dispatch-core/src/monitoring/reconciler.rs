//! Polling reconciler for providers that never push updates.
//!
//! Each cycle leases the ready entries of the pending-order queue, asks each
//! provider for its status and feeds actionable statuses to the orchestrator.
//! A transient `getStatus` failure, or a status that does not move the
//! order, counts exactly like an `unknown` status, so every entry has a
//! bounded polling budget. The budget starts over only when the order
//! changes state.
//!
//! An entry is acked only after its status has been applied. If the process
//! dies in between, the lease expires and the entry is polled again.

use crate::orchestrator::{EventOutcome, Orchestrator};
use crate::state::OrderStateMachine;
use chrono::{DateTime, Duration, Utc};
use dispatch_config::{RuntimeSettings, SettingsHandle};
use dispatch_provider::ProviderService;
use dispatch_queue::QueueService;
use dispatch_types::{truncate_id, InternalEvent, Order, PendingEntry, ProviderStatus};
use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum ReconcileError {
	#[error("Queue error: {0}")]
	Queue(String),
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Orchestrator error: {0}")]
	Orchestrator(String),
}

/// Counts for one reconciler cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
	/// Entries leased this cycle.
	pub received: usize,
	/// Entries whose order is gone, settled or handed to another provider.
	pub dropped: usize,
	/// Entries put back after an unknown or unchanged status.
	pub requeued: usize,
	/// Statuses that changed their order.
	pub applied: usize,
	/// Entries that ran out of polling attempts.
	pub exhausted: usize,
	/// Entries left for redelivery after an error.
	pub errors: usize,
}

enum EntryResult {
	Dropped,
	Requeued,
	Applied,
	Exhausted,
}

pub struct PollingReconciler {
	queue: Arc<QueueService>,
	providers: Arc<ProviderService>,
	state_machine: Arc<OrderStateMachine>,
	orchestrator: Arc<Orchestrator>,
	settings: SettingsHandle,
}

impl PollingReconciler {
	pub fn new(
		queue: Arc<QueueService>,
		providers: Arc<ProviderService>,
		state_machine: Arc<OrderStateMachine>,
		orchestrator: Arc<Orchestrator>,
		settings: SettingsHandle,
	) -> Self {
		Self {
			queue,
			providers,
			state_machine,
			orchestrator,
			settings,
		}
	}

	/// Runs cycles until the task is dropped. The cadence is re-read from
	/// the settings after every cycle.
	pub async fn run(self: Arc<Self>) {
		loop {
			let interval = self.settings.load().polling.interval_seconds;
			tokio::time::sleep(std::time::Duration::from_secs(interval)).await;

			match self.run_cycle(Utc::now()).await {
				Ok(report) if report.received > 0 => {
					tracing::debug!(?report, "Reconciler cycle complete");
				},
				Ok(_) => {},
				Err(e) => tracing::error!(error = %e, "Reconciler cycle failed"),
			}
		}
	}

	/// Polls every entry ready at `now`. Entries are processed concurrently;
	/// the per-order lease serializes them against other events.
	#[instrument(skip_all)]
	pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, ReconcileError> {
		let settings = self.settings.load();
		let polling = &settings.polling;

		let entries = self
			.queue
			.receive_ready(
				now,
				polling.batch_size,
				Duration::seconds(polling.visibility_timeout_seconds as i64),
			)
			.await
			.map_err(|e| ReconcileError::Queue(e.to_string()))?;

		let mut report = CycleReport {
			received: entries.len(),
			..Default::default()
		};

		let results = join_all(
			entries
				.into_iter()
				.map(|entry| self.process(entry, &settings, now)),
		)
		.await;

		for (order_id, result) in results {
			match result {
				Ok(EntryResult::Dropped) => report.dropped += 1,
				Ok(EntryResult::Requeued) => report.requeued += 1,
				Ok(EntryResult::Applied) => report.applied += 1,
				Ok(EntryResult::Exhausted) => report.exhausted += 1,
				Err(e) => {
					report.errors += 1;
					tracing::error!(
						order_id = %truncate_id(&order_id),
						error = %e,
						"Failed to reconcile pending order"
					);
				},
			}
		}

		Ok(report)
	}

	async fn process(
		&self,
		entry: PendingEntry,
		settings: &RuntimeSettings,
		now: DateTime<Utc>,
	) -> (String, Result<EntryResult, ReconcileError>) {
		let order_id = entry.order_id.clone();
		(order_id, self.reconcile(entry, settings, now).await)
	}

	async fn reconcile(
		&self,
		entry: PendingEntry,
		settings: &RuntimeSettings,
		now: DateTime<Utc>,
	) -> Result<EntryResult, ReconcileError> {
		let order = self.load_order(&entry.order_id).await?;
		if !order.as_ref().is_some_and(|order| tracks(order, &entry)) {
			tracing::debug!(
				order_id = %truncate_id(&entry.order_id),
				provider = %entry.provider,
				"Dropping pending entry of settled or reassigned order"
			);
			self.ack(&entry.order_id).await?;
			return Ok(EntryResult::Dropped);
		}

		let status = self
			.providers
			.get_status(&entry.provider, &entry.provider_ref, &settings.retry)
			.await
			.unwrap_or_else(|e| {
				tracing::warn!(
					order_id = %truncate_id(&entry.order_id),
					provider = %entry.provider,
					error = %e,
					"Status poll failed, counting as unknown"
				);
				ProviderStatus::Unknown
			});

		if status == ProviderStatus::Unknown {
			return self.retry_later(entry, settings, now, "Status unknown, requeued").await;
		}

		let outcome = self
			.apply(InternalEvent::ProviderStatus {
				order_id: entry.order_id.clone(),
				provider: entry.provider.clone(),
				status,
			})
			.await?;

		match outcome {
			// Nothing new since the last poll: spend budget as for unknown.
			EventOutcome::Ignored => {
				self.retry_later(entry, settings, now, "Status unchanged, requeued")
					.await
			},
			EventOutcome::Discarded(reason) => {
				tracing::debug!(
					order_id = %truncate_id(&entry.order_id),
					provider = %entry.provider,
					?reason,
					"Polled status discarded"
				);
				match self.load_order(&entry.order_id).await? {
					Some(order) if tracks(&order, &entry) => {
						self.retry_later(entry, settings, now, "Status discarded, requeued")
							.await
					},
					Some(order) if order.provider_ref.as_deref() != Some(entry.provider_ref.as_str()) => {
						Ok(EntryResult::Dropped)
					},
					_ => {
						self.ack(&entry.order_id).await?;
						Ok(EntryResult::Dropped)
					},
				}
			},
			EventOutcome::Applied => {
				// A poll provider pushes nothing: keep polling until the order settles.
				match self.load_order(&entry.order_id).await? {
					Some(order) if tracks(&order, &entry) => {
						let next = now
							+ Duration::seconds(
								settings.polling.base_delay_seconds(&entry.provider) as i64,
							);
						let fresh = PendingEntry::new(
							entry.order_id,
							entry.provider,
							entry.provider_ref,
							now,
							next,
						);
						self.queue
							.enqueue(fresh)
							.await
							.map_err(|e| ReconcileError::Queue(e.to_string()))?;
					},
					Some(order) if order.provider_ref.as_deref() != Some(entry.provider_ref.as_str()) => {
						// Fell back; the orchestrator already replaced or removed the entry.
					},
					_ => self.ack(&entry.order_id).await?,
				}
				Ok(EntryResult::Applied)
			},
		}
	}

	/// Counts one poll against the entry's budget and puts it back with
	/// backoff, or raises `poll_exhausted` once the budget is spent.
	async fn retry_later(
		&self,
		mut entry: PendingEntry,
		settings: &RuntimeSettings,
		now: DateTime<Utc>,
		message: &'static str,
	) -> Result<EntryResult, ReconcileError> {
		entry.poll_attempts += 1;
		if entry.poll_attempts >= settings.polling.max_poll_attempts {
			self.ack(&entry.order_id).await?;
			self.apply(InternalEvent::PollExhausted {
				order_id: entry.order_id.clone(),
				provider: entry.provider.clone(),
			})
			.await?;
			return Ok(EntryResult::Exhausted);
		}

		let delay = settings
			.polling
			.backoff_seconds(&entry.provider, entry.poll_attempts);
		entry.next_eligible_poll_at = now + Duration::seconds(delay as i64);
		tracing::debug!(
			order_id = %truncate_id(&entry.order_id),
			provider = %entry.provider,
			poll_attempts = entry.poll_attempts,
			next_poll = %entry.next_eligible_poll_at,
			"{}",
			message
		);
		self.queue
			.requeue(entry)
			.await
			.map_err(|e| ReconcileError::Queue(e.to_string()))?;
		Ok(EntryResult::Requeued)
	}

	async fn apply(&self, event: InternalEvent) -> Result<EventOutcome, ReconcileError> {
		self.orchestrator
			.handle_internal(event)
			.await
			.map_err(|e| ReconcileError::Orchestrator(e.to_string()))
	}

	async fn load_order(&self, order_id: &str) -> Result<Option<Order>, ReconcileError> {
		self.state_machine
			.get_order(order_id)
			.await
			.map_err(|e| ReconcileError::Storage(e.to_string()))
	}

	async fn ack(&self, order_id: &str) -> Result<(), ReconcileError> {
		self.queue
			.ack(order_id)
			.await
			.map_err(|e| ReconcileError::Queue(e.to_string()))
	}
}

/// True while `order` still waits on the provider fulfillment `entry` polls.
fn tracks(order: &Order, entry: &PendingEntry) -> bool {
	!order.is_terminal()
		&& order.selected_provider.as_deref() == Some(entry.provider.as_str())
		&& order.provider_ref.as_deref() == Some(entry.provider_ref.as_str())
}
