//! Recovery of unfinished orders after a restart.
//!
//! Every order that is not settled, and every cancelled order whose provider
//! cancel never completed, is handed back to the orchestrator, which resumes
//! it under its lease and re-issues whatever action it cannot prove done.

use crate::orchestrator::Orchestrator;
use crate::state::OrderStateMachine;
use dispatch_types::truncate_id;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum RecoveryError {
	#[error("Storage error: {0}")]
	Storage(String),
}

/// What resuming one order did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
	/// Selection and dispatch continued from `NEW` or `PROVIDER_SELECTED`.
	Redispatched,
	/// An unfinished fulfillment request was re-issued with its original token.
	ReissuedFulfillment,
	/// A poll provider's order had lost its queue entry.
	Requeued,
	/// The fulfillment deadline was tracked again.
	DeadlineRearmed,
	/// An unfinished provider cancel was re-issued.
	ReissuedCancel,
	/// Nothing needed doing.
	None,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
	pub total_orders: usize,
	pub redispatched: usize,
	pub reissued_fulfillments: usize,
	pub requeued: usize,
	pub deadlines_rearmed: usize,
	pub reissued_cancels: usize,
	pub failed: usize,
}

impl RecoveryReport {
	fn record(&mut self, action: RecoveryAction) {
		match action {
			RecoveryAction::Redispatched => self.redispatched += 1,
			RecoveryAction::ReissuedFulfillment => self.reissued_fulfillments += 1,
			RecoveryAction::Requeued => self.requeued += 1,
			RecoveryAction::DeadlineRearmed => self.deadlines_rearmed += 1,
			RecoveryAction::ReissuedCancel => self.reissued_cancels += 1,
			RecoveryAction::None => {},
		}
	}
}

pub struct RecoveryService {
	state_machine: Arc<OrderStateMachine>,
	orchestrator: Arc<Orchestrator>,
}

impl RecoveryService {
	pub fn new(state_machine: Arc<OrderStateMachine>, orchestrator: Arc<Orchestrator>) -> Self {
		Self {
			state_machine,
			orchestrator,
		}
	}

	/// Resumes every unfinished order. A failure on one order is logged and
	/// does not stop the others.
	#[instrument(skip_all)]
	pub async fn recover(&self) -> Result<RecoveryReport, RecoveryError> {
		tracing::info!("Starting order recovery from storage");

		let orders = self
			.state_machine
			.load_unfinished()
			.await
			.map_err(|e| RecoveryError::Storage(e.to_string()))?;

		let mut report = RecoveryReport {
			total_orders: orders.len(),
			..Default::default()
		};
		if orders.is_empty() {
			tracing::info!("No unfinished orders to recover");
			return Ok(report);
		}

		for order in orders {
			match self.orchestrator.resume(&order.order_id).await {
				Ok(action) => report.record(action),
				Err(e) => {
					report.failed += 1;
					tracing::warn!(
						order_id = %truncate_id(&order.order_id),
						error = %e,
						"Failed to recover order"
					);
				},
			}
		}

		tracing::info!(
			total = report.total_orders,
			redispatched = report.redispatched,
			reissued_fulfillments = report.reissued_fulfillments,
			requeued = report.requeued,
			deadlines_rearmed = report.deadlines_rearmed,
			reissued_cancels = report.reissued_cancels,
			failed = report.failed,
			"Recovery complete"
		);
		Ok(report)
	}
}
