//! Order state machine implementation.
//!
//! Validates transitions against the lifecycle table, appends the audit
//! history and persists order records. Terminal states have no outgoing
//! transitions.

use chrono::{DateTime, Utc};
use dispatch_storage::StorageService;
use dispatch_types::{HistoryEntry, Order, OrderState, OrderStateChanged, StorageKey};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrderStateError {
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Invalid state transition from {from} to {to}")]
	InvalidTransition { from: OrderState, to: OrderState },
}

static TRANSITIONS: Lazy<HashMap<OrderState, HashSet<OrderState>>> = Lazy::new(|| {
	use OrderState::*;

	let mut m = HashMap::new();
	m.insert(New, HashSet::from([ProviderSelected, Failed, Cancelled]));
	m.insert(
		ProviderSelected,
		HashSet::from([FulfillmentRequested, Failed, Cancelled]),
	);
	m.insert(
		FulfillmentRequested,
		HashSet::from([Accepted, ProviderSelected, Failed, Cancelled]),
	);
	m.insert(
		Accepted,
		HashSet::from([InProgress, ProviderSelected, Failed, Cancelled]),
	);
	m.insert(
		InProgress,
		HashSet::from([Delivered, ProviderSelected, Failed, Cancelled]),
	);
	// Rejections go straight back to provider selection.
	m.insert(Rejected, HashSet::new());
	m.insert(Delivered, HashSet::new());
	m.insert(Cancelled, HashSet::new());
	m.insert(Failed, HashSet::new());
	m
});

/// Checks if a state transition is valid.
pub fn is_valid_transition(from: OrderState, to: OrderState) -> bool {
	TRANSITIONS
		.get(&from)
		.is_some_and(|allowed| allowed.contains(&to))
}

/// Manages order state transitions and persistence.
pub struct OrderStateMachine {
	storage: Arc<StorageService>,
}

impl OrderStateMachine {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	/// Moves `order` to `to`, appending a history entry. Nothing is persisted.
	pub fn transition(
		&self,
		order: &mut Order,
		to: OrderState,
		reason: Option<String>,
		now: DateTime<Utc>,
	) -> Result<OrderStateChanged, OrderStateError> {
		let from = order.state;
		if !is_valid_transition(from, to) {
			return Err(OrderStateError::InvalidTransition { from, to });
		}

		order.state = to;
		order.last_updated_at = now;
		order.history.push(HistoryEntry {
			state: to,
			provider: order.selected_provider.clone(),
			timestamp: now,
			reason: reason.clone(),
		});

		Ok(OrderStateChanged {
			order_id: order.order_id.clone(),
			old_state: from,
			new_state: to,
			provider: order.selected_provider.clone(),
			timestamp: now,
			reason,
		})
	}

	pub async fn get_order(&self, order_id: &str) -> Result<Option<Order>, OrderStateError> {
		self.storage
			.find(StorageKey::Orders.as_str(), order_id)
			.await
			.map_err(|e| OrderStateError::Storage(e.to_string()))
	}

	/// Persists the full order record.
	pub async fn save(&self, order: &Order) -> Result<(), OrderStateError> {
		self.storage
			.store(StorageKey::Orders.as_str(), &order.order_id, order)
			.await
			.map_err(|e| OrderStateError::Storage(e.to_string()))
	}

	/// Orders that are not terminal, plus terminal orders with an unfinished
	/// external action.
	pub async fn load_unfinished(&self) -> Result<Vec<Order>, OrderStateError> {
		let orders: Vec<(String, Order)> = self
			.storage
			.retrieve_all(StorageKey::Orders.as_str())
			.await
			.map_err(|e| OrderStateError::Storage(e.to_string()))?;

		Ok(orders
			.into_iter()
			.map(|(_, order)| order)
			.filter(|order| !order.is_terminal() || order.pending_action.is_some())
			.collect())
	}
}
