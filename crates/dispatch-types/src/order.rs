//! Order types for the dispatch system.
//!
//! This module defines the order record owned by the orchestrator, its
//! lifecycle states and the append-only audit history recorded for every
//! transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
	pub lat: f64,
	pub long: f64,
}

impl GeoPoint {
	pub fn new(lat: f64, long: f64) -> Self {
		Self { lat, long }
	}
}

/// Lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
	/// Order has been created and no provider has been chosen yet.
	New,
	/// A provider has been chosen and appended to the attempted set.
	ProviderSelected,
	/// The fulfillment request has been issued to the selected provider.
	FulfillmentRequested,
	/// The selected provider accepted the order.
	Accepted,
	/// Persisted vocabulary only. Rejections are recorded as history reasons
	/// and the order moves straight back to provider selection.
	Rejected,
	/// The delivery is under way.
	InProgress,
	/// Terminal: the order was delivered.
	Delivered,
	/// Terminal: the order was cancelled on request.
	Cancelled,
	/// Terminal: the order could not be fulfilled.
	Failed,
}

impl OrderState {
	/// Returns true for states that freeze the order.
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			OrderState::Delivered | OrderState::Cancelled | OrderState::Failed
		)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			OrderState::New => "NEW",
			OrderState::ProviderSelected => "PROVIDER_SELECTED",
			OrderState::FulfillmentRequested => "FULFILLMENT_REQUESTED",
			OrderState::Accepted => "ACCEPTED",
			OrderState::Rejected => "REJECTED",
			OrderState::InProgress => "IN_PROGRESS",
			OrderState::Delivered => "DELIVERED",
			OrderState::Cancelled => "CANCELLED",
			OrderState::Failed => "FAILED",
		}
	}
}

impl fmt::Display for OrderState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Reasons that end an order in `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
	/// The rule engine produced no eligible candidate.
	NoProviderAvailable,
	/// The fallback depth was exhausted.
	ProvidersExhausted,
	/// The polling budget for the pending entry was exhausted.
	PollExhausted,
}

impl FailureReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			FailureReason::NoProviderAvailable => "no_provider_available",
			FailureReason::ProvidersExhausted => "providers_exhausted",
			FailureReason::PollExhausted => "poll_exhausted",
		}
	}
}

impl fmt::Display for FailureReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One entry of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
	pub state: OrderState,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub provider: Option<String>,
	pub timestamp: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

/// External action recorded before it is issued.
///
/// Cleared once the call is known to have completed. Recovery re-issues any
/// action still present on a persisted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PendingAction {
	/// `requestFulfillment` against `provider` for the given attempt number.
	RequestFulfillment { provider: String, attempt: u32 },
	/// `cancel` against `provider`.
	Cancel {
		provider: String,
		provider_ref: Option<String>,
	},
}

/// Order payload carried by a `NEW_ORDER` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
	pub origin_id: String,
	pub destination_id: String,
	pub pickup_location: GeoPoint,
	pub dropoff_location: GeoPoint,
	/// Explicit area; derived from the pickup location when absent.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub demographic_area: Option<String>,
}

/// The order record persisted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
	pub order_id: String,
	pub origin_id: String,
	pub destination_id: String,
	pub pickup_location: GeoPoint,
	pub dropoff_location: GeoPoint,
	pub demographic_area: String,
	pub state: OrderState,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub selected_provider: Option<String>,
	/// Ordered and append-only. Never contains duplicates.
	#[serde(default)]
	pub attempted_providers: Vec<String>,
	/// Provider-side reference returned by `requestFulfillment`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub provider_ref: Option<String>,
	#[serde(default)]
	pub retry_count: u32,
	/// Highest inbound sequence number applied so far.
	#[serde(default)]
	pub last_sequence: u64,
	/// Set when the origin acknowledged before the provider accepted.
	#[serde(default)]
	pub origin_acknowledged: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub fulfillment_deadline: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pending_action: Option<PendingAction>,
	pub created_at: DateTime<Utc>,
	pub last_updated_at: DateTime<Utc>,
	#[serde(default)]
	pub history: Vec<HistoryEntry>,
}

impl Order {
	/// Builds a fresh order in `NEW` with its creation recorded in the history.
	pub fn new(
		order_id: impl Into<String>,
		request: NewOrder,
		demographic_area: impl Into<String>,
		sequence: u64,
		now: DateTime<Utc>,
	) -> Self {
		Self {
			order_id: order_id.into(),
			origin_id: request.origin_id,
			destination_id: request.destination_id,
			pickup_location: request.pickup_location,
			dropoff_location: request.dropoff_location,
			demographic_area: demographic_area.into(),
			state: OrderState::New,
			selected_provider: None,
			attempted_providers: Vec::new(),
			provider_ref: None,
			retry_count: 0,
			last_sequence: sequence,
			origin_acknowledged: false,
			fulfillment_deadline: None,
			pending_action: None,
			created_at: now,
			last_updated_at: now,
			history: vec![HistoryEntry {
				state: OrderState::New,
				provider: None,
				timestamp: now,
				reason: Some("order_created".into()),
			}],
		}
	}

	pub fn is_terminal(&self) -> bool {
		self.state.is_terminal()
	}

	/// True while the order waits for `provider` to accept or reject.
	pub fn is_awaiting(&self, provider: &str) -> bool {
		self.state == OrderState::FulfillmentRequested
			&& self.selected_provider.as_deref() == Some(provider)
	}

	/// Number of the current fulfillment attempt (1-based).
	pub fn attempt(&self) -> u32 {
		self.attempted_providers.len() as u32
	}
}
