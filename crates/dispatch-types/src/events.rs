//! Event types for the dispatcher.
//!
//! Inbound events arrive from the event router (order service, origin,
//! provider webhooks) and carry a per-order sequence number. Internal events
//! are produced inside the process by the reconciler and the deadline
//! sweeper. Outbound events announce every lifecycle state change.

use crate::{NewOrder, OrderState, ProviderStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event delivered by the event router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
	pub order_id: String,
	/// Monotonic per-order sequence number assigned by the producer.
	pub sequence: u64,
	#[serde(flatten)]
	pub payload: InboundPayload,
}

/// Typed inbound payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundPayload {
	NewOrder {
		order: NewOrder,
	},
	OriginOrderAck,
	OrderUpdate {
		/// Provider that produced the update, when known.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		provider: Option<String>,
		#[serde(rename = "providerStatus")]
		provider_status: ProviderStatus,
	},
	CancelOrder,
}

impl InboundPayload {
	pub fn kind(&self) -> &'static str {
		match self {
			InboundPayload::NewOrder { .. } => "NEW_ORDER",
			InboundPayload::OriginOrderAck => "ORIGIN_ORDER_ACK",
			InboundPayload::OrderUpdate { .. } => "ORDER_UPDATE",
			InboundPayload::CancelOrder => "CANCEL_ORDER",
		}
	}
}

/// Events produced inside the dispatcher.
///
/// They carry no sequence number. Staleness is decided by checking that the
/// order still waits on the same provider (and attempt, for timeouts).
#[derive(Debug, Clone, PartialEq)]
pub enum InternalEvent {
	/// Mapped status obtained by polling a provider.
	ProviderStatus {
		order_id: String,
		provider: String,
		status: ProviderStatus,
	},
	/// The pending entry ran out of poll attempts.
	PollExhausted { order_id: String, provider: String },
	/// No accept/reject arrived before the fulfillment deadline.
	FulfillmentTimeout {
		order_id: String,
		provider: String,
		attempt: u32,
	},
}

impl InternalEvent {
	pub fn order_id(&self) -> &str {
		match self {
			InternalEvent::ProviderStatus { order_id, .. }
			| InternalEvent::PollExhausted { order_id, .. }
			| InternalEvent::FulfillmentTimeout { order_id, .. } => order_id,
		}
	}
}

/// `ORDER_STATE_CHANGED`, published for every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStateChanged {
	pub order_id: String,
	pub old_state: OrderState,
	pub new_state: OrderState,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub provider: Option<String>,
	pub timestamp: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

/// Why an event was discarded without changing the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
	/// Sequence number not newer than the last applied one.
	Stale,
	/// The event asks for a transition not legal from the current state.
	InvalidTransition,
	/// The event concerns a provider the order no longer waits on.
	ProviderMismatch,
	/// The event targets an order that does not exist.
	UnknownOrder,
}

/// Events published on the in-process event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DispatchEvent {
	StateChanged(OrderStateChanged),
	Discarded {
		order_id: String,
		sequence: Option<u64>,
		reason: DiscardReason,
	},
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::GeoPoint;

	#[test]
	fn test_inbound_event_wire_format() {
		let json = r#"{
			"orderId": "o-1",
			"sequence": 3,
			"type": "ORDER_UPDATE",
			"provider": "acme",
			"providerStatus": "in_progress"
		}"#;

		let event: InboundEvent = serde_json::from_str(json).unwrap();
		assert_eq!(event.order_id, "o-1");
		assert_eq!(event.sequence, 3);
		assert_eq!(
			event.payload,
			InboundPayload::OrderUpdate {
				provider: Some("acme".into()),
				provider_status: ProviderStatus::InProgress,
			}
		);
	}

	#[test]
	fn test_new_order_event_parses() {
		let json = r#"{
			"orderId": "o-2",
			"sequence": 1,
			"type": "NEW_ORDER",
			"order": {
				"originId": "r-1",
				"destinationId": "c-1",
				"pickupLocation": { "lat": 1.0, "long": 2.0 },
				"dropoffLocation": { "lat": 1.5, "long": 2.5 }
			}
		}"#;

		let event: InboundEvent = serde_json::from_str(json).unwrap();
		match event.payload {
			InboundPayload::NewOrder { order } => {
				assert_eq!(order.pickup_location, GeoPoint::new(1.0, 2.0));
				assert!(order.demographic_area.is_none());
			},
			other => panic!("unexpected payload {:?}", other),
		}
	}

	#[test]
	fn test_cancel_has_no_body() {
		let json = r#"{"orderId":"o-3","sequence":9,"type":"CANCEL_ORDER"}"#;
		let event: InboundEvent = serde_json::from_str(json).unwrap();
		assert_eq!(event.payload, InboundPayload::CancelOrder);
		assert_eq!(event.payload.kind(), "CANCEL_ORDER");
	}
}
