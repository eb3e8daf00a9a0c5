//! Fulfillment deadlines.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dispatch_types::InternalEvent;

#[derive(Debug, Clone, PartialEq)]
struct Deadline {
	provider: String,
	attempt: u32,
	at: DateTime<Utc>,
}

/// Deadlines of orders in `FULFILLMENT_REQUESTED`, keyed by order id.
///
/// Only the latest attempt of an order is tracked. The tracker is rebuilt
/// from persisted deadlines on recovery.
#[derive(Default)]
pub struct DeadlineTracker {
	deadlines: DashMap<String, Deadline>,
}

impl DeadlineTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn track(&self, order_id: &str, provider: &str, attempt: u32, at: DateTime<Utc>) {
		self.deadlines.insert(
			order_id.to_string(),
			Deadline {
				provider: provider.to_string(),
				attempt,
				at,
			},
		);
	}

	pub fn clear(&self, order_id: &str) {
		self.deadlines.remove(order_id);
	}

	pub fn is_tracked(&self, order_id: &str) -> bool {
		self.deadlines.contains_key(order_id)
	}

	/// Removes and returns a timeout event for every deadline at or before `now`.
	pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<InternalEvent> {
		let expired: Vec<String> = self
			.deadlines
			.iter()
			.filter(|entry| entry.at <= now)
			.map(|entry| entry.key().clone())
			.collect();

		expired
			.into_iter()
			.filter_map(|order_id| {
				// Re-check: a newer attempt may have been tracked meanwhile.
				let (order_id, deadline) = self.deadlines.remove_if(&order_id, |_, d| d.at <= now)?;
				Some(InternalEvent::FulfillmentTimeout {
					order_id,
					provider: deadline.provider,
					attempt: deadline.attempt,
				})
			})
			.collect()
	}

	pub fn len(&self) -> usize {
		self.deadlines.len()
	}

	pub fn is_empty(&self) -> bool {
		self.deadlines.is_empty()
	}
}
