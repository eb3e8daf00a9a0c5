//! Pending-order queue entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An order waiting for a poll-based provider to report a status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
	pub order_id: String,
	pub provider: String,
	pub provider_ref: String,
	pub enqueued_at: DateTime<Utc>,
	pub poll_attempts: u32,
	pub next_eligible_poll_at: DateTime<Utc>,
}

impl PendingEntry {
	pub fn new(
		order_id: impl Into<String>,
		provider: impl Into<String>,
		provider_ref: impl Into<String>,
		now: DateTime<Utc>,
		first_poll_at: DateTime<Utc>,
	) -> Self {
		Self {
			order_id: order_id.into(),
			provider: provider.into(),
			provider_ref: provider_ref.into(),
			enqueued_at: now,
			poll_attempts: 0,
			next_eligible_poll_at: first_poll_at,
		}
	}

	pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
		self.next_eligible_poll_at <= now
	}
}
