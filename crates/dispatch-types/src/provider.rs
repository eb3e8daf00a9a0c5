//! Provider-facing types shared by adapters, the orchestrator and the reconciler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a provider reports progress after a fulfillment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
	/// Accepts or rejects synchronously and pushes later updates through a webhook.
	Push,
	/// Acknowledges the request and must be polled for status.
	Poll,
}

/// Internal status vocabulary every provider status is mapped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
	Accepted,
	Rejected,
	InProgress,
	Delivered,
	Failed,
	Unknown,
}

impl ProviderStatus {
	/// Maps a provider's raw status string using the built-in vocabulary.
	///
	/// Matching is case-insensitive. Anything unrecognised is `Unknown`.
	pub fn from_vocabulary(raw: &str) -> Self {
		match raw.trim().to_ascii_uppercase().as_str() {
			"ACCEPTED" | "CONFIRMED" => ProviderStatus::Accepted,
			"REJECTED" | "DECLINED" => ProviderStatus::Rejected,
			"IN_PROGRESS" | "DRIVER_ASSIGNED" | "PICKED_UP" | "IN_TRANSIT" => {
				ProviderStatus::InProgress
			},
			"DELIVERED" | "COMPLETED" => ProviderStatus::Delivered,
			"FAILED" | "CANCELLED" => ProviderStatus::Failed,
			_ => ProviderStatus::Unknown,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ProviderStatus::Accepted => "accepted",
			ProviderStatus::Rejected => "rejected",
			ProviderStatus::InProgress => "in_progress",
			ProviderStatus::Delivered => "delivered",
			ProviderStatus::Failed => "failed",
			ProviderStatus::Unknown => "unknown",
		}
	}
}

impl fmt::Display for ProviderStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Result of a fulfillment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentOutcome {
	/// Push provider accepted the order.
	Accepted,
	/// Provider declined the order.
	Rejected { reason: String },
	/// Poll provider registered the request; status must be polled.
	Pending,
}

/// Response of `requestFulfillment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentResponse {
	pub outcome: FulfillmentOutcome,
	pub provider_ref: Option<String>,
}

/// Idempotency token derived from the order id and attempt number.
///
/// Re-issuing a call with the same token must not create a second
/// fulfillment at the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
	pub fn new(order_id: &str, attempt: u32) -> Self {
		Self(format!("{}:{}", order_id, attempt))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for IdempotencyToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_vocabulary_mapping() {
		assert_eq!(
			ProviderStatus::from_vocabulary("confirmed"),
			ProviderStatus::Accepted
		);
		assert_eq!(
			ProviderStatus::from_vocabulary("PICKED_UP"),
			ProviderStatus::InProgress
		);
		assert_eq!(
			ProviderStatus::from_vocabulary(" completed "),
			ProviderStatus::Delivered
		);
		assert_eq!(
			ProviderStatus::from_vocabulary("SEARCHING_DRIVER"),
			ProviderStatus::Unknown
		);
	}

	#[test]
	fn test_idempotency_token_is_stable_per_attempt() {
		assert_eq!(
			IdempotencyToken::new("o-1", 2),
			IdempotencyToken::new("o-1", 2)
		);
		assert_ne!(
			IdempotencyToken::new("o-1", 1),
			IdempotencyToken::new("o-1", 2)
		);
		assert_eq!(IdempotencyToken::new("o-1", 2).as_str(), "o-1:2");
	}
}
