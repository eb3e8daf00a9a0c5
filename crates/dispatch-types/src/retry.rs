//! Retry policy for provider calls.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with jitter applied to transient provider failures.
///
/// `max_attempts` counts the first call, so `1` disables retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub initial_interval_ms: u64,
	pub max_interval_ms: u64,
	pub multiplier: f64,
	/// Jitter applied to each interval, in `[0, 1]`.
	pub randomization_factor: f64,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			initial_interval_ms: 200,
			max_interval_ms: 5000,
			multiplier: 2.0,
			randomization_factor: 0.3,
		}
	}
}

impl RetryPolicy {
	/// A policy that makes exactly one attempt.
	pub fn no_retry() -> Self {
		Self {
			max_attempts: 1,
			..Self::default()
		}
	}

	pub fn initial_interval(&self) -> Duration {
		Duration::from_millis(self.initial_interval_ms)
	}

	pub fn max_interval(&self) -> Duration {
		Duration::from_millis(self.max_interval_ms)
	}
}
