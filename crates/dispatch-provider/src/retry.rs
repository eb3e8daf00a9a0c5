//! Exponential backoff with jitter around provider calls.

use crate::ProviderError;
use backoff::ExponentialBackoffBuilder;
use dispatch_types::RetryPolicy;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};

/// Runs `op` until it succeeds, fails permanently, or `policy.max_attempts`
/// calls have been made. Only [`ProviderError::is_transient`] failures are
/// retried; the last error is returned once the budget is spent.
pub async fn with_retry<T, F, Fut>(
	policy: &RetryPolicy,
	operation: &str,
	provider: &str,
	op: F,
) -> Result<T, ProviderError>
where
	F: Fn() -> Fut,
	Fut: Future<Output = Result<T, ProviderError>>,
{
	let backoff = ExponentialBackoffBuilder::new()
		.with_initial_interval(policy.initial_interval())
		.with_max_interval(policy.max_interval())
		.with_multiplier(policy.multiplier)
		.with_randomization_factor(policy.randomization_factor)
		.with_max_elapsed_time(None)
		.build();

	let counter = AtomicU32::new(0);
	let attempts = &counter;
	let op = &op;
	let max_attempts = policy.max_attempts.max(1);

	backoff::future::retry(backoff, move || async move {
		let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
		match op().await {
			Ok(value) => Ok(value),
			Err(e) if e.is_transient() && attempt < max_attempts => {
				tracing::warn!(
					provider = %provider,
					operation = %operation,
					attempt,
					max_attempts,
					error = %e,
					"Transient provider failure, retrying"
				);
				Err(backoff::Error::transient(e))
			},
			Err(e) => {
				if e.is_transient() {
					tracing::warn!(
						provider = %provider,
						operation = %operation,
						attempts = attempt,
						error = %e,
						"Retry budget exhausted"
					);
				}
				Err(backoff::Error::permanent(e))
			},
		}
	})
	.await
}
