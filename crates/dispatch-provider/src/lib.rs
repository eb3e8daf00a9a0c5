//! Provider adapter boundary for the delivery dispatcher.
//!
//! Every third-party fulfillment provider is reached through a
//! [`ProviderInterface`]. Push providers answer a fulfillment request with
//! accept or reject and later push updates through a webhook; poll providers
//! only acknowledge the request and must be polled for status.
//!
//! [`ProviderService`] owns the configured adapters and wraps every call in
//! the retry policy handed to it, so callers always read the current policy
//! snapshot.

use async_trait::async_trait;
use dispatch_types::{
	ConfigSchema, FulfillmentResponse, IdempotencyToken, ImplementationRegistry, Order,
	ProviderKind, ProviderStatus, RetryPolicy,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod implementations {
	pub mod http;
	pub mod mock;
	pub mod polling;
	pub mod webhook;
}

mod retry;

pub use retry::with_retry;

/// Errors returned by provider adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
	/// Permanent refusal (4xx-equivalent). Never retried.
	#[error("Rejected by provider: {0}")]
	Rejected(String),
	/// Network failure or 5xx. Retried with backoff.
	#[error("Provider unreachable: {0}")]
	Unreachable(String),
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Invalid response: {0}")]
	InvalidResponse(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
	#[error("Unknown provider: {0}")]
	UnknownProvider(String),
}

impl ProviderError {
	/// True for failures worth retrying.
	pub fn is_transient(&self) -> bool {
		matches!(self, ProviderError::Unreachable(_))
	}
}

#[async_trait]
pub trait ProviderInterface: Send + Sync {
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	fn kind(&self) -> ProviderKind;

	/// Asks the provider to fulfill `order`.
	///
	/// Repeating the call with the same token must not create a second
	/// fulfillment.
	async fn request_fulfillment(
		&self,
		order: &Order,
		token: &IdempotencyToken,
	) -> Result<FulfillmentResponse, ProviderError>;

	/// Current status of a fulfillment, mapped into the internal vocabulary.
	async fn get_status(&self, provider_ref: &str) -> Result<ProviderStatus, ProviderError>;

	/// Cancels a fulfillment. Cancelling an unknown or already finished
	/// fulfillment succeeds.
	async fn cancel(&self, provider_ref: &str, token: &IdempotencyToken)
		-> Result<(), ProviderError>;

	/// Maps a raw status string received through a webhook.
	fn map_status(&self, raw: &str) -> ProviderStatus {
		ProviderStatus::from_vocabulary(raw)
	}
}

pub type ProviderFactory = fn(&toml::Value) -> Result<Box<dyn ProviderInterface>, ProviderError>;

pub trait ProviderRegistry: ImplementationRegistry<Factory = ProviderFactory> {}

pub fn get_all_implementations() -> Vec<(&'static str, ProviderFactory)> {
	use implementations::{mock, polling, webhook};

	vec![
		(mock::Registry::NAME, mock::Registry::factory()),
		(polling::Registry::NAME, polling::Registry::factory()),
		(webhook::Registry::NAME, webhook::Registry::factory()),
	]
}

/// Configured provider adapters keyed by provider id.
pub struct ProviderService {
	providers: HashMap<String, Arc<dyn ProviderInterface>>,
}

impl ProviderService {
	pub fn new(providers: HashMap<String, Arc<dyn ProviderInterface>>) -> Self {
		Self { providers }
	}

	pub fn get(&self, provider: &str) -> Result<&Arc<dyn ProviderInterface>, ProviderError> {
		self.providers
			.get(provider)
			.ok_or_else(|| ProviderError::UnknownProvider(provider.to_string()))
	}

	pub fn contains(&self, provider: &str) -> bool {
		self.providers.contains_key(provider)
	}

	pub fn ids(&self) -> impl Iterator<Item = &str> {
		self.providers.keys().map(String::as_str)
	}

	pub fn kind(&self, provider: &str) -> Result<ProviderKind, ProviderError> {
		Ok(self.get(provider)?.kind())
	}

	pub fn map_status(&self, provider: &str, raw: &str) -> Result<ProviderStatus, ProviderError> {
		Ok(self.get(provider)?.map_status(raw))
	}

	pub async fn request_fulfillment(
		&self,
		provider: &str,
		order: &Order,
		token: &IdempotencyToken,
		policy: &RetryPolicy,
	) -> Result<FulfillmentResponse, ProviderError> {
		let adapter = self.get(provider)?;
		with_retry(policy, "request_fulfillment", provider, || {
			adapter.request_fulfillment(order, token)
		})
		.await
	}

	pub async fn get_status(
		&self,
		provider: &str,
		provider_ref: &str,
		policy: &RetryPolicy,
	) -> Result<ProviderStatus, ProviderError> {
		let adapter = self.get(provider)?;
		with_retry(policy, "get_status", provider, || adapter.get_status(provider_ref)).await
	}

	pub async fn cancel(
		&self,
		provider: &str,
		provider_ref: &str,
		token: &IdempotencyToken,
		policy: &RetryPolicy,
	) -> Result<(), ProviderError> {
		let adapter = self.get(provider)?;
		with_retry(policy, "cancel", provider, || adapter.cancel(provider_ref, token)).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use implementations::mock::{MockProvider, MockReply};

	fn fast_policy(max_attempts: u32) -> RetryPolicy {
		RetryPolicy {
			max_attempts,
			initial_interval_ms: 1,
			max_interval_ms: 2,
			multiplier: 2.0,
			randomization_factor: 0.0,
		}
	}

	#[tokio::test]
	async fn test_transient_failures_are_retried() {
		let mock = Arc::new(MockProvider::push().with_fulfillment_script(vec![
			MockReply::Unreachable,
			MockReply::Unreachable,
			MockReply::Accept,
		]));
		let service = ProviderService::new(HashMap::from([(
			"acme".to_string(),
			mock.clone() as Arc<dyn ProviderInterface>,
		)]));

		let order = mock.sample_order();
		let token = IdempotencyToken::new(&order.order_id, 1);
		let response = service
			.request_fulfillment("acme", &order, &token, &fast_policy(3))
			.await
			.unwrap();

		assert_eq!(response.outcome, dispatch_types::FulfillmentOutcome::Accepted);
		assert_eq!(mock.fulfillment_calls(), 3);
		// The same token is used on every attempt.
		assert!(mock.tokens().iter().all(|t| t == "o-sample:1"));
	}

	#[tokio::test]
	async fn test_retry_budget_is_bounded() {
		let mock = Arc::new(MockProvider::push().with_fulfillment_script(vec![
			MockReply::Unreachable,
			MockReply::Unreachable,
			MockReply::Unreachable,
			MockReply::Accept,
		]));
		let service = ProviderService::new(HashMap::from([(
			"acme".to_string(),
			mock.clone() as Arc<dyn ProviderInterface>,
		)]));

		let order = mock.sample_order();
		let token = IdempotencyToken::new(&order.order_id, 1);
		let result = service
			.request_fulfillment("acme", &order, &token, &fast_policy(2))
			.await;

		assert!(matches!(result, Err(ProviderError::Unreachable(_))));
		assert_eq!(mock.fulfillment_calls(), 2);
	}

	#[tokio::test]
	async fn test_permanent_rejection_is_not_retried() {
		let mock = Arc::new(
			MockProvider::push().with_fulfillment_script(vec![MockReply::RejectWithError]),
		);
		let service = ProviderService::new(HashMap::from([(
			"acme".to_string(),
			mock.clone() as Arc<dyn ProviderInterface>,
		)]));

		let order = mock.sample_order();
		let token = IdempotencyToken::new(&order.order_id, 1);
		let result = service
			.request_fulfillment("acme", &order, &token, &fast_policy(5))
			.await;

		assert!(matches!(result, Err(ProviderError::Rejected(_))));
		assert_eq!(mock.fulfillment_calls(), 1);
	}

	#[tokio::test]
	async fn test_unknown_provider() {
		let service = ProviderService::new(HashMap::new());
		assert!(matches!(
			service.kind("ghost"),
			Err(ProviderError::UnknownProvider(_))
		));
	}
}
