//! Poll provider over HTTP.
//!
//! `POST /orders` only registers the request and returns
//! `{ "providerRef": "..." }`. The reconciler polls `GET /orders/{ref}`
//! until the status becomes known.

use super::http::{http_schema, HttpProviderClient};
use crate::{ProviderError, ProviderInterface};
use async_trait::async_trait;
use dispatch_types::{
	ConfigSchema, FulfillmentOutcome, FulfillmentResponse, IdempotencyToken, Order, ProviderKind,
	ProviderStatus, ValidationError,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitReply {
	provider_ref: String,
}

pub struct PollingProvider {
	client: HttpProviderClient,
}

impl PollingProvider {
	pub fn new(client: HttpProviderClient) -> Self {
		Self { client }
	}
}

#[async_trait]
impl ProviderInterface for PollingProvider {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(PollingProviderSchema)
	}

	fn kind(&self) -> ProviderKind {
		ProviderKind::Poll
	}

	async fn request_fulfillment(
		&self,
		order: &Order,
		token: &IdempotencyToken,
	) -> Result<FulfillmentResponse, ProviderError> {
		let reply: SubmitReply = self.client.submit_order(order, token).await?;
		if reply.provider_ref.is_empty() {
			return Err(ProviderError::InvalidResponse(
				"empty providerRef in acknowledgement".into(),
			));
		}
		Ok(FulfillmentResponse {
			outcome: FulfillmentOutcome::Pending,
			provider_ref: Some(reply.provider_ref),
		})
	}

	async fn get_status(&self, provider_ref: &str) -> Result<ProviderStatus, ProviderError> {
		self.client.fetch_status(provider_ref).await
	}

	async fn cancel(
		&self,
		provider_ref: &str,
		token: &IdempotencyToken,
	) -> Result<(), ProviderError> {
		self.client.cancel(provider_ref, token).await
	}

	fn map_status(&self, raw: &str) -> ProviderStatus {
		self.client.map_status(raw)
	}
}

pub struct PollingProviderSchema;

impl ConfigSchema for PollingProviderSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		http_schema().validate(config)
	}
}

pub fn create_provider(config: &toml::Value) -> Result<Box<dyn ProviderInterface>, ProviderError> {
	let client = HttpProviderClient::from_config(config)?;
	Ok(Box::new(PollingProvider::new(client)))
}

pub struct Registry;

impl dispatch_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "polling";
	type Factory = crate::ProviderFactory;

	fn factory() -> Self::Factory {
		create_provider
	}
}

impl crate::ProviderRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::implementations::http::test_server::{self, ProviderState};
	use crate::implementations::mock::MockProvider;
	use std::sync::Arc;

	#[tokio::test]
	async fn test_acknowledgement_is_pending() {
		let state = Arc::new(ProviderState::default());
		*state.submit_reply.lock().unwrap() =
			(202, serde_json::json!({ "providerRef": "zen-1" }));
		let base_url = test_server::spawn(state.clone()).await;
		let provider = create_provider(&test_server::config(&base_url, "")).unwrap();

		let order = MockProvider::poll().sample_order();
		let token = IdempotencyToken::new(&order.order_id, 1);
		let response = provider.request_fulfillment(&order, &token).await.unwrap();

		assert_eq!(provider.kind(), ProviderKind::Poll);
		assert_eq!(response.outcome, FulfillmentOutcome::Pending);
		assert_eq!(response.provider_ref.as_deref(), Some("zen-1"));
	}

	#[tokio::test]
	async fn test_status_uses_provider_mapping() {
		let state = Arc::new(ProviderState::default());
		*state.status.lock().unwrap() = (200, "ON_THE_WAY".into());
		let base_url = test_server::spawn(state.clone()).await;
		let provider = create_provider(&test_server::config(
			&base_url,
			"status_map = { ON_THE_WAY = \"in_progress\" }",
		))
		.unwrap();

		assert_eq!(
			provider.get_status("zen-1").await.unwrap(),
			ProviderStatus::InProgress
		);

		*state.status.lock().unwrap() = (200, "SEARCHING".into());
		assert_eq!(
			provider.get_status("zen-1").await.unwrap(),
			ProviderStatus::Unknown
		);

		*state.status.lock().unwrap() = (404, String::new());
		assert!(matches!(
			provider.get_status("zen-1").await,
			Err(ProviderError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn test_unreachable_provider() {
		// Nothing listens on this port.
		let provider =
			create_provider(&test_server::config("http://127.0.0.1:9", "timeout_seconds = 1"))
				.unwrap();
		let error = provider.get_status("zen-1").await.unwrap_err();
		assert!(error.is_transient());
	}
}
