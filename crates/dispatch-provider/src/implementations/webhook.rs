//! Push provider over HTTP.
//!
//! `POST /orders` answers synchronously with
//! `{ "accepted": bool, "providerRef": "...", "reason": "..." }`. Later
//! progress arrives through the provider's webhook.

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
	accepted: bool,
	#[serde(default)]
	provider_ref: Option<String>,
	#[serde(default)]
	reason: Option<String>,
}

pub struct WebhookProvider {
	client: HttpProviderClient,
}

impl WebhookProvider {
	pub fn new(client: HttpProviderClient) -> Self {
		Self { client }
	}
}

#[async_trait]
impl ProviderInterface for WebhookProvider {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(WebhookProviderSchema)
	}

	fn kind(&self) -> ProviderKind {
		ProviderKind::Push
	}

	async fn request_fulfillment(
		&self,
		order: &Order,
		token: &IdempotencyToken,
	) -> Result<FulfillmentResponse, ProviderError> {
		let reply: SubmitReply = self.client.submit_order(order, token).await?;

		let outcome = if reply.accepted {
			FulfillmentOutcome::Accepted
		} else {
			FulfillmentOutcome::Rejected {
				reason: reply.reason.unwrap_or_else(|| "declined".to_string()),
			}
		};

		Ok(FulfillmentResponse {
			outcome,
			provider_ref: reply.provider_ref,
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

pub struct WebhookProviderSchema;

impl ConfigSchema for WebhookProviderSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		http_schema().validate(config)
	}
}

pub fn create_provider(config: &toml::Value) -> Result<Box<dyn ProviderInterface>, ProviderError> {
	let client = HttpProviderClient::from_config(config)?;
	Ok(Box::new(WebhookProvider::new(client)))
}

pub struct Registry;

impl dispatch_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "webhook";
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

	async fn provider(state: Arc<ProviderState>, extra: &str) -> Box<dyn ProviderInterface> {
		let base_url = test_server::spawn(state).await;
		create_provider(&test_server::config(&base_url, extra)).unwrap()
	}

	#[tokio::test]
	async fn test_accepted_order() {
		let state = Arc::new(ProviderState::default());
		*state.submit_reply.lock().unwrap() = (
			200,
			serde_json::json!({ "accepted": true, "providerRef": "acme-77" }),
		);
		let provider = provider(state.clone(), "api_key = \"secret\"").await;

		let order = MockProvider::push().sample_order();
		let token = IdempotencyToken::new(&order.order_id, 2);
		let response = provider.request_fulfillment(&order, &token).await.unwrap();

		assert_eq!(response.outcome, FulfillmentOutcome::Accepted);
		assert_eq!(response.provider_ref.as_deref(), Some("acme-77"));
		assert_eq!(*state.idempotency_keys.lock().unwrap(), vec!["o-sample:2"]);
		assert_eq!(
			state.authorization.lock().unwrap().as_deref(),
			Some("Bearer secret")
		);
	}

	#[tokio::test]
	async fn test_declined_order() {
		let state = Arc::new(ProviderState::default());
		*state.submit_reply.lock().unwrap() = (
			200,
			serde_json::json!({ "accepted": false, "reason": "no couriers" }),
		);
		let provider = provider(state, "").await;

		let order = MockProvider::push().sample_order();
		let token = IdempotencyToken::new(&order.order_id, 1);
		let response = provider.request_fulfillment(&order, &token).await.unwrap();

		assert_eq!(
			response.outcome,
			FulfillmentOutcome::Rejected {
				reason: "no couriers".into()
			}
		);
	}

	#[tokio::test]
	async fn test_server_errors_are_transient() {
		let state = Arc::new(ProviderState::default());
		*state.submit_reply.lock().unwrap() = (503, serde_json::json!({}));
		let provider = provider(state, "").await;

		let order = MockProvider::push().sample_order();
		let token = IdempotencyToken::new(&order.order_id, 1);
		let error = provider
			.request_fulfillment(&order, &token)
			.await
			.unwrap_err();

		assert!(error.is_transient());
	}

	#[tokio::test]
	async fn test_client_errors_are_rejections() {
		let state = Arc::new(ProviderState::default());
		*state.submit_reply.lock().unwrap() = (422, serde_json::json!({ "error": "bad area" }));
		let provider = provider(state, "").await;

		let order = MockProvider::push().sample_order();
		let token = IdempotencyToken::new(&order.order_id, 1);
		let error = provider
			.request_fulfillment(&order, &token)
			.await
			.unwrap_err();

		assert!(matches!(error, ProviderError::Rejected(_)));
	}

	#[tokio::test]
	async fn test_cancel_of_finished_order_succeeds() {
		let state = Arc::new(ProviderState::default());
		*state.cancel_code.lock().unwrap() = 409;
		let provider = provider(state.clone(), "").await;
		let token = IdempotencyToken::new("o-sample", 1);

		provider.cancel("acme-77", &token).await.unwrap();

		*state.cancel_code.lock().unwrap() = 404;
		provider.cancel("acme-77", &token).await.unwrap();

		*state.cancel_code.lock().unwrap() = 500;
		assert!(provider.cancel("acme-77", &token).await.is_err());
	}

	#[test]
	fn test_base_url_is_required() {
		let config: toml::Value = toml::from_str("api_key = \"k\"").unwrap();
		assert!(matches!(
			create_provider(&config),
			Err(ProviderError::Configuration(_))
		));
	}
}
