//! Scripted in-process provider for tests and local runs.
//!
//! Replies are taken from a script in order; once the script is used up the
//! default reply is returned. Every call is recorded so tests can assert on
//! call counts and idempotency tokens.

use crate::{ProviderError, ProviderInterface};
use async_trait::async_trait;
use chrono::Utc;
use dispatch_types::{
	ConfigSchema, Field, FieldType, FulfillmentOutcome, FulfillmentResponse, GeoPoint,
	IdempotencyToken, NewOrder, Order, ProviderKind, ProviderStatus, Schema, ValidationError,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Scripted reply to `request_fulfillment` or `cancel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
	/// Push: accepted. Poll: acknowledged, status pending. Cancel: ok.
	Accept,
	/// Declined in the response body.
	Reject(String),
	/// Declined with a 4xx-equivalent error.
	RejectWithError,
	Unreachable,
	NotFound,
}

#[derive(Default)]
struct Calls {
	fulfillment: u32,
	status: u32,
	cancel: u32,
	tokens: Vec<String>,
	orders: Vec<String>,
}

pub struct MockProvider {
	kind: ProviderKind,
	fulfillment_script: Mutex<VecDeque<MockReply>>,
	default_reply: MockReply,
	status_script: Mutex<VecDeque<Result<ProviderStatus, ProviderError>>>,
	default_status: ProviderStatus,
	cancel_script: Mutex<VecDeque<MockReply>>,
	delay: Option<Duration>,
	calls: Mutex<Calls>,
}

impl MockProvider {
	pub fn new(kind: ProviderKind) -> Self {
		Self {
			kind,
			fulfillment_script: Mutex::new(VecDeque::new()),
			default_reply: MockReply::Accept,
			status_script: Mutex::new(VecDeque::new()),
			default_status: ProviderStatus::Unknown,
			cancel_script: Mutex::new(VecDeque::new()),
			delay: None,
			calls: Mutex::new(Calls::default()),
		}
	}

	pub fn push() -> Self {
		Self::new(ProviderKind::Push)
	}

	pub fn poll() -> Self {
		Self::new(ProviderKind::Poll)
	}

	pub fn with_fulfillment_script(self, script: Vec<MockReply>) -> Self {
		*lock(&self.fulfillment_script) = script.into();
		self
	}

	/// Reply used once the fulfillment script is exhausted.
	pub fn with_default_reply(mut self, reply: MockReply) -> Self {
		self.default_reply = reply;
		self
	}

	pub fn with_status_script(self, script: Vec<Result<ProviderStatus, ProviderError>>) -> Self {
		*lock(&self.status_script) = script.into();
		self
	}

	/// Status reported once the status script is exhausted.
	pub fn with_default_status(mut self, status: ProviderStatus) -> Self {
		self.default_status = status;
		self
	}

	pub fn with_cancel_script(self, script: Vec<MockReply>) -> Self {
		*lock(&self.cancel_script) = script.into();
		self
	}

	/// Delays every fulfillment request.
	pub fn with_delay(mut self, delay: Duration) -> Self {
		self.delay = Some(delay);
		self
	}

	pub fn fulfillment_calls(&self) -> u32 {
		lock(&self.calls).fulfillment
	}

	pub fn status_calls(&self) -> u32 {
		lock(&self.calls).status
	}

	pub fn cancel_calls(&self) -> u32 {
		lock(&self.calls).cancel
	}

	/// Idempotency tokens of every fulfillment and cancel call, in order.
	pub fn tokens(&self) -> Vec<String> {
		lock(&self.calls).tokens.clone()
	}

	/// Order ids of every fulfillment call, in order.
	pub fn requested_orders(&self) -> Vec<String> {
		lock(&self.calls).orders.clone()
	}

	/// An order fit for calling the provider directly.
	pub fn sample_order(&self) -> Order {
		let request = NewOrder {
			origin_id: "restaurant-1".into(),
			destination_id: "customer-1".into(),
			pickup_location: GeoPoint::new(1.30, 103.80),
			dropoff_location: GeoPoint::new(1.31, 103.81),
			demographic_area: None,
		};
		Order::new("o-sample", request, "A", 1, Utc::now())
	}
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn reply_error(reply: &MockReply) -> Option<ProviderError> {
	match reply {
		MockReply::RejectWithError => Some(ProviderError::Rejected("422 mock rejection".into())),
		MockReply::Unreachable => Some(ProviderError::Unreachable("503 mock outage".into())),
		MockReply::NotFound => Some(ProviderError::NotFound("404 mock".into())),
		MockReply::Accept | MockReply::Reject(_) => None,
	}
}

#[async_trait]
impl ProviderInterface for MockProvider {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MockProviderSchema)
	}

	fn kind(&self) -> ProviderKind {
		self.kind
	}

	async fn request_fulfillment(
		&self,
		order: &Order,
		token: &IdempotencyToken,
	) -> Result<FulfillmentResponse, ProviderError> {
		let reply = {
			let mut calls = lock(&self.calls);
			calls.fulfillment += 1;
			calls.tokens.push(token.to_string());
			calls.orders.push(order.order_id.clone());
			lock(&self.fulfillment_script)
				.pop_front()
				.unwrap_or_else(|| self.default_reply.clone())
		};

		if let Some(delay) = self.delay {
			tokio::time::sleep(delay).await;
		}

		if let Some(error) = reply_error(&reply) {
			return Err(error);
		}

		let provider_ref = Some(format!("mock-{}", token.as_str().replace(':', "-")));
		let outcome = match (reply, self.kind) {
			(MockReply::Reject(reason), _) => FulfillmentOutcome::Rejected { reason },
			(_, ProviderKind::Push) => FulfillmentOutcome::Accepted,
			(_, ProviderKind::Poll) => FulfillmentOutcome::Pending,
		};

		Ok(FulfillmentResponse {
			outcome,
			provider_ref,
		})
	}

	async fn get_status(&self, _provider_ref: &str) -> Result<ProviderStatus, ProviderError> {
		lock(&self.calls).status += 1;
		lock(&self.status_script)
			.pop_front()
			.unwrap_or(Ok(self.default_status))
	}

	async fn cancel(
		&self,
		_provider_ref: &str,
		token: &IdempotencyToken,
	) -> Result<(), ProviderError> {
		{
			let mut calls = lock(&self.calls);
			calls.cancel += 1;
			calls.tokens.push(token.to_string());
		}
		let reply = lock(&self.cancel_script)
			.pop_front()
			.unwrap_or(MockReply::Accept);
		match reply_error(&reply) {
			// Cancelling something the provider never saw is fine.
			Some(ProviderError::NotFound(_)) | None => Ok(()),
			Some(error) => Err(error),
		}
	}
}

pub struct MockProviderSchema;

impl ConfigSchema for MockProviderSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let one_of = |allowed: &'static [&'static str]| {
			move |v: &toml::Value| match v.as_str() {
				Some(s) if allowed.contains(&s) => Ok(()),
				_ => Err(format!("expected one of {:?}", allowed)),
			}
		};

		Schema::new(
			vec![],
			vec![
				Field::new("implementation", FieldType::String),
				Field::new("kind", FieldType::String).with_validator(one_of(&["push", "poll"])),
				Field::new("outcome", FieldType::String)
					.with_validator(one_of(&["accept", "reject", "unreachable"])),
				Field::new("status", FieldType::String),
				Field::new("statuses", FieldType::Array(Box::new(FieldType::String))),
			],
		)
		.validate(config)
	}
}

/// Builds a mock from its provider section:
///
/// ```toml
/// [providers.zenith]
/// implementation = "mock"
/// kind = "poll"
/// outcome = "accept"
/// statuses = ["SEARCHING", "CONFIRMED"]
/// status = "DELIVERED"
/// ```
pub fn create_provider(config: &toml::Value) -> Result<Box<dyn ProviderInterface>, ProviderError> {
	MockProviderSchema
		.validate(config)
		.map_err(|e| ProviderError::Configuration(e.to_string()))?;

	let kind = match config.get("kind").and_then(|v| v.as_str()) {
		Some("poll") => ProviderKind::Poll,
		_ => ProviderKind::Push,
	};
	let default_reply = match config.get("outcome").and_then(|v| v.as_str()) {
		Some("reject") => MockReply::Reject("declined by mock".into()),
		Some("unreachable") => MockReply::Unreachable,
		_ => MockReply::Accept,
	};
	let default_status = config
		.get("status")
		.and_then(|v| v.as_str())
		.map(ProviderStatus::from_vocabulary)
		.unwrap_or(ProviderStatus::Unknown);
	let statuses = config
		.get("statuses")
		.and_then(|v| v.as_array())
		.map(|items| {
			items
				.iter()
				.filter_map(|item| item.as_str())
				.map(|raw| Ok(ProviderStatus::from_vocabulary(raw)))
				.collect()
		})
		.unwrap_or_default();

	Ok(Box::new(
		MockProvider::new(kind)
			.with_default_reply(default_reply)
			.with_default_status(default_status)
			.with_status_script(statuses),
	))
}

pub struct Registry;

impl dispatch_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "mock";
	type Factory = crate::ProviderFactory;

	fn factory() -> Self::Factory {
		create_provider
	}
}

impl crate::ProviderRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_script_then_default() {
		let mock = MockProvider::push()
			.with_fulfillment_script(vec![MockReply::Reject("busy".into())]);
		let order = mock.sample_order();
		let token = IdempotencyToken::new(&order.order_id, 1);

		let first = mock.request_fulfillment(&order, &token).await.unwrap();
		let second = mock.request_fulfillment(&order, &token).await.unwrap();

		assert_eq!(
			first.outcome,
			FulfillmentOutcome::Rejected {
				reason: "busy".into()
			}
		);
		assert_eq!(second.outcome, FulfillmentOutcome::Accepted);
		assert_eq!(second.provider_ref.as_deref(), Some("mock-o-sample-1"));
		assert_eq!(mock.fulfillment_calls(), 2);
	}

	#[tokio::test]
	async fn test_poll_mock_from_config() {
		let config: toml::Value = toml::from_str(
			r#"
			implementation = "mock"
			kind = "poll"
			statuses = ["SEARCHING", "CONFIRMED"]
			status = "DELIVERED"
			"#,
		)
		.unwrap();
		let provider = create_provider(&config).unwrap();
		let order = MockProvider::poll().sample_order();
		let token = IdempotencyToken::new(&order.order_id, 1);

		let response = provider.request_fulfillment(&order, &token).await.unwrap();
		assert_eq!(response.outcome, FulfillmentOutcome::Pending);

		assert_eq!(provider.get_status("r").await.unwrap(), ProviderStatus::Unknown);
		assert_eq!(provider.get_status("r").await.unwrap(), ProviderStatus::Accepted);
		assert_eq!(provider.get_status("r").await.unwrap(), ProviderStatus::Delivered);
	}

	#[tokio::test]
	async fn test_cancel_not_found_is_ok() {
		let mock = MockProvider::push()
			.with_cancel_script(vec![MockReply::NotFound, MockReply::Unreachable]);
		let token = IdempotencyToken::new("o-1", 1);

		assert!(mock.cancel("r", &token).await.is_ok());
		assert!(mock.cancel("r", &token).await.is_err());
		assert_eq!(mock.cancel_calls(), 2);
	}

	#[test]
	fn test_invalid_kind_rejected() {
		let config: toml::Value = toml::from_str("kind = \"carrier-pigeon\"").unwrap();
		assert!(matches!(
			create_provider(&config),
			Err(ProviderError::Configuration(_))
		));
	}
}
