//! HTTP plumbing shared by the webhook and polling adapters.
//!
//! Endpoints, relative to `base_url`:
//! - `POST /orders` with an `Idempotency-Key` header
//! - `GET /orders/{ref}` returning `{ "status": "..." }`
//! - `POST /orders/{ref}/cancel`
//!
//! Responses are classified as: 2xx success, 404 `NotFound`, other 4xx
//! `Rejected`, 5xx and transport errors `Unreachable`.

use crate::ProviderError;
use dispatch_types::{
	Field, FieldType, GeoPoint, IdempotencyToken, Order, ProviderStatus, Schema,
};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

/// Body of `POST /orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentRequest {
	pub order_id: String,
	pub origin_id: String,
	pub destination_id: String,
	pub pickup_location: GeoPoint,
	pub dropoff_location: GeoPoint,
	pub demographic_area: String,
}

impl From<&Order> for FulfillmentRequest {
	fn from(order: &Order) -> Self {
		Self {
			order_id: order.order_id.clone(),
			origin_id: order.origin_id.clone(),
			destination_id: order.destination_id.clone(),
			pickup_location: order.pickup_location,
			dropoff_location: order.dropoff_location,
			demographic_area: order.demographic_area.clone(),
		}
	}
}

#[derive(Debug, Deserialize)]
struct StatusReply {
	status: String,
}

/// Schema of the keys every HTTP provider accepts.
pub fn http_schema() -> Schema {
	Schema::new(
		vec![Field::new("base_url", FieldType::String).with_validator(|v| {
			match v.as_str() {
				Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(()),
				_ => Err("base_url must start with http:// or https://".to_string()),
			}
		})],
		vec![
			Field::new("implementation", FieldType::String),
			Field::new("api_key", FieldType::String),
			Field::new(
				"timeout_seconds",
				FieldType::Integer {
					min: Some(1),
					max: Some(300),
				},
			),
			Field::new("status_map", FieldType::Map(Box::new(FieldType::String))).with_validator(
				|v| {
					let table = v.as_table().ok_or("status_map must be a table")?;
					for (raw, mapped) in table {
						let mapped = mapped.as_str().unwrap_or_default();
						parse_status(mapped).ok_or_else(|| {
							format!("status '{}' maps to unknown status '{}'", raw, mapped)
						})?;
					}
					Ok(())
				},
			),
		],
	)
}

fn parse_status(value: &str) -> Option<ProviderStatus> {
	match value {
		"accepted" => Some(ProviderStatus::Accepted),
		"rejected" => Some(ProviderStatus::Rejected),
		"in_progress" => Some(ProviderStatus::InProgress),
		"delivered" => Some(ProviderStatus::Delivered),
		"failed" => Some(ProviderStatus::Failed),
		"unknown" => Some(ProviderStatus::Unknown),
		_ => None,
	}
}

/// Client for one provider's HTTP API.
pub struct HttpProviderClient {
	client: reqwest::Client,
	base_url: String,
	api_key: Option<String>,
	/// Upper-cased raw status to internal status.
	status_map: HashMap<String, ProviderStatus>,
}

impl HttpProviderClient {
	/// Builds a client from an already validated provider section.
	pub fn from_config(config: &toml::Value) -> Result<Self, ProviderError> {
		http_schema()
			.validate(config)
			.map_err(|e| ProviderError::Configuration(e.to_string()))?;

		let base_url = config
			.get("base_url")
			.and_then(|v| v.as_str())
			.ok_or_else(|| ProviderError::Configuration("base_url is required".into()))?
			.trim_end_matches('/')
			.to_string();
		let api_key = config
			.get("api_key")
			.and_then(|v| v.as_str())
			.filter(|key| !key.is_empty())
			.map(str::to_string);
		let timeout = config
			.get("timeout_seconds")
			.and_then(|v| v.as_integer())
			.map(|v| v as u64)
			.unwrap_or(DEFAULT_TIMEOUT_SECONDS);

		let status_map = config
			.get("status_map")
			.and_then(|v| v.as_table())
			.map(|table| {
				table
					.iter()
					.filter_map(|(raw, mapped)| {
						let status = parse_status(mapped.as_str()?)?;
						Some((raw.to_ascii_uppercase(), status))
					})
					.collect()
			})
			.unwrap_or_default();

		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(timeout))
			.build()
			.map_err(|e| ProviderError::Configuration(format!("HTTP client: {}", e)))?;

		Ok(Self {
			client,
			base_url,
			api_key,
			status_map,
		})
	}

	/// Provider-specific mapping first, then the built-in vocabulary.
	pub fn map_status(&self, raw: &str) -> ProviderStatus {
		self.status_map
			.get(&raw.trim().to_ascii_uppercase())
			.copied()
			.unwrap_or_else(|| ProviderStatus::from_vocabulary(raw))
	}

	fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		match &self.api_key {
			Some(key) => request.bearer_auth(key),
			None => request,
		}
	}

	/// `POST /orders`, decoding the success body as `R`.
	pub async fn submit_order<R: DeserializeOwned>(
		&self,
		order: &Order,
		token: &IdempotencyToken,
	) -> Result<R, ProviderError> {
		let request = self
			.client
			.post(format!("{}/orders", self.base_url))
			.header(IDEMPOTENCY_HEADER, token.as_str())
			.json(&FulfillmentRequest::from(order));
		let response = self.send(request).await?;
		response
			.json()
			.await
			.map_err(|e| ProviderError::InvalidResponse(e.to_string()))
	}

	/// `GET /orders/{ref}`, mapped into the internal vocabulary.
	pub async fn fetch_status(&self, provider_ref: &str) -> Result<ProviderStatus, ProviderError> {
		let request = self
			.client
			.get(format!("{}/orders/{}", self.base_url, provider_ref));
		let reply: StatusReply = self
			.send(request)
			.await?
			.json()
			.await
			.map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
		Ok(self.map_status(&reply.status))
	}

	/// `POST /orders/{ref}/cancel`. 404 and 409 mean there is nothing left to
	/// cancel and count as success.
	pub async fn cancel(
		&self,
		provider_ref: &str,
		token: &IdempotencyToken,
	) -> Result<(), ProviderError> {
		let request = self
			.client
			.post(format!("{}/orders/{}/cancel", self.base_url, provider_ref))
			.header(IDEMPOTENCY_HEADER, token.as_str());
		match self.send(request).await {
			Ok(_) | Err(ProviderError::NotFound(_)) => Ok(()),
			Err(ProviderError::Rejected(msg)) if msg.starts_with("409") => Ok(()),
			Err(e) => Err(e),
		}
	}

	async fn send(
		&self,
		request: reqwest::RequestBuilder,
	) -> Result<reqwest::Response, ProviderError> {
		let response = self
			.authorize(request)
			.send()
			.await
			.map_err(|e| ProviderError::Unreachable(e.to_string()))?;

		let status = response.status();
		if status.is_success() {
			return Ok(response);
		}

		let body = response.text().await.unwrap_or_default();
		Err(classify(status, body))
	}
}

fn classify(status: StatusCode, body: String) -> ProviderError {
	let message = format!("{} {}", status.as_u16(), body).trim_end().to_string();
	if status == StatusCode::NOT_FOUND {
		ProviderError::NotFound(message)
	} else if status.is_client_error() {
		ProviderError::Rejected(message)
	} else {
		ProviderError::Unreachable(message)
	}
}

#[cfg(test)]
pub(crate) mod test_server {
	//! Minimal provider API used by the adapter tests.

	use super::*;
	use axum::extract::{Path, State};
	use axum::http::{HeaderMap, StatusCode};
	use axum::routing::{get, post};
	use axum::{Json, Router};
	use std::sync::{Arc, Mutex};

	#[derive(Default)]
	pub struct ProviderState {
		/// Status code and JSON body returned by `POST /orders`.
		pub submit_reply: Mutex<(u16, serde_json::Value)>,
		pub status: Mutex<(u16, String)>,
		pub cancel_code: Mutex<u16>,
		pub idempotency_keys: Mutex<Vec<String>>,
		pub authorization: Mutex<Option<String>>,
	}

	async fn submit(
		State(state): State<Arc<ProviderState>>,
		headers: HeaderMap,
		Json(_body): Json<FulfillmentRequest>,
	) -> (StatusCode, Json<serde_json::Value>) {
		if let Some(key) = headers.get(IDEMPOTENCY_HEADER).and_then(|v| v.to_str().ok()) {
			state.idempotency_keys.lock().unwrap().push(key.to_string());
		}
		*state.authorization.lock().unwrap() = headers
			.get("authorization")
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);
		let (code, body) = state.submit_reply.lock().unwrap().clone();
		(StatusCode::from_u16(code).unwrap(), Json(body))
	}

	async fn status(
		State(state): State<Arc<ProviderState>>,
		Path(_reference): Path<String>,
	) -> (StatusCode, Json<serde_json::Value>) {
		let (code, status) = state.status.lock().unwrap().clone();
		(
			StatusCode::from_u16(code).unwrap(),
			Json(serde_json::json!({ "status": status })),
		)
	}

	async fn cancel(
		State(state): State<Arc<ProviderState>>,
		Path(_reference): Path<String>,
	) -> StatusCode {
		StatusCode::from_u16(*state.cancel_code.lock().unwrap()).unwrap()
	}

	/// Starts the server and returns its base URL.
	pub async fn spawn(state: Arc<ProviderState>) -> String {
		let app = Router::new()
			.route("/orders", post(submit))
			.route("/orders/{reference}", get(status))
			.route("/orders/{reference}/cancel", post(cancel))
			.with_state(state);

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			axum::serve(listener, app).await.unwrap();
		});
		format!("http://{}", addr)
	}

	pub fn config(base_url: &str, extra: &str) -> toml::Value {
		toml::from_str(&format!("base_url = \"{}\"\n{}", base_url, extra)).unwrap()
	}
}
