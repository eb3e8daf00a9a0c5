//! HTTP ingress for the dispatcher.
//!
//! Stands in for the event router: order services, origins and providers
//! deliver their events here, and they are handed to the engine's inbound
//! channel.

use axum::{
	extract::{DefaultBodyLimit, Path, State},
	http::{HeaderName, HeaderValue, Method, StatusCode},
	response::{IntoResponse, Json, Response},
	routing::{get, post},
	Router,
};
use dispatch_config::{ApiConfig, CorsConfig};
use dispatch_core::DispatchEngine;
use dispatch_types::{InboundEvent, InboundPayload, NewOrder, Order};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Shared application state for the API server.
#[derive(Clone)]
pub struct AppState {
	pub engine: Arc<DispatchEngine>,
	/// Where accepted events go; the engine's inbound channel in production.
	pub inbound: mpsc::UnboundedSender<InboundEvent>,
}

#[derive(Debug, Error)]
pub enum ApiError {
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Bad request: {0}")]
	BadRequest(String),
	#[error("Service unavailable: {0}")]
	Unavailable(String),
	#[error("Internal error: {0}")]
	Internal(String),
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let (status, code) = match &self {
			ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
			ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
			ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
			ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
		};
		let body = Json(json!({ "error": code, "message": self.to_string() }));
		(status, body).into_response()
	}
}

/// Provider webhook body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
	pub order_id: String,
	pub sequence: u64,
	/// Raw provider status, mapped through the provider's vocabulary.
	pub status: String,
}

pub async fn start_server(
	api_config: ApiConfig,
	engine: Arc<DispatchEngine>,
) -> Result<(), Box<dyn std::error::Error>> {
	let state = AppState {
		inbound: engine.inbound_sender(),
		engine,
	};
	let app = router(&api_config, state);

	let bind_address = format!("{}:{}", api_config.host, api_config.port);
	let listener = TcpListener::bind(&bind_address).await?;

	tracing::info!("Dispatcher API server starting on {}", bind_address);

	axum::serve(listener, app).await?;

	Ok(())
}

pub fn router(api_config: &ApiConfig, state: AppState) -> Router {
	Router::new()
		.route("/health", get(handle_health))
		.nest(
			"/api",
			Router::new()
				.route("/events", post(handle_event))
				.route("/orders", post(handle_create_order))
				.route("/orders/{id}", get(handle_get_order))
				.route("/webhooks/{provider}", post(handle_webhook)),
		)
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(TimeoutLayer::new(Duration::from_secs(
					api_config.timeout_seconds,
				)))
				.layer(cors_layer(api_config.cors.as_ref()))
				.layer(DefaultBodyLimit::max(api_config.max_request_size)),
		)
		.with_state(state)
}

/// Permissive unless origins, methods and headers are configured.
fn cors_layer(cors: Option<&CorsConfig>) -> CorsLayer {
	let Some(cors) = cors else {
		return CorsLayer::permissive();
	};

	let origins: Vec<HeaderValue> = cors
		.allowed_origins
		.iter()
		.filter_map(|origin| origin.parse().ok())
		.collect();
	let methods: Vec<Method> = cors
		.allowed_methods
		.iter()
		.filter_map(|method| method.parse().ok())
		.collect();
	let headers: Vec<HeaderName> = cors
		.allowed_headers
		.iter()
		.filter_map(|header| header.parse().ok())
		.collect();

	CorsLayer::new()
		.allow_origin(origins)
		.allow_methods(methods)
		.allow_headers(headers)
}

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
	let pending_polls = state.engine.queue().len().await.ok();
	Json(json!({
		"status": "ok",
		"dispatcher": state.engine.config().dispatch.id,
		"pendingPolls": pending_polls,
	}))
}

/// Handles POST /api/events: a typed inbound event from the event router.
async fn handle_event(
	State(state): State<AppState>,
	Json(event): Json<InboundEvent>,
) -> Result<impl IntoResponse, ApiError> {
	tracing::debug!(
		order_id = %dispatch_types::truncate_id(&event.order_id),
		sequence = event.sequence,
		kind = event.payload.kind(),
		"Event received"
	);
	accept(&state, event)
}

/// Handles POST /api/orders: creates an order under a fresh id.
async fn handle_create_order(
	State(state): State<AppState>,
	Json(order): Json<NewOrder>,
) -> Result<impl IntoResponse, ApiError> {
	let event = InboundEvent {
		order_id: uuid::Uuid::new_v4().to_string(),
		sequence: 1,
		payload: InboundPayload::NewOrder { order },
	};
	accept(&state, event)
}

/// Handles POST /api/webhooks/{provider}: a push provider's status update.
async fn handle_webhook(
	State(state): State<AppState>,
	Path(provider): Path<String>,
	Json(payload): Json<WebhookPayload>,
) -> Result<impl IntoResponse, ApiError> {
	let providers = state.engine.providers();
	if !providers.contains(&provider) {
		return Err(ApiError::NotFound(format!("Unknown provider '{}'", provider)));
	}
	let provider_status = providers
		.map_status(&provider, &payload.status)
		.map_err(|e| ApiError::BadRequest(e.to_string()))?;

	tracing::debug!(
		provider = %provider,
		raw_status = %payload.status,
		status = %provider_status,
		"Provider webhook received"
	);

	let event = InboundEvent {
		order_id: payload.order_id,
		sequence: payload.sequence,
		payload: InboundPayload::OrderUpdate {
			provider: Some(provider),
			provider_status,
		},
	};
	accept(&state, event)
}

/// Handles GET /api/orders/{id}.
async fn handle_get_order(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
	match state.engine.orchestrator().get_order(&id).await {
		Ok(Some(order)) => Ok(Json(order)),
		Ok(None) => Err(ApiError::NotFound(format!("Order '{}' not found", id))),
		Err(e) => {
			tracing::warn!("Order retrieval failed: {}", e);
			Err(ApiError::Internal(e.to_string()))
		},
	}
}

fn accept(state: &AppState, event: InboundEvent) -> Result<impl IntoResponse, ApiError> {
	let body = json!({ "orderId": event.order_id, "sequence": event.sequence });
	state
		.inbound
		.send(event)
		.map_err(|_| ApiError::Unavailable("Dispatcher is not accepting events".into()))?;
	Ok((StatusCode::ACCEPTED, Json(body)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::body::{to_bytes, Body};
	use axum::http::Request;
	use dispatch_config::builders::ConfigBuilder;
	use dispatch_core::{DispatchBuilder, DispatchFactories};
	use dispatch_provider::implementations::mock::MockProvider;
	use dispatch_types::{GeoPoint, OrderState, ProviderStatus};
	use tower::ServiceExt;

	fn api_config() -> ApiConfig {
		ApiConfig {
			enabled: true,
			host: "127.0.0.1".into(),
			port: 0,
			timeout_seconds: 5,
			max_request_size: 64 * 1024,
			cors: None,
		}
	}

	fn engine() -> Arc<DispatchEngine> {
		let config = ConfigBuilder::new()
			.provider("acme", "mock", toml::Table::new())
			.area_rules("A", &["acme"])
			.build();

		let factories = DispatchFactories {
			storage_factories: dispatch_storage::get_all_implementations()
				.into_iter()
				.map(|(name, factory)| (name.to_string(), factory))
				.collect(),
			queue_factories: dispatch_queue::get_all_implementations()
				.into_iter()
				.map(|(name, factory)| (name.to_string(), factory))
				.collect(),
			provider_factories: dispatch_provider::get_all_implementations()
				.into_iter()
				.map(|(name, factory)| (name.to_string(), factory))
				.collect(),
		};

		Arc::new(
			DispatchBuilder::new(config)
				.with_provider("acme", Arc::new(MockProvider::push()))
				.build(factories)
				.unwrap(),
		)
	}

	fn app() -> (Router, Arc<DispatchEngine>, mpsc::UnboundedReceiver<InboundEvent>) {
		let engine = engine();
		let (inbound, rx) = mpsc::unbounded_channel();
		let state = AppState {
			engine: engine.clone(),
			inbound,
		};
		(router(&api_config(), state), engine, rx)
	}

	fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
		Request::post(uri)
			.header("content-type", "application/json")
			.body(Body::from(body.to_string()))
			.unwrap()
	}

	async fn json_body(response: Response) -> serde_json::Value {
		let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		serde_json::from_slice(&bytes).unwrap()
	}

	#[tokio::test]
	async fn test_health() {
		let (app, _, _rx) = app();

		let response = app
			.oneshot(Request::get("/health").body(Body::empty()).unwrap())
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::OK);
		let body = json_body(response).await;
		assert_eq!(body["status"], "ok");
		assert_eq!(body["pendingPolls"], 0);
	}

	#[tokio::test]
	async fn test_event_is_forwarded_to_engine() {
		let (app, _, mut rx) = app();

		let response = app
			.oneshot(post(
				"/api/events",
				json!({ "orderId": "o-1", "sequence": 7, "type": "CANCEL_ORDER" }),
			))
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::ACCEPTED);
		let event = rx.try_recv().unwrap();
		assert_eq!(event.order_id, "o-1");
		assert_eq!(event.sequence, 7);
		assert_eq!(event.payload, InboundPayload::CancelOrder);
	}

	#[tokio::test]
	async fn test_create_order_assigns_id() {
		let (app, _, mut rx) = app();

		let response = app
			.oneshot(post(
				"/api/orders",
				json!({
					"originId": "restaurant-1",
					"destinationId": "customer-1",
					"pickupLocation": { "lat": 1.3, "long": 103.8 },
					"dropoffLocation": { "lat": 1.31, "long": 103.81 },
					"demographicArea": "A"
				}),
			))
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::ACCEPTED);
		let body = json_body(response).await;
		let event = rx.try_recv().unwrap();
		assert_eq!(body["orderId"], event.order_id.as_str());
		assert_eq!(event.sequence, 1);
		match event.payload {
			InboundPayload::NewOrder { order } => {
				assert_eq!(order.pickup_location, GeoPoint::new(1.3, 103.8));
			},
			other => panic!("unexpected payload {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_webhook_maps_provider_status() {
		let (app, _, mut rx) = app();

		let response = app
			.oneshot(post(
				"/api/webhooks/acme",
				json!({ "orderId": "o-1", "sequence": 3, "status": "PICKED_UP" }),
			))
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::ACCEPTED);
		assert_eq!(
			rx.try_recv().unwrap().payload,
			InboundPayload::OrderUpdate {
				provider: Some("acme".into()),
				provider_status: ProviderStatus::InProgress,
			}
		);
	}

	#[tokio::test]
	async fn test_webhook_for_unknown_provider() {
		let (app, _, mut rx) = app();

		let response = app
			.oneshot(post(
				"/api/webhooks/nobody",
				json!({ "orderId": "o-1", "sequence": 3, "status": "DELIVERED" }),
			))
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::NOT_FOUND);
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn test_get_order() {
		let (app, engine, _rx) = app();
		let event: InboundEvent = serde_json::from_value(json!({
			"orderId": "o-1",
			"sequence": 1,
			"type": "NEW_ORDER",
			"order": {
				"originId": "restaurant-1",
				"destinationId": "customer-1",
				"pickupLocation": { "lat": 1.3, "long": 103.8 },
				"dropoffLocation": { "lat": 1.31, "long": 103.81 },
				"demographicArea": "A"
			}
		}))
		.unwrap();
		tokio_test::assert_ok!(engine.orchestrator().handle_inbound(event).await);

		let response = app
			.clone()
			.oneshot(Request::get("/api/orders/o-1").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		let order: Order = serde_json::from_value(json_body(response).await).unwrap();
		assert_eq!(order.state, OrderState::Accepted);
		assert_eq!(order.history.len(), 4);

		let response = app
			.oneshot(Request::get("/api/orders/o-2").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn test_closed_engine_is_unavailable() {
		let (app, _, rx) = app();
		drop(rx);

		let response = app
			.oneshot(post(
				"/api/events",
				json!({ "orderId": "o-1", "sequence": 2, "type": "ORIGIN_ORDER_ACK" }),
			))
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
	}
}
