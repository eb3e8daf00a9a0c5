//! Outbound forwarding of lifecycle events.
//!
//! Every `ORDER_STATE_CHANGED` published on the event bus is logged and,
//! when an outbound URL is configured, POSTed to the event router. Delivery
//! is best effort: failures are logged and the event is not retried.

use dispatch_types::{truncate_id, DispatchEvent, OrderStateChanged};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// Wire shape of an outbound state change.
#[derive(Debug, Serialize)]
struct OutboundEvent<'a> {
	#[serde(rename = "type")]
	kind: &'static str,
	#[serde(flatten)]
	change: &'a OrderStateChanged,
}

pub struct EventForwarder {
	client: reqwest::Client,
	outbound_url: Option<String>,
}

impl EventForwarder {
	pub fn new(outbound_url: Option<String>) -> Result<Self, reqwest::Error> {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(10))
			.build()?;

		match &outbound_url {
			Some(url) => tracing::info!("State changes will be forwarded to: {}", url),
			None => tracing::info!("No outbound URL configured, state changes are only logged"),
		}

		Ok(Self {
			client,
			outbound_url,
		})
	}

	/// Runs until the event bus closes.
	pub async fn run(self, mut events: broadcast::Receiver<DispatchEvent>) {
		loop {
			match events.recv().await {
				Ok(event) => self.forward(&event).await,
				Err(RecvError::Lagged(skipped)) => {
					tracing::warn!(skipped, "Event forwarder fell behind, events dropped");
				},
				Err(RecvError::Closed) => break,
			}
		}
	}

	async fn forward(&self, event: &DispatchEvent) {
		let change = match event {
			DispatchEvent::StateChanged(change) => change,
			DispatchEvent::Discarded {
				order_id,
				sequence,
				reason,
			} => {
				tracing::debug!(
					order_id = %truncate_id(order_id),
					sequence = ?sequence,
					reason = ?reason,
					"Event discarded"
				);
				return;
			},
		};

		tracing::info!(
			order_id = %truncate_id(&change.order_id),
			old_state = %change.old_state,
			new_state = %change.new_state,
			provider = change.provider.as_deref().unwrap_or("-"),
			"ORDER_STATE_CHANGED"
		);

		let Some(url) = &self.outbound_url else {
			return;
		};
		let body = OutboundEvent {
			kind: "ORDER_STATE_CHANGED",
			change,
		};
		match self.client.post(url).json(&body).send().await {
			Ok(response) if response.status().is_success() => {},
			Ok(response) => {
				tracing::warn!(
					order_id = %truncate_id(&change.order_id),
					status = %response.status(),
					"Event router rejected state change"
				);
			},
			Err(e) => {
				tracing::warn!(
					order_id = %truncate_id(&change.order_id),
					error = %e,
					"Failed to forward state change"
				);
			},
		}
	}
}
