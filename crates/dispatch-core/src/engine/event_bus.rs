//! In-process broadcast of dispatcher events.
//!
//! Publishing never blocks and never fails the caller. Subscribers that fall
//! more than `capacity` events behind lose the oldest ones.

use dispatch_types::DispatchEvent;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct EventBus {
	sender: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
		self.sender.subscribe()
	}

	/// Returns the number of subscribers that received the event.
	pub fn publish(&self, event: DispatchEvent) -> usize {
		// No subscriber is not an error.
		self.sender.send(event).unwrap_or(0)
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(1000)
	}
}
