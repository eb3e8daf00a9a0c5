//! Per-order backlog of inbound events.
//!
//! Events for one order are handed out in the order they were received, and
//! only one drainer per order exists at a time. An order's entry lives in
//! the map exactly as long as its drainer runs.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dispatch_types::InboundEvent;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct OrderBacklog {
	pending: Arc<DashMap<String, VecDeque<InboundEvent>>>,
}

impl OrderBacklog {
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends `event` behind any earlier events for its order. Returns true
	/// when the order had no drainer and the caller must start one.
	pub fn push(&self, event: InboundEvent) -> bool {
		match self.pending.entry(event.order_id.clone()) {
			Entry::Occupied(mut queued) => {
				queued.get_mut().push_back(event);
				false
			},
			Entry::Vacant(slot) => {
				slot.insert(VecDeque::from([event]));
				true
			},
		}
	}

	/// Next event for `order_id`. Returns `None` once the backlog is empty,
	/// at which point the drainer must stop.
	pub fn next(&self, order_id: &str) -> Option<InboundEvent> {
		loop {
			if let Some(mut queued) = self.pending.get_mut(order_id) {
				if let Some(event) = queued.pop_front() {
					return Some(event);
				}
			}
			// A push may land between the pop and the removal; retry then.
			if self
				.pending
				.remove_if(order_id, |_, queued| queued.is_empty())
				.is_some() || !self.pending.contains_key(order_id)
			{
				return None;
			}
		}
	}

	/// Orders with a running drainer.
	pub fn active(&self) -> usize {
		self.pending.len()
	}
}
