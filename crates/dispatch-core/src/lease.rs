//! Per-order leases.
//!
//! At most one transition per order runs at a time. Distinct orders never
//! contend. Entries are dropped from the map once no holder or waiter
//! remains.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

#[derive(Clone, Default)]
pub struct LeaseManager {
	locks: Arc<LockMap>,
}

impl LeaseManager {
	pub fn new() -> Self {
		Self::default()
	}

	/// Waits until the order is free and takes its lease.
	pub async fn acquire(&self, order_id: &str) -> Lease {
		let lock = self
			.locks
			.entry(order_id.to_string())
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone();

		let guard = lock.lock_owned().await;
		Lease {
			order_id: order_id.to_string(),
			guard: Some(guard),
			locks: self.locks.clone(),
		}
	}

	/// Number of orders with a holder or waiters.
	pub fn active(&self) -> usize {
		self.locks.len()
	}
}

/// Exclusive hold on one order, released on drop.
pub struct Lease {
	order_id: String,
	guard: Option<OwnedMutexGuard<()>>,
	locks: Arc<LockMap>,
}

impl Lease {
	pub fn order_id(&self) -> &str {
		&self.order_id
	}
}

impl Drop for Lease {
	fn drop(&mut self) {
		self.guard.take();
		// Only the map still references the mutex: nobody is waiting.
		self.locks
			.remove_if(&self.order_id, |_, lock| Arc::strong_count(lock) == 1);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::time::Duration;

	#[tokio::test]
	async fn test_same_order_is_serialized() {
		let leases = LeaseManager::new();
		let inside = Arc::new(AtomicU32::new(0));
		let max_inside = Arc::new(AtomicU32::new(0));

		let tasks: Vec<_> = (0..8)
			.map(|_| {
				let leases = leases.clone();
				let inside = inside.clone();
				let max_inside = max_inside.clone();
				tokio::spawn(async move {
					let _lease = leases.acquire("o-1").await;
					let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
					max_inside.fetch_max(now, Ordering::SeqCst);
					tokio::time::sleep(Duration::from_millis(5)).await;
					inside.fetch_sub(1, Ordering::SeqCst);
				})
			})
			.collect();

		for task in tasks {
			task.await.unwrap();
		}

		assert_eq!(max_inside.load(Ordering::SeqCst), 1);
		assert_eq!(leases.active(), 0);
	}

	#[tokio::test]
	async fn test_distinct_orders_do_not_block() {
		let leases = LeaseManager::new();
		let _first = leases.acquire("o-1").await;

		let second = tokio::time::timeout(Duration::from_millis(50), leases.acquire("o-2")).await;
		assert!(second.is_ok());
		assert_eq!(leases.active(), 2);
	}
}
