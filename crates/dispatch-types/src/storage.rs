//! Storage namespaces.

use std::str::FromStr;

/// Namespaces under which records are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	/// Order records owned by the orchestrator.
	Orders,
	/// Pending-order queue entries for poll-based providers.
	PendingOrders,
}

impl StorageKey {
	pub const fn as_str(&self) -> &'static str {
		match self {
			StorageKey::Orders => "orders",
			StorageKey::PendingOrders => "pending_orders",
		}
	}

	pub fn all() -> impl Iterator<Item = Self> {
		[Self::Orders, Self::PendingOrders].into_iter()
	}
}

impl FromStr for StorageKey {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"orders" => Ok(Self::Orders),
			"pending_orders" => Ok(Self::PendingOrders),
			_ => Err(()),
		}
	}
}

impl From<StorageKey> for &'static str {
	fn from(key: StorageKey) -> Self {
		key.as_str()
	}
}
