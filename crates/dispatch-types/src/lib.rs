//! Common types module for the delivery dispatch system.
//!
//! This module defines the core data types and structures used throughout
//! the dispatcher. It provides a centralized location for shared types
//! to ensure consistency across the orchestrator, reconciler, provider
//! adapters and persistence layers.

/// Event types flowing in and out of the dispatcher.
pub mod events;
/// Order model, lifecycle states and audit history.
pub mod order;
/// Provider-facing types: status vocabulary, fulfillment outcomes, idempotency tokens.
pub mod provider;
/// Pending-order queue entries.
pub mod queue;
/// Registry trait for self-registering implementations.
pub mod registry;
/// Retry policy shared by every caller of a provider adapter.
pub mod retry;
/// Provider rule configuration and demographic areas.
pub mod rules;
/// Storage types for managing persistent data.
pub mod storage;
/// Utility functions for display formatting.
pub mod utils;
/// Configuration validation types for ensuring type-safe configurations.
pub mod validation;

pub use events::*;
pub use order::*;
pub use provider::*;
pub use queue::*;
pub use registry::ImplementationRegistry;
pub use retry::RetryPolicy;
pub use rules::*;
pub use storage::*;
pub use utils::truncate_id;
pub use validation::*;
