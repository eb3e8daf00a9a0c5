//! Order state management.
//!
//! This module provides the state machine for order lifecycle transitions and
//! the persistence of order records.

pub mod order;

pub use order::{OrderStateError, OrderStateMachine};
