//! Background monitoring of orders waiting on providers.
//!
//! The reconciler polls providers that never push updates. The deadline
//! tracker notices providers that stay silent past the fulfillment deadline.

pub mod deadline;
pub mod reconciler;

pub use deadline::DeadlineTracker;
pub use reconciler::{CycleReport, PollingReconciler, ReconcileError};
