//! Core of the delivery dispatcher.
//!
//! This crate owns the order lifecycle. The [`Orchestrator`] applies inbound
//! and internal events to orders under a per-order lease, drives provider
//! selection and fulfillment requests, and publishes every state change.
//! The [`PollingReconciler`] bridges poll-based providers back into the
//! event model, the deadline sweeper turns silent providers into
//! rejections, and [`RecoveryService`] re-drives unfinished work after a
//! restart. [`DispatchEngine`] runs all of it; [`DispatchBuilder`] wires it
//! from configuration.

pub mod builder;
pub mod engine;
pub mod lease;
pub mod monitoring;
pub mod orchestrator;
pub mod recovery;
pub mod state;

pub use builder::{BuilderError, DispatchBuilder, DispatchFactories};
pub use engine::{event_bus::EventBus, DispatchEngine, EngineError};
pub use lease::{Lease, LeaseManager};
pub use monitoring::{CycleReport, DeadlineTracker, PollingReconciler, ReconcileError};
pub use orchestrator::{EventOutcome, Orchestrator, OrchestratorError};
pub use recovery::{RecoveryAction, RecoveryError, RecoveryReport, RecoveryService};
pub use state::{OrderStateError, OrderStateMachine};
