//! Dispatcher engine.
//!
//! Owns the wired services and runs the main loop. Inbound events are queued
//! per order in arrival order and drained by one task per order, bounded by
//! a semaphore, so distinct orders run in parallel while one order's events
//! are applied one after another. The reconciler, the deadline sweeper and
//! the settings watcher run in the background.

pub mod backlog;
pub mod event_bus;
pub mod lifecycle;

use backlog::OrderBacklog;
use crate::monitoring::{DeadlineTracker, PollingReconciler};
use crate::orchestrator::Orchestrator;
use crate::recovery::RecoveryService;
use crate::state::OrderStateMachine;
use chrono::Utc;
use dispatch_config::{Config, SettingsHandle, SettingsWatcher};
use dispatch_provider::ProviderService;
use dispatch_queue::QueueService;
use dispatch_storage::StorageService;
use dispatch_types::{truncate_id, InboundEvent};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Service error: {0}")]
	Service(String),
}

#[derive(Clone)]
pub struct DispatchEngine {
	pub(crate) config: Config,
	pub(crate) config_path: Option<PathBuf>,
	pub(crate) settings: SettingsHandle,
	pub(crate) storage: Arc<StorageService>,
	pub(crate) queue: Arc<QueueService>,
	pub(crate) providers: Arc<ProviderService>,
	pub(crate) state_machine: Arc<OrderStateMachine>,
	pub(crate) orchestrator: Arc<Orchestrator>,
	pub(crate) reconciler: Arc<PollingReconciler>,
	pub(crate) recovery: Arc<RecoveryService>,
	pub(crate) event_bus: event_bus::EventBus,
	backlog: OrderBacklog,
	inbound_tx: mpsc::UnboundedSender<InboundEvent>,
	inbound_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<InboundEvent>>>>,
}

impl DispatchEngine {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: Config,
		config_path: Option<PathBuf>,
		settings: SettingsHandle,
		storage: Arc<StorageService>,
		queue: Arc<QueueService>,
		providers: Arc<ProviderService>,
		event_bus: event_bus::EventBus,
	) -> Self {
		let state_machine = Arc::new(OrderStateMachine::new(storage.clone()));
		let deadlines = Arc::new(DeadlineTracker::new());

		let orchestrator = Arc::new(Orchestrator::new(
			state_machine.clone(),
			providers.clone(),
			queue.clone(),
			settings.clone(),
			deadlines,
			event_bus.clone(),
		));

		let reconciler = Arc::new(PollingReconciler::new(
			queue.clone(),
			providers.clone(),
			state_machine.clone(),
			orchestrator.clone(),
			settings.clone(),
		));

		let recovery = Arc::new(RecoveryService::new(
			state_machine.clone(),
			orchestrator.clone(),
		));

		let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

		Self {
			config,
			config_path,
			settings,
			storage,
			queue,
			providers,
			state_machine,
			orchestrator,
			reconciler,
			recovery,
			event_bus,
			backlog: OrderBacklog::new(),
			inbound_tx,
			inbound_rx: Arc::new(Mutex::new(Some(inbound_rx))),
		}
	}

	/// Main execution loop. Returns on ctrl-c.
	pub async fn run(&self) -> Result<(), EngineError> {
		let mut inbound_rx = self
			.inbound_rx
			.lock()
			.await
			.take()
			.ok_or_else(|| EngineError::Service("Engine is already running".into()))?;

		self.initialize().await?;

		let background = self.spawn_background_tasks();
		let semaphore = Arc::new(Semaphore::new(self.config.dispatch.max_concurrent_handlers));

		loop {
			tokio::select! {
				Some(event) = inbound_rx.recv() => {
					let order_id = event.order_id.clone();
					if self.backlog.push(event) {
						self.spawn_handler(&semaphore, move |engine| engine.drain(order_id))
							.await;
					}
				}

				_ = tokio::signal::ctrl_c() => {
					break;
				}
			}
		}

		for handle in background {
			handle.abort();
		}
		self.shutdown().await
	}

	/// Applies the backlog of one order until it is empty.
	async fn drain(self, order_id: String) {
		while let Some(event) = self.backlog.next(&order_id) {
			if let Err(e) = self.orchestrator.handle_inbound(event).await {
				tracing::error!(
					order_id = %truncate_id(&order_id),
					error = %e,
					"Failed to handle inbound event"
				);
			}
		}
	}

	fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
		let mut handles = vec![tokio::spawn(self.reconciler.clone().run())];

		let orchestrator = self.orchestrator.clone();
		let settings = self.settings.clone();
		handles.push(tokio::spawn(async move {
			loop {
				let sweep = settings.load().lifecycle.timeout_sweep_interval_seconds;
				tokio::time::sleep(Duration::from_secs(sweep)).await;
				let expired = orchestrator.expire_deadlines(Utc::now()).await;
				if expired > 0 {
					tracing::info!(expired, "Fulfillment deadlines elapsed");
				}
			}
		}));

		let reload = self.config.dispatch.reload_interval_seconds;
		if let (Some(path), true) = (self.config_path.clone(), reload > 0) {
			let watcher = SettingsWatcher::new(
				path,
				self.settings.clone(),
				self.config.providers.clone(),
				Duration::from_secs(reload),
			);
			handles.push(tokio::spawn(watcher.run()));
		}

		handles
	}

	/// Sender for events delivered by the event router.
	pub fn inbound_sender(&self) -> mpsc::UnboundedSender<InboundEvent> {
		self.inbound_tx.clone()
	}

	pub fn event_bus(&self) -> &event_bus::EventBus {
		&self.event_bus
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn settings(&self) -> &SettingsHandle {
		&self.settings
	}

	pub fn storage(&self) -> &Arc<StorageService> {
		&self.storage
	}

	pub fn queue(&self) -> &Arc<QueueService> {
		&self.queue
	}

	pub fn providers(&self) -> &Arc<ProviderService> {
		&self.providers
	}

	pub fn orchestrator(&self) -> &Arc<Orchestrator> {
		&self.orchestrator
	}

	pub fn reconciler(&self) -> &Arc<PollingReconciler> {
		&self.reconciler
	}

	pub fn recovery(&self) -> &Arc<RecoveryService> {
		&self.recovery
	}

	/// Spawns `handler` once a semaphore permit is available.
	async fn spawn_handler<F, Fut>(&self, semaphore: &Arc<Semaphore>, handler: F)
	where
		F: FnOnce(DispatchEngine) -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let engine = self.clone();
		match semaphore.clone().acquire_owned().await {
			Ok(permit) => {
				tokio::spawn(async move {
					let _permit = permit;
					handler(engine).await;
				});
			},
			Err(e) => {
				tracing::error!("Failed to acquire semaphore permit: {}", e);
			},
		}
	}
}
