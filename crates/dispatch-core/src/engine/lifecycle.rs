//! Startup and shutdown of the dispatcher engine.

use super::{DispatchEngine, EngineError};

impl DispatchEngine {
	/// Recovers unfinished orders before any new event is accepted.
	pub async fn initialize(&self) -> Result<(), EngineError> {
		tracing::info!(dispatcher = %self.config.dispatch.id, "Initializing dispatcher engine");
		self.recovery
			.recover()
			.await
			.map_err(|e| EngineError::Service(e.to_string()))?;
		Ok(())
	}

	pub async fn shutdown(&self) -> Result<(), EngineError> {
		let pending = self
			.queue
			.len()
			.await
			.map_err(|e| EngineError::Service(e.to_string()))?;
		tracing::info!(pending_polls = pending, "Shutting down dispatcher engine");
		Ok(())
	}
}
