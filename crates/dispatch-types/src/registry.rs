//! Self-registration contract for pluggable implementations.

/// Implemented by the `Registry` struct of every storage backend, queue
/// backend and provider adapter.
///
/// `NAME` is the key used under `implementations` (or `implementation = ...`)
/// in the TOML configuration; `factory()` hands back the constructor the
/// builder calls with that section.
pub trait ImplementationRegistry {
	/// Configuration key, for example `"memory"` for
	/// `[storage.implementations.memory]` or `"webhook"` for a provider.
	const NAME: &'static str;

	/// Factory function type of the owning service.
	type Factory;

	fn factory() -> Self::Factory;
}
