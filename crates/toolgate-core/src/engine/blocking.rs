//! Blocking facade over the async engine.
//!
//! There is one state machine: this type drives [`Engine`] on a private
//! current-thread runtime instead of reimplementing the pipeline. Intended
//! for synchronous callers (scripts, CLI demos); must not be used from
//! inside an async runtime.

use std::sync::Arc;

use super::{CallArgs, CallOptions, Engine, EngineError};

/// Synchronous wrapper owning a private runtime.
pub struct BlockingEngine {
    engine: Arc<Engine>,
    runtime: tokio::runtime::Runtime,
}

impl BlockingEngine {
    /// Wraps an engine.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the private runtime cannot start.
    pub fn new(engine: Engine) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        Ok(Self {
            engine: Arc::new(engine),
            runtime,
        })
    }

    /// Returns the wrapped async engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Executes a guarded call with a blocking callable.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`Engine::execute`].
    ///
    /// # Panics
    ///
    /// Panics if called from within an async runtime; use the async engine
    /// there instead.
    pub fn execute<T, F, E>(
        &self,
        action: &str,
        call: CallArgs,
        options: CallOptions,
        func: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.runtime
            .block_on(
                self.engine
                    .execute(action, call, options, || async move { func() }),
            )
    }

    /// Outcome-logging failures since engine creation.
    #[must_use]
    pub fn outcome_error_count(&self) -> u64 {
        self.engine.outcome_error_count()
    }
}
