//! Scoped execution context for a single encoding run.
//!
//! Everything that loads or uses a checkpoint happens inside
//! [`with_run_context`]. The context is a guard: its teardown runs when the
//! closure returns a value, returns an error, or unwinds.

use std::time::Instant;

use tracing::span::EnteredSpan;

use crate::error::{Error, Result};

/// Configuration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Number of processes taking part in the run. Only 1 is supported.
    pub nranks: usize,
    /// Experiment name, attached to every log event of the run
    pub experiment: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            nranks: 1,
            experiment: "temp".to_string(),
        }
    }
}

/// Guard for an open run. Closing happens on drop.
pub struct RunContext {
    config: RunConfig,
    started: Instant,
    _span: EnteredSpan,
}

impl RunContext {
    /// Open a run context.
    ///
    /// Fails when the configuration asks for more than one process.
    pub fn enter(config: RunConfig) -> Result<Self> {
        if config.nranks != 1 {
            return Err(Error::Config(format!(
                "nranks must be 1 (multi-process execution is not supported), got {}",
                config.nranks
            )));
        }

        let span = tracing::info_span!(
            "run",
            experiment = %config.experiment,
            nranks = config.nranks
        )
        .entered();
        tracing::debug!("run.context.opened");

        Ok(Self {
            config,
            started: Instant::now(),
            _span: span,
        })
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        tracing::debug!(
            experiment = %self.config.experiment,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            panicking = std::thread::panicking(),
            "run.context.closed"
        );
    }
}

/// Execute a closure inside a run context.
///
/// Values created inside the closure (the loaded checkpoint in particular)
/// are dropped before the context itself closes.
pub fn with_run_context<F, T>(config: RunConfig, f: F) -> Result<T>
where
    F: FnOnce(&RunContext) -> Result<T>,
{
    let ctx = RunContext::enter(config)?;
    let result = f(&ctx);
    drop(ctx);
    result
}
