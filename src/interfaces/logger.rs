//! Error sink contract.

/// Formatted error sink for protocol-level failures.
///
/// The pipeline never aborts on a runtime error; it reports through this
/// contract and degrades. Swap in an implementation to forward into an
/// application's own reporting channel.
pub trait Logger: Send + Sync {
    fn error(&self, message: &str);
}

/// Default sink: forwards to the `tracing` error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }
}
