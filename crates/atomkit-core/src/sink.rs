use std::fmt;

use tracing::error;

/// A work item that escaped with an error or a panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkFailure {
    /// Name of the worker thread that ran the item.
    pub thread: String,
    /// `"panic"` for unwinding panics, otherwise the error's type description.
    pub kind: String,
    pub message: String,
    pub backtrace: Option<String>,
}

impl fmt::Display for WorkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rescued:\n{}: {}", self.thread, self.kind, self.message)?;
        if let Some(backtrace) = &self.backtrace {
            write!(f, "\n{}", backtrace)?;
        }
        Ok(())
    }
}

/// Receives failures from pool workers. Called exactly once per failure;
/// the worker keeps running afterwards.
pub trait ErrorSink: Send + Sync {
    fn report(&self, failure: &WorkFailure);
}

/// Default sink: one `error!` event per failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, failure: &WorkFailure) {
        error!(
            thread = %failure.thread,
            kind = %failure.kind,
            backtrace = failure.backtrace.as_deref().unwrap_or(""),
            "work item failed: {}",
            failure.message
        );
    }
}

impl<F> ErrorSink for F
where
    F: Fn(&WorkFailure) + Send + Sync,
{
    fn report(&self, failure: &WorkFailure) {
        self(failure)
    }
}
