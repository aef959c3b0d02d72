//! Process-level handling of unrecoverable inconsistencies.

use crate::failure::Cause;

/// Receives conditions after which the process must not continue.
pub trait FatalHandler: Send + Sync {
    /// Handles a fatal condition. Production handlers do not return.
    fn crash(&self, reason: &str, cause: Option<&Cause>);
}

/// Logs the condition and aborts the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortOnFatal;

impl FatalHandler for AbortOnFatal {
    fn crash(&self, reason: &str, cause: Option<&Cause>) {
        match cause {
            Some(cause) => tracing::error!(reason, error = %cause, "fatal replication error"),
            None => tracing::error!(reason, "fatal replication error"),
        }
        std::process::abort();
    }
}
