//! Error types for scratchpad-core.

use thiserror::Error;

/// Result type for scratchpad-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in scratchpad-core.
///
/// Script-level failures (diagnostics, thrown values) are not errors: they
/// travel to the host as dump events.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The worker process could not be launched.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// The worker binary could not be located.
    #[error("worker binary not found: {0}")]
    WorkerNotFound(String),

    /// No worker could be started after the configured number of attempts.
    #[error("execution host unavailable: {0}")]
    HostUnavailable(String),

    /// Worker startup was cancelled, usually by a concurrent reset.
    #[error("worker startup was cancelled")]
    Cancelled,

    /// The worker reported a fault while handling a call.
    #[error("worker fault: {0}")]
    Remote(String),

    /// The channel to the worker closed before the call completed.
    #[error("channel to worker closed")]
    ChannelClosed,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Render the error together with a recovery hint for terminal display.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::WorkerNotFound(_) => Some(
                "build it with `cargo build -p scratchpad-worker` or set SCRATCHPAD_WORKER_PATH",
            ),
            Error::HostUnavailable(_) => {
                Some("the worker failed to start twice in a row; run with -v to see its output")
            }
            Error::ChannelClosed => {
                Some("the worker died while running; the next execution starts a fresh one")
            }
            Error::Cancelled => Some("a reset replaced the worker before it was ready; try again"),
            _ => None,
        };

        match hint {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_is_appended() {
        let rendered = Error::ChannelClosed.with_hint();
        assert!(rendered.starts_with("channel to worker closed"));
        assert!(rendered.contains("hint:"));
    }

    #[test]
    fn test_no_hint_for_plain_errors() {
        let err = Error::Ipc("broken pipe".to_string());
        assert_eq!(err.with_hint(), "IPC error: broken pipe");
    }
}
