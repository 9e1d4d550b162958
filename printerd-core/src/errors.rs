use thiserror::Error;

/// Raised when a code cannot be constructed from its textual form.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ParseError {
    pub reason: String,
}

impl ParseError {
    pub fn new(reason: impl Into<String>) -> ParseError {
        ParseError {
            reason: reason.into(),
        }
    }
}

/// Error taxonomy of the execution pipeline. The pipeline matches on these
/// variants, so the execution path carries this type rather than an opaque
/// error.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("bad code: {0}")]
    Parse(#[from] ParseError),

    /// Cooperative cancellation. Re-raised after result finalization so the
    /// caller observes it, with the code's result cleared.
    #[error("code has been cancelled")]
    Cancelled,

    /// The code is intentionally unhandled. Converted to an `Error` message
    /// inside the handler layer, never raised past it.
    #[error("code is not supported")]
    NotSupported,

    /// Unexpected failure inside an internal handler. Logged, then rethrown;
    /// the code is not forwarded to the firmware.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Firmware dispatch failure.
    #[error("firmware transport failed: {0}")]
    Transport(String),

    /// Internal state machine violation.
    #[error("invariant violated: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExecutionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionError::Cancelled)
    }
}
