use thiserror::Error;

/// Every fallible operation in the engine surfaces one of these kinds.
///
/// Detector and scorer failures are deliberately absent: they are caught at
/// the ingest boundary and logged, because partial analysis is more useful
/// than a failed ingest.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The event is missing a required field, or its id is already known.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// TimeQL syntax violation, with the offending token and byte position.
    #[error("parse error at byte {position} near `{token}`: {message}")]
    Parse {
        message: String,
        token: String,
        position: usize,
    },

    /// A condition references a field that cannot be resolved on events.
    #[error("unknown field `{0}` in condition")]
    UnknownField(String),

    /// An event id referenced by a query does not exist.
    #[error("event not found: {0}")]
    NotFound(String),

    /// The query exceeded its deadline.
    #[error("query timed out")]
    Timeout,

    /// The query was cancelled by its caller.
    #[error("query cancelled")]
    Cancelled,

    /// An internal invariant was violated. Surfaced for tests; should not
    /// occur in normal operation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub(crate) fn parse(message: impl Into<String>, token: impl Into<String>, position: usize) -> Self {
        Self::Parse {
            message: message.into(),
            token: token.into(),
            position,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
