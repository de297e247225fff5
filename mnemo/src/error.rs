use serde_derive::{Deserialize, Serialize};

/// Result alias used across every engine in the crate.
pub type MResult<T> = Result<T, Error>;

/// Crate-level error type.
///
/// Errors are plain values; they never cross an engine boundary as a panic.
/// Sentinel "no result" outcomes (empty state, missing concept, refused
/// admission) are `Ok(None)` / `Ok(false)` at the call site, not errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A caller-supplied argument or configuration value is unusable.
    InvalidInput(String),

    /// Serialized state that could not be decoded (truncation, bad counts).
    Parse(String),

    /// A rejected state transition, e.g. registering the same block twice
    /// or rolling back a concept that has no chain.
    Value(String),

    /// A filesystem failure from the persistence layer.
    Io(String),

    /// An internal inconsistency. Seeing this is a bug.
    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Value(msg) => write!(f, "{}", msg),
            Error::Io(msg) => write!(f, "io error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}
