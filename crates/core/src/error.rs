//! Error types for droid-waiter
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// Error returned by a single bounded wait.
///
/// `E` is the error type of the polled [`EventSource`](crate::source::EventSource).
/// Timeouts and exhaustion are not errors; they are reported through
/// [`WaitOutcome`](crate::waiter::WaitOutcome).
#[derive(Error, Debug)]
pub enum WaitError<E> {
    /// Rejected before the first poll
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The source failed with something other than a timeout
    #[error("Event source failed: {0}")]
    Source(#[source] E),
}

impl<E> WaitError<E> {
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, WaitError::InvalidArgument(_))
    }

    /// Unwrap the transport failure, if that is what this is
    pub fn into_source(self) -> Option<E> {
        match self {
            WaitError::Source(e) => Some(e),
            WaitError::InvalidArgument(_) => None,
        }
    }
}

/// Failures of [`EventSubscription`](crate::events::EventSubscription)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Event bus disconnected")]
    Disconnected,
}

/// Failures injected into a [`ScriptedEventSource`](crate::script::ScriptedEventSource)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Injected transport failure: {0}")]
    Injected(String),
}

/// Main error type for droid-waiter
#[derive(Error, Debug)]
pub enum WaiterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Result type alias for droid-waiter operations
pub type Result<T> = std::result::Result<T, WaiterError>;

impl WaiterError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WaiterError::Timeout(_) | WaiterError::Cancelled)
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            WaiterError::Io(e) => format!("File operation failed: {}", e),
            WaiterError::Config(msg) => format!("Configuration error: {}", msg),
            WaiterError::TomlParse(e) => format!("Could not parse TOML: {}", e),
            WaiterError::Timeout(msg) => format!("Timed out: {}", msg),
            WaiterError::Cancelled => "Operation was cancelled".to_string(),
            _ => self.to_string(),
        }
    }
}
