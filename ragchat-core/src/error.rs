//! Error types for the ragchat session engine.
//!
//! Uses `thiserror` for public API error types. Turn failures are ordinary
//! values that drive the session into its `Error` phase; only caller bugs
//! (such as submitting while a request is in flight) surface as `Err`.

use std::path::PathBuf;

use crate::types::ErrorMessage;

/// Errors raised while wiring up a controller from configuration.
#[derive(Debug, thiserror::Error)]
pub enum RagchatError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tokenizer error: {message}")]
    Tokenizer { message: String },
}

/// Failures of a single question/answer turn.
///
/// Every variant is recoverable: the controller converts it into an
/// [`ErrorMessage`] and the user may retry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TurnError {
    /// A collaborator answered with a non-success status.
    #[error("{message}")]
    Collaborator {
        code: Option<String>,
        message: String,
    },

    /// The request never completed (connection, read, or decode failure).
    #[error("Transport failure: {message}")]
    Transport { message: String },
}

impl TurnError {
    pub fn collaborator(message: impl Into<String>) -> Self {
        TurnError::Collaborator {
            code: None,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        TurnError::Transport {
            message: message.into(),
        }
    }
}

impl From<TurnError> for ErrorMessage {
    fn from(err: TurnError) -> Self {
        match err {
            TurnError::Collaborator { code, message } => ErrorMessage {
                code: code.unwrap_or_else(|| "collaborator_error".to_string()),
                message,
            },
            TurnError::Transport { message } => ErrorMessage {
                code: "transport_error".to_string(),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for TurnError {
    fn from(err: reqwest::Error) -> Self {
        TurnError::transport(err.to_string())
    }
}

/// Illegal uses of the session state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Input text is empty")]
    EmptyInput,

    #[error("A request is already in flight")]
    Busy,
}

/// Errors from the durable key-value store.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Storage I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stored data is malformed: {message}")]
    Malformed { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration parse error: {0}")]
    Extract(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// A type alias for results using the top-level `RagchatError`.
pub type Result<T> = std::result::Result<T, RagchatError>;
