//! Error types for pipecast

use std::process::ExitCode;
use thiserror::Error;

/// Main error type for broadcast server operations
#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("Failed to bind endpoint {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid endpoint: {endpoint}")]
    InvalidEndpoint { endpoint: String },

    #[error("Invalid command: {message}")]
    InvalidCommand { message: String },

    #[error("Verb '{verb}' is not supported by {class}")]
    UnsupportedVerb { verb: String, class: String },

    #[error("Unknown server: {name}")]
    UnknownServer { name: String },

    #[error("Server already exists: {name}")]
    DuplicateServer { name: String },

    #[error("Server {name} is already configured")]
    AlreadyConfigured { name: String },

    #[error("Server {name} is not running")]
    NotRunning { name: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BroadcastError {
    /// Exit code used by the binary when an error ends the process:
    /// - 1: IO / bind error
    /// - 2: Invalid command line, endpoint or configuration
    /// - 3: Server state error
    /// - 4: Internal invariant violation
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Bind { .. } | Self::Io(_) => ExitCode::from(1),
            Self::InvalidEndpoint { .. }
            | Self::InvalidCommand { .. }
            | Self::UnsupportedVerb { .. }
            | Self::Config { .. } => ExitCode::from(2),
            Self::UnknownServer { .. }
            | Self::DuplicateServer { .. }
            | Self::AlreadyConfigured { .. }
            | Self::NotRunning { .. } => ExitCode::from(3),
            Self::InvariantViolation(_) => ExitCode::from(4),
        }
    }

    /// True for errors that end a server loop rather than a single slot
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

/// Result type alias for pipecast operations
pub type Result<T> = std::result::Result<T, BroadcastError>;
