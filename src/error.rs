//! Error types for the dispatch runtime

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for the dispatch runtime
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Coarse classification of a [`DispatchError`].
///
/// Callers use this to tell "the system is misconfigured" apart from "this run
/// went wrong", "the backend is flaky", and "the caller gave up".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Fatal, detected at startup or registry construction.
    Configuration,
    /// Terminal for the current run only.
    Protocol,
    /// Backend trouble; retries belong to the adapter stack.
    Transient,
    /// The caller cancelled the run.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Main error type for the dispatch runtime
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// A required configuration value is absent
    #[error("Missing configuration value: {key}")]
    MissingConfig { key: String },

    /// A configuration value could not be parsed
    #[error("Invalid configuration value for {key}: {value:?}")]
    InvalidConfig { key: String, value: String },

    /// A `.env` file exists but could not be read or parsed
    #[error("Failed to load {path}: {message}")]
    EnvFile { path: String, message: String },

    /// A responder with this name is already registered
    #[error("Duplicate responder name: {name}")]
    DuplicateName { name: String },

    /// No responder with this name is registered
    #[error("Unknown responder: {name}")]
    UnknownResponder { name: String },

    /// The registry has no designated entry point
    #[error("No root responder configured")]
    NoRootConfigured,

    /// A transfer-set names a responder that is not registered
    #[error("Responder {from} lists unknown transfer target {to}")]
    DanglingTransfer { from: String, to: String },

    /// A registry file could not be read or parsed
    #[error("Registry format error: {message}")]
    RegistryFormat { message: String },

    /// The backend asked for a transfer the current responder may not make
    #[error("Illegal transfer from {from} to {to}")]
    IllegalTransfer { from: String, to: String },

    /// A transfer revisits a responder while revisits are forbidden
    #[error("Cycle detected: {target} was already visited (path: {})", path.join(" -> "))]
    CycleDetected { target: String, path: Vec<String> },

    /// The run made more transfers than allowed
    #[error("Hop limit exceeded: {max_hops}")]
    HopLimitExceeded { max_hops: usize },

    /// The overall run deadline elapsed before an answer was produced
    #[error("Run deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded { deadline_ms: u64 },

    /// Network, auth, rate-limit or timeout failure talking to the backend
    #[error("Backend unavailable: {message}")]
    BackendUnavailable { message: String },

    /// The backend answered with something that could not be interpreted
    #[error("Backend protocol error: {message}")]
    BackendProtocol { message: String },

    /// The caller cancelled the run
    #[error("Run cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::MissingConfig { .. }
            | DispatchError::InvalidConfig { .. }
            | DispatchError::EnvFile { .. }
            | DispatchError::DuplicateName { .. }
            | DispatchError::UnknownResponder { .. }
            | DispatchError::NoRootConfigured
            | DispatchError::DanglingTransfer { .. }
            | DispatchError::RegistryFormat { .. } => ErrorKind::Configuration,
            DispatchError::IllegalTransfer { .. }
            | DispatchError::CycleDetected { .. }
            | DispatchError::HopLimitExceeded { .. }
            | DispatchError::DeadlineExceeded { .. }
            | DispatchError::BackendProtocol { .. } => ErrorKind::Protocol,
            DispatchError::BackendUnavailable { .. } => ErrorKind::Transient,
            DispatchError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled)
    }
}

impl From<toml::de::Error> for DispatchError {
    fn from(err: toml::de::Error) -> Self {
        DispatchError::RegistryFormat {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError::RegistryFormat {
            message: err.to_string(),
        }
    }
}
