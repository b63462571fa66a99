//! Error types for CamLink signaling

use thiserror::Error;

/// Result type alias for CamLink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up or tearing down a call
#[derive(Debug, Error)]
pub enum Error {
    /// The session code already hosts an active session
    #[error("Session code already in use: {0}")]
    CodeConflict(String),

    /// No offer has been published under the session code (yet)
    #[error("No session found for code: {0}")]
    CodeNotFound(String),

    /// The typed session code is not six decimal digits
    #[error("Invalid session code: {0}")]
    InvalidCode(String),

    /// A store value could not be decoded into a signaling message
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The media engine rejected a remote session description
    #[error("Incompatible session description: {0}")]
    IncompatibleDescription(String),

    /// The media engine rejected a remote ICE candidate
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    /// Transport-level failure reaching the rendezvous store
    #[error("Rendezvous store unavailable: {0}")]
    StoreUnavailable(String),

    /// Media engine failure outside of description/candidate handling
    #[error("Media engine error: {0}")]
    MediaError(String),

    /// Operation not valid in the current signaling state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Discriminant of [`Error`], stable across the error's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CodeConflict,
    CodeNotFound,
    InvalidCode,
    MalformedMessage,
    IncompatibleDescription,
    InvalidCandidate,
    StoreUnavailable,
    MediaError,
    InvalidState,
    InvalidConfig,
    Io,
    Serialization,
}

impl ErrorKind {
    /// Get the kind name for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CodeConflict => "code_conflict",
            ErrorKind::CodeNotFound => "code_not_found",
            ErrorKind::InvalidCode => "invalid_code",
            ErrorKind::MalformedMessage => "malformed_message",
            ErrorKind::IncompatibleDescription => "incompatible_description",
            ErrorKind::InvalidCandidate => "invalid_candidate",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::MediaError => "media_error",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CodeConflict(_) => ErrorKind::CodeConflict,
            Error::CodeNotFound(_) => ErrorKind::CodeNotFound,
            Error::InvalidCode(_) => ErrorKind::InvalidCode,
            Error::MalformedMessage(_) => ErrorKind::MalformedMessage,
            Error::IncompatibleDescription(_) => ErrorKind::IncompatibleDescription,
            Error::InvalidCandidate(_) => ErrorKind::InvalidCandidate,
            Error::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Error::MediaError(_) => ErrorKind::MediaError,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Check if this error ends the call
    ///
    /// Media engine rejections close the session; everything else leaves it
    /// able to keep processing valid events.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::IncompatibleDescription(_) | Error::InvalidCandidate(_) | Error::MediaError(_)
        )
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::CodeNotFound(_) | Error::Io(_)
        )
    }
}
