//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and map to a
//! host-API status code via [`Error::to_status_code`].

use thiserror::Error;

use super::ids::ObjectId;
use super::kinds::ObjectKind;
use super::status;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or startup errors (exit code 1).
    #[error("configuration error: {0}")]
    Config(String),

    /// Identifier already live in the local registry.
    #[error("duplicate object: {0}")]
    Duplicate(ObjectId),

    /// Identifier missing locally or bound to a different kind.
    #[error("invalid {kind}: {id}")]
    InvalidObject { id: ObjectId, kind: ObjectKind },

    /// Malformed frame, unknown kind or version skew.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection carrying a request or subscription went away.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Request deadline expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The remote driver rejected the call.
    #[error("remote error: code {0}")]
    Remote(i32),

    /// Invalid event or build state transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Caller-supplied argument rejected locally.
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convert to the status code a host-API caller observes.
    pub fn to_status_code(&self) -> i32 {
        match self {
            Error::InvalidObject { kind, .. } => kind.invalid_code(),
            Error::Duplicate(_) => status::INVALID_VALUE,
            Error::Remote(code) => *code,
            Error::ConnectionLost(_) => status::CONNECTION_LOST,
            Error::Timeout(_) => status::TIMEOUT,
            Error::Protocol(_) => status::PROTOCOL_ERROR,
            Error::StateTransition(_) => status::INVALID_OPERATION,
            Error::Validation(_) => status::INVALID_VALUE,
            Error::Config(_) | Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => {
                status::OUT_OF_RESOURCES
            }
        }
    }

    /// Whether a transparent reconnect may be attempted.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::ConnectionLost(_))
    }
}

// Convenience constructors
impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_object(id: ObjectId, kind: ObjectKind) -> Self {
        Self::InvalidObject { id, kind }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_object_maps_to_kind_code() {
        let err = Error::invalid_object(ObjectId::from_raw(999), ObjectKind::Kernel);
        assert_eq!(err.to_status_code(), status::INVALID_KERNEL);
        assert!(err.to_string().contains("invalid kernel"));
    }

    #[test]
    fn test_remote_code_passes_through() {
        assert_eq!(Error::Remote(-43).to_status_code(), -43);
    }

    #[test]
    fn test_transport_codes() {
        assert_eq!(Error::connection_lost("x").to_status_code(), status::CONNECTION_LOST);
        assert_eq!(Error::timeout("x").to_status_code(), status::TIMEOUT);
        assert!(Error::connection_lost("x").is_connection_lost());
        assert!(!Error::timeout("x").is_connection_lost());
    }
}
