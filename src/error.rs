use crate::client::ConnectionState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, UspError>;

/// Client error taxonomy. Asynchronously surfaced errors (via the error
/// callback) carry their wire-facing descriptions verbatim in `Display`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UspError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation on an invalid or destroyed handle")]
    InvalidHandle,

    #[error("already initialized")]
    AlreadyInitialized,

    #[error("initialization failure: {0}")]
    InitializationFailure(String),

    #[error("wrong state for this operation: {0:?}")]
    WrongState(ConnectionState),

    #[error("Authentication error (401/403).")]
    AuthError,

    #[error("{0}")]
    ConnectionFailure(String),

    #[error("Connection was closed by the remote host.")]
    RemoteClosed,

    #[error("{0}")]
    TransportGeneric(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid enum value: {0}")]
    InvalidEnumValue(String),
}

impl From<usp_protocol::ProtocolError> for UspError {
    fn from(err: usp_protocol::ProtocolError) -> Self {
        UspError::TransportGeneric(err.to_string())
    }
}
