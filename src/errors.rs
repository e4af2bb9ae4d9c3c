//! Repository of all error types for this crate using [thiserror]
use thiserror::Error;

/// Errors produced by the session engine.
///
/// All of them are recoverable at the protocol boundary: they are reported
/// back to the client as `{successful: false, error}` and never bring the
/// server down. A long-poll timeout is not an error and has no variant here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BayeuxError {
    #[error("unknown session")]
    UnknownSession,

    #[error("invalid channel pattern `{0}`")]
    InvalidPattern(String),

    #[error("invalid channel `{0}`")]
    InvalidChannel(String),

    #[error("a connect is already waiting for this session")]
    AlreadyWaiting,

    #[error("session expired")]
    SessionExpired,

    #[error("session disconnected")]
    Disconnected,

    #[error("unsupported connection type `{0}`")]
    UnsupportedConnectionType(String),
}

impl BayeuxError {
    /// Stable name used on the wire (`{"error": "SessionExpired"}`)
    pub fn code(&self) -> &'static str {
        match self {
            BayeuxError::UnknownSession => "UnknownSession",
            BayeuxError::InvalidPattern(_) => "InvalidPattern",
            BayeuxError::InvalidChannel(_) => "InvalidChannel",
            BayeuxError::AlreadyWaiting => "AlreadyWaiting",
            BayeuxError::SessionExpired => "SessionExpired",
            BayeuxError::Disconnected => "Disconnected",
            BayeuxError::UnsupportedConnectionType(_) => "UnsupportedConnectionType",
        }
    }
}

/// Why a parked connect was released without messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    SessionExpired,
    Disconnected,
}

impl From<CancelReason> for BayeuxError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::SessionExpired => BayeuxError::SessionExpired,
            CancelReason::Disconnected => BayeuxError::Disconnected,
        }
    }
}

/// Errors triggered while building a [crate::server::Server] using
/// [crate::server::ServerBuilder]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ServerBuilderError {
    #[error("no address provided")]
    NoAddress,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Represent errors that happen during the [crate::server::Server] setup
/// and main loop
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ServerError {
    #[error("bind")]
    Bind(String),

    #[error("http serve: {0}")]
    Serve(String),

    #[error("Run")]
    Run,
}
