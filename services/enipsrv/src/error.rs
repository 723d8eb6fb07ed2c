//! Error handling for the EtherNet/IP driver service
//!
//! One taxonomy for the whole driver: configuration problems abort the
//! operation immediately, connection-class failures surface through status
//! events, IO-session failures roll the device back, capability rejections
//! are recovered locally and everything else mid-poll aborts the tick.

use enip_link::EnipError;
use thiserror::Error;

/// Result type alias for the driver service
pub type Result<T> = std::result::Result<T, EnipSrvError>;

/// Driver service error type
#[derive(Error, Debug, Clone)]
pub enum EnipSrvError {
    /// Configuration-related errors (missing address, incomplete explicit
    /// triple, malformed write buffer)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Messaging-channel connect failures
    #[error("Connection error: {0}")]
    Connection(String),

    /// Disconnect failures (the handle is force-released regardless)
    #[error("Disconnect error: {0}")]
    Disconnect(String),

    /// Cyclic IO session failures; `pending` names the sessions that never
    /// produced data, `ownership_conflict` flags the already-owned case
    #[error("IO session error: {message}")]
    IoSession {
        message: String,
        pending: Vec<String>,
        ownership_conflict: bool,
    },

    /// Failure in the middle of a poll cycle
    #[error("Polling error: {0}")]
    Poll(String),

    /// Operation rejected because another connect-class operation is in
    /// flight for the same device
    #[error("Device busy: {0}")]
    Busy(String),

    /// Protocol-level errors from the link layer
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Data handling errors (parsing, conversion)
    #[error("Data error: {0}")]
    Data(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EnipSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        EnipSrvError::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        EnipSrvError::Connection(msg.into())
    }

    pub fn disconnect(msg: impl Into<String>) -> Self {
        EnipSrvError::Disconnect(msg.into())
    }

    pub fn io_session(
        msg: impl Into<String>,
        pending: Vec<String>,
        ownership_conflict: bool,
    ) -> Self {
        EnipSrvError::IoSession {
            message: msg.into(),
            pending,
            ownership_conflict,
        }
    }

    pub fn poll(msg: impl Into<String>) -> Self {
        EnipSrvError::Poll(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        EnipSrvError::Busy(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        EnipSrvError::Protocol(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        EnipSrvError::Data(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        EnipSrvError::Timeout(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        EnipSrvError::Internal(msg.into())
    }
}

impl From<std::io::Error> for EnipSrvError {
    fn from(err: std::io::Error) -> Self {
        EnipSrvError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for EnipSrvError {
    fn from(err: serde_json::Error) -> Self {
        EnipSrvError::Data(format!("JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for EnipSrvError {
    fn from(err: serde_yaml::Error) -> Self {
        EnipSrvError::Data(format!("YAML: {err}"))
    }
}

impl From<EnipError> for EnipSrvError {
    fn from(err: EnipError) -> Self {
        match err {
            EnipError::Connection(msg) => EnipSrvError::Connection(msg),
            EnipError::NotConnected => EnipSrvError::Connection("Not connected".to_string()),
            EnipError::Timeout(msg) => EnipSrvError::Timeout(msg),
            EnipError::InvalidData(msg) => EnipSrvError::Data(msg),
            other => EnipSrvError::Protocol(other.to_string()),
        }
    }
}
