//! EtherNet/IP Link Error Types
//!
//! Core error types for the messaging and IO channels. CIP-level failures
//! keep their general/extended status codes so callers can match on the
//! specific conditions that drive recovery decisions.

use thiserror::Error;

/// CIP general status: requested service not supported by the target.
pub const GENERAL_STATUS_SERVICE_UNSUPPORTED: u8 = 0x08;

/// CIP general status: connection failure reported by the target.
pub const GENERAL_STATUS_CONNECTION_FAILURE: u8 = 0x01;

/// CIP extended status: connection already owned by another originator.
pub const EXTENDED_STATUS_OWNERSHIP_CONFLICT: u16 = 0x0106;

/// Result type for enip-link operations
pub type Result<T> = std::result::Result<T, EnipError>;

/// EtherNet/IP link errors
#[derive(Debug, Error, Clone)]
pub enum EnipError {
    /// CIP-level failure carrying the reply status codes
    #[error("CIP status 0x{general_status:02X}{}", extended_status.map(|e| format!(" (extended 0x{e:04X})")).unwrap_or_default())]
    Cip {
        general_status: u8,
        extended_status: Option<u16>,
    },

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Not supported by this backend
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for EnipError {
    fn from(err: std::io::Error) -> Self {
        EnipError::Io(err.to_string())
    }
}

// Helper methods for creating and classifying errors
impl EnipError {
    pub fn cip(general_status: u8, extended_status: Option<u16>) -> Self {
        EnipError::Cip {
            general_status,
            extended_status,
        }
    }

    pub fn service_unsupported() -> Self {
        EnipError::Cip {
            general_status: GENERAL_STATUS_SERVICE_UNSUPPORTED,
            extended_status: None,
        }
    }

    pub fn ownership_conflict() -> Self {
        EnipError::Cip {
            general_status: GENERAL_STATUS_CONNECTION_FAILURE,
            extended_status: Some(EXTENDED_STATUS_OWNERSHIP_CONFLICT),
        }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        EnipError::Connection(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        EnipError::Io(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        EnipError::Timeout(msg.into())
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        EnipError::InvalidData(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        EnipError::Internal(msg.into())
    }

    /// True iff the target rejected the service as unsupported (0x08).
    ///
    /// Tag-group reads fall back to per-tag reads on this status and on
    /// no other.
    pub fn is_service_unsupported(&self) -> bool {
        matches!(
            self,
            EnipError::Cip {
                general_status: GENERAL_STATUS_SERVICE_UNSUPPORTED,
                ..
            }
        )
    }

    /// True iff a forward-open was refused because another originator
    /// already owns the connection (0x01 / 0x0106).
    pub fn is_ownership_conflict(&self) -> bool {
        matches!(
            self,
            EnipError::Cip {
                general_status: GENERAL_STATUS_CONNECTION_FAILURE,
                extended_status: Some(EXTENDED_STATUS_OWNERSHIP_CONFLICT),
            }
        )
    }

    /// Check if this error indicates a need for reconnection
    pub fn needs_reconnect(&self) -> bool {
        match self {
            EnipError::Io(msg) => {
                msg.contains("Broken pipe")
                    || msg.contains("Connection reset")
                    || msg.contains("Connection refused")
                    || msg.contains("Connection aborted")
                    || msg.contains("Network is unreachable")
            },
            EnipError::Connection(_) => true,
            EnipError::NotConnected => true,
            _ => false,
        }
    }
}
