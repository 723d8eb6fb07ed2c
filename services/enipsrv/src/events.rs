//! Host-facing events and sinks
//!
//! The driver reports status transitions and value updates over an
//! unbounded channel supplied by the host, and hands persist-worthy
//! changes to a DAQ sink. Both are consumed, never implemented, here.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::registry::ValueRecord;

// ============================================================================
// Status
// ============================================================================

/// Externally visible connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    #[serde(rename = "connect-off")]
    ConnectOff,
    #[serde(rename = "connect-ok")]
    ConnectOk,
    #[serde(rename = "connect-error")]
    ConnectError,
    #[serde(rename = "connect-failed")]
    ConnectFailed,
    #[serde(rename = "connect-busy")]
    ConnectBusy,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::ConnectOff => "connect-off",
            DeviceStatus::ConnectOk => "connect-ok",
            DeviceStatus::ConnectError => "connect-error",
            DeviceStatus::ConnectFailed => "connect-failed",
            DeviceStatus::ConnectBusy => "connect-busy",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Events
// ============================================================================

/// Event pushed to the host runtime.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// Connection status changed
    Status { id: String, status: DeviceStatus },
    /// Values were read (or cleared); carries the full value list
    Values {
        id: String,
        values: Vec<ValueRecord>,
    },
}

/// Sender half the host hands to the driver.
pub type EventSender = tokio::sync::mpsc::UnboundedSender<DeviceEvent>;

// ============================================================================
// DAQ sink
// ============================================================================

/// Historian sink for persist-worthy samples. Invoked only with entries
/// whose acquisition policy warrants persistence.
pub trait DaqSink: Send + Sync {
    fn add_daq(&self, changed: HashMap<String, ValueRecord>, device_name: &str, device_id: &str);
}

// ============================================================================
// Device logger
// ============================================================================

/// Lightweight logger carrying the device identity on every line.
#[derive(Debug, Clone)]
pub struct DeviceLogger {
    pub device_id: String,
    pub device_name: String,
}

impl DeviceLogger {
    pub fn new(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
        }
    }

    pub fn log_init(&self, message: &str) {
        info!(device = %self.device_name, "[INIT] {}", message);
    }

    pub fn log_connect(&self, target: &str, details: &str) {
        info!(device = %self.device_name, "[CONNECT] to {} - {}", target, details);
    }

    pub fn log_status(&self, status: DeviceStatus, reason: &str) {
        info!(device = %self.device_name, "[STATUS] {} - {}", status, reason);
    }

    pub fn log_overload(&self, operation: &str, count: u32) {
        warn!(
            device = %self.device_name,
            "[OVERLOAD] {} rejected while busy ({})", operation, count
        );
    }

    pub fn log_poll(&self, step: &str, count: usize) {
        debug!(device = %self.device_name, "[poll] {} x{}", step, count);
    }

    pub fn log_io(&self, module: &str, message: &str) {
        debug!(device = %self.device_name, "[io:{}] {}", module, message);
    }
}
