//! CIP Data Model
//!
//! Elementary data type codes, tag values, connection parameters and the
//! identity/catalog records exchanged with a remote controller.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

// ============================================================================
// Elementary data types
// ============================================================================

/// CIP elementary data type codes.
///
/// The subset a controller reports for symbolic tags; `STRUCT` marks
/// template-backed tags.
pub mod data_type {
    pub const BOOL: u16 = 0x00C1;
    pub const SINT: u16 = 0x00C2;
    pub const INT: u16 = 0x00C3;
    pub const DINT: u16 = 0x00C4;
    pub const LINT: u16 = 0x00C5;
    pub const USINT: u16 = 0x00C6;
    pub const UINT: u16 = 0x00C7;
    pub const UDINT: u16 = 0x00C8;
    pub const REAL: u16 = 0x00CA;
    pub const LREAL: u16 = 0x00CB;
    pub const STIME: u16 = 0x00CC;
    pub const DATE: u16 = 0x00CD;
    pub const TIME_AND_DAY: u16 = 0x00CE;
    pub const DATE_AND_STRING: u16 = 0x00CF;
    pub const STRING: u16 = 0x00D0;
    pub const WORD: u16 = 0x00D1;
    pub const DWORD: u16 = 0x00D2;
    pub const BIT_STRING: u16 = 0x00D3;
    pub const LWORD: u16 = 0x00D4;
    pub const STRING2: u16 = 0x00D5;
    pub const FTIME: u16 = 0x00D6;
    pub const LTIME: u16 = 0x00D7;
    pub const ITIME: u16 = 0x00D8;
    pub const STRINGN: u16 = 0x00D9;
    pub const SHORT_STRING: u16 = 0x00DA;
    pub const TIME: u16 = 0x00DB;
    pub const EPATH: u16 = 0x00DC;
    pub const ENGUNIT: u16 = 0x00DD;
    pub const STRINGI: u16 = 0x00DE;
    pub const STRUCT: u16 = 0x02A0;

    /// The six string-family codes. Values of these types carry text and
    /// bypass numeric scaling.
    pub fn is_string_family(code: u16) -> bool {
        matches!(
            code,
            DATE_AND_STRING | STRING | STRING2 | STRINGN | SHORT_STRING | STRINGI
        )
    }
}

/// Identity object class (keep-alive probes read this object).
pub const IDENTITY_OBJECT_CLASS: u16 = 0x01;

// ============================================================================
// Tag values
// ============================================================================

/// Value read from or written to a controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PlcValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    /// Raw attribute bytes (explicit messaging)
    Bytes(Vec<u8>),
    Null,
}

impl PlcValue {
    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::String(s) => s.parse().ok(),
            Self::Bytes(_) | Self::Null => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) => Some(f.round() as i64),
            Self::Bool(b) => Some(if *b { 1 } else { 0 }),
            Self::String(s) => s.parse().ok(),
            Self::Bytes(_) | Self::Null => None,
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Integer(i) => Some(*i != 0),
            Self::Float(f) => Some(*f != 0.0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" => Some(false),
                _ => None,
            },
            Self::Bytes(_) | Self::Null => None,
        }
    }

    /// Render as a display string (empty for null)
    pub fn as_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Bytes(b) => b.iter().map(|v| format!("{v:02X}")).collect::<String>(),
            Self::Null => String::new(),
        }
    }

    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<f64> for PlcValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for PlcValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for PlcValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for PlcValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for PlcValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl fmt::Display for PlcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

// ============================================================================
// Symbolic addressing
// ============================================================================

/// A symbolic tag reference resolved by the controller's symbol table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SymbolicTag {
    /// Tag path, e.g. `Machine.Status[2]`
    pub name: String,
    /// Declaring program; `None` addresses the controller (global) scope
    pub program: Option<String>,
    /// Declared elementary type code, when known
    pub data_type: Option<u16>,
}

impl SymbolicTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: None,
            data_type: None,
        }
    }

    pub fn with_program(mut self, program: Option<String>) -> Self {
        self.program = program;
        self
    }

    pub fn with_data_type(mut self, data_type: Option<u16>) -> Self {
        self.data_type = data_type;
        self
    }
}

/// Backplane routing path (rack/slot) appended to the connection path for
/// chassis-based controllers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BackplanePath {
    pub rack: u8,
    pub slot: u8,
}

impl BackplanePath {
    pub fn new(rack: u8, slot: u8) -> Self {
        Self { rack, slot }
    }

    /// Two-byte path encoding, rack then slot.
    pub fn encode(&self) -> [u8; 2] {
        [self.rack, self.slot]
    }
}

// ============================================================================
// Cyclic IO connection parameters
// ============================================================================

/// One assembly endpoint: instance number and data size in bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AssemblyInstance {
    pub instance: u16,
    pub size: u16,
}

impl AssemblyInstance {
    pub fn new(instance: u16, size: u16) -> Self {
        Self { instance, size }
    }
}

/// Parameters for a forward-open handshake establishing one cyclic IO
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardOpenRequest {
    pub configuration: AssemblyInstance,
    pub input: AssemblyInstance,
    pub output: AssemblyInstance,
    /// Requested packet interval in milliseconds
    pub rpi_ms: u32,
    /// UDP endpoint the target transmits its input data to
    pub local_port: u16,
}

/// Successful forward-open reply.
///
/// Acceptance does not imply data will flow; a session counts as live only
/// once the first inbound datagram arrives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardOpenReply {
    /// Originator-to-target connection id (our transmit direction)
    pub o_to_t_connection_id: u32,
    /// Target-to-originator connection id; inbound datagrams carry this
    pub t_to_o_connection_id: u32,
    /// Actual packet interval granted by the target, in milliseconds
    pub actual_rpi_ms: u32,
}

/// A decoded class-1 datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoPacket<'a> {
    pub connection_id: u32,
    pub sequence: u16,
    pub data: &'a [u8],
}

// ============================================================================
// Identity and catalog records
// ============================================================================

/// Identity object contents (class 0x01 instance 1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IdentityObject {
    pub vendor_id: u16,
    pub product_type: u16,
    pub product_code: u16,
    pub revision_major: u8,
    pub revision_minor: u8,
    pub serial_number: u32,
    pub product_name: String,
}

/// A device announced on the discovery port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveredDevice {
    pub identity: IdentityObject,
    /// Encapsulation protocol version reported in the announcement
    pub encap_version: u16,
    pub socket_addr: SocketAddr,
}

/// One entry of the controller's symbolic tag catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagListEntry {
    pub name: String,
    /// Declaring program; `None` for controller-scope tags
    pub program: Option<String>,
    pub data_type: u16,
}

// ============================================================================
// Tests
// ============================================================================
