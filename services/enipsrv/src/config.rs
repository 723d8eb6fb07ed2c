//! Device configuration model
//!
//! The host supplies one device descriptor wholesale: identity, network
//! address, the tag table and the cyclic IO modules. A reload replaces the
//! whole snapshot; the driver never patches configuration in place.

use std::collections::HashMap;
use std::path::Path;

use figment::providers::{Env, Format, Json, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use enip_link::types::BackplanePath;
use enip_link::AssemblyInstance;

use crate::error::{EnipSrvError, Result};

/// Default TCP port of the messaging channel
pub const DEFAULT_PORT: u16 = 44818;

/// Default local UDP port for cyclic IO data
pub const DEFAULT_IO_PORT: u16 = 2222;

/// Well-known UDP port devices announce themselves on
pub const DISCOVERY_PORT: u16 = 51687;

/// Listen window for device discovery, in milliseconds
pub const DISCOVERY_WINDOW_MS: u64 = 6500;

// ============================================================================
// Device
// ============================================================================

/// One device: identity, address, tags and IO modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub property: DeviceProperty,
    #[serde(default)]
    pub tags: HashMap<String, TagConfig>,
    #[serde(default)]
    pub modules: HashMap<String, ModuleConfig>,
}

impl DeviceConfig {
    /// Check cross-references: every assembly-IO tag must point at a
    /// configured module.
    pub fn validate(&self) -> Result<()> {
        for tag in self.tags.values() {
            if let TagSource::AssemblyIo { module_id, .. } = &tag.source {
                if !self.modules.contains_key(module_id) {
                    return Err(EnipSrvError::config(format!(
                        "tag '{}' references unknown IO module '{}'",
                        tag.name, module_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Network address and routing options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceProperty {
    /// Target address, `host` or `host:port`
    #[serde(default)]
    pub address: Option<String>,
    /// Local UDP port the cyclic IO data arrives on
    #[serde(default)]
    pub ioport: Option<u16>,
    #[serde(default)]
    pub rack: Option<u8>,
    #[serde(default)]
    pub slot: Option<u8>,
    /// Route through the chassis backplane using rack/slot
    #[serde(default)]
    pub options: bool,
}

impl DeviceProperty {
    /// Split the configured address into host and messaging port.
    pub fn endpoint(&self) -> Result<(String, u16)> {
        let address = self
            .address
            .as_deref()
            .ok_or_else(|| EnipSrvError::config("missing connection address"))?;
        match address.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| EnipSrvError::config(format!("invalid port in '{address}'")))?;
                Ok((host.to_string(), port))
            },
            None => Ok((address.to_string(), DEFAULT_PORT)),
        }
    }

    /// Backplane path, present only when routing is requested.
    pub fn backplane(&self) -> Option<BackplanePath> {
        if self.options {
            Some(BackplanePath::new(
                self.rack.unwrap_or(0),
                self.slot.unwrap_or(0),
            ))
        } else {
            None
        }
    }

    pub fn io_port(&self) -> u16 {
        self.ioport.unwrap_or(DEFAULT_IO_PORT)
    }
}

// ============================================================================
// Tags
// ============================================================================

/// One data point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    pub id: String,
    pub name: String,
    /// Symbolic path for symbolic tags, informational otherwise
    #[serde(default)]
    pub address: String,
    /// Declared tag type as shown to the host
    #[serde(default, rename = "type")]
    pub tag_type: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    /// Linear scaling divisor; composed value = raw / divisor
    #[serde(default = "default_divisor")]
    pub divisor: f64,
    #[serde(default)]
    pub daq: DaqPolicy,
    /// Where the value lives; exactly one source kind per tag
    pub source: TagSource,
}

/// Data source of a tag. The enum carries the per-kind fields, so the
/// "exactly one source kind is active" invariant holds by construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TagSource {
    /// Named variable resolved by the controller's symbol table
    Symbolic {
        #[serde(default)]
        program: Option<String>,
        data_type: u16,
    },
    /// Explicit class/instance/attribute access
    Explicit {
        #[serde(default)]
        class: Option<u16>,
        #[serde(default)]
        instance: Option<u16>,
        #[serde(default)]
        attribute: Option<u16>,
        /// Read during polling; send-only tags are skipped
        #[serde(default = "default_true")]
        get_or_send: bool,
        /// Hex byte string written when `set_value` receives no payload
        #[serde(default)]
        send_buffer: Option<String>,
    },
    /// Bit or word at a fixed offset inside a cyclic IO assembly
    AssemblyIo {
        module_id: String,
        data: IoDataKind,
        byte_offset: u16,
        #[serde(default)]
        bit_offset: Option<u8>,
        /// Lives in the output table (host-written) rather than the input
        #[serde(default)]
        output: bool,
    },
    /// Derived value, never live-polled
    Calculated,
}

/// Representation of an assembly-IO tag inside its table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IoDataKind {
    Bit,
    Word16,
}

// ============================================================================
// Data acquisition policy
// ============================================================================

/// When a changed value is worth persisting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DaqPolicy {
    pub enabled: bool,
    /// Persist on value change
    pub changed: bool,
    /// Persist at least every `interval` ms, 0 disables the interval rule
    pub interval: u64,
}

impl Default for DaqPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            changed: true,
            interval: 0,
        }
    }
}

impl DaqPolicy {
    /// Decide whether this sample goes to the DAQ sink.
    pub fn warrants_save(&self, value_changed: bool, last_saved: i64, now: i64) -> bool {
        if !self.enabled {
            return false;
        }
        if self.changed && value_changed {
            return true;
        }
        self.interval > 0 && now - last_saved >= self.interval as i64
    }
}

/// Partial DAQ settings update; absent fields keep their current value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DaqPolicyUpdate {
    pub enabled: Option<bool>,
    pub changed: Option<bool>,
    pub interval: Option<u64>,
}

impl DaqPolicy {
    pub fn merge(&mut self, update: &DaqPolicyUpdate) {
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(changed) = update.changed {
            self.changed = changed;
        }
        if let Some(interval) = update.interval {
            self.interval = interval;
        }
    }
}

// ============================================================================
// IO modules
// ============================================================================

/// One cyclic IO connection: three assembly descriptors and a packet rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub configuration: AssemblyInstance,
    pub input: AssemblyInstance,
    pub output: AssemblyInstance,
    /// Requested packet interval in milliseconds
    pub rpi_ms: u32,
    /// Connection timeout; defaults to 4 x RPI (CIP timeout multiplier)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ModuleConfig {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.unwrap_or(4 * self.rpi_ms as u64)
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Load a device descriptor from a YAML or JSON file, with `ENIPSRV_`
/// environment overrides.
pub fn load_from_file(path: &Path) -> Result<DeviceConfig> {
    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Figment::from(Json::file(path)),
        _ => Figment::from(Yaml::file(path)),
    }
    .merge(Env::prefixed("ENIPSRV_").split("__"));

    let config: DeviceConfig = figment
        .extract()
        .map_err(|e| EnipSrvError::config(format!("failed to load '{}': {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

fn default_true() -> bool {
    true
}

fn default_divisor() -> f64 {
    1.0
}

// ============================================================================
// Tests
// ============================================================================
