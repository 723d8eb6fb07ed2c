//! Device driver orchestrator
//!
//! The public surface of one EtherNet/IP device: connect, disconnect,
//! poll, set-value, browse, plus the query surface the host reads. A
//! per-device busy-guard serializes the connect-class operations; an
//! overlapping call is rejected and counted, never queued, because the
//! host's own timer provides the retry cadence.

pub mod messaging;
pub mod scanner;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

use enip_link::types::data_type;
use enip_link::{ClientFactory, DiscoveredDevice, EnipError, PlcValue, TagListEntry};

use crate::codec;
use crate::config::{
    DaqPolicy, DaqPolicyUpdate, DeviceConfig, ModuleConfig, TagConfig, TagSource,
    DISCOVERY_PORT, DISCOVERY_WINDOW_MS,
};
use crate::error::{EnipSrvError, Result};
use crate::events::{DaqSink, DeviceEvent, DeviceLogger, DeviceStatus, EventSender};
use crate::registry::{TagProperty, TagRegistry, ValueRecord};

use messaging::MessagingConnection;
use scanner::IoScanner;

/// Driver connection states. Any state can fall back to `Disconnected`
/// on fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Polling,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Polling => write!(f, "POLLING"),
        }
    }
}

/// Single-tag value as returned by `get_value`.
#[derive(Debug, Clone, Serialize)]
pub struct TagValue {
    pub id: String,
    pub value: PlcValue,
    pub ts: i64,
}

/// The driver for one device.
pub struct EnipDevice {
    factory: Arc<dyn ClientFactory>,
    config: RwLock<Arc<DeviceConfig>>,
    registry: Arc<TagRegistry>,
    scanner: Arc<IoScanner>,
    messaging: RwLock<Option<Arc<AsyncMutex<MessagingConnection>>>>,
    events: EventSender,
    daq: RwLock<Option<Arc<dyn DaqSink>>>,
    state: parking_lot::Mutex<ConnectionState>,
    last_status: parking_lot::Mutex<Option<DeviceStatus>>,
    /// Busy-guard: at most one connect-class operation in flight
    working: AtomicBool,
    /// Rejected-while-busy counter, reset whenever the guard is taken
    overload: AtomicU32,
    connected: AtomicBool,
    last_read_ts: AtomicI64,
}

impl EnipDevice {
    /// Build the driver for one device descriptor.
    pub fn new(
        config: DeviceConfig,
        events: EventSender,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let logger = DeviceLogger::new(config.id.clone(), config.name.clone());
        let registry = Arc::new(TagRegistry::new());
        registry.load(config.tags.clone());
        logger.log_init(&format!("data loaded ({})", config.tags.len()));
        Self {
            factory,
            config: RwLock::new(Arc::new(config)),
            registry,
            scanner: Arc::new(IoScanner::new(logger)),
            messaging: RwLock::new(None),
            events,
            daq: RwLock::new(None),
            state: parking_lot::Mutex::new(ConnectionState::Disconnected),
            last_status: parking_lot::Mutex::new(None),
            working: AtomicBool::new(false),
            overload: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            last_read_ts: AtomicI64::new(0),
        }
    }

    fn config(&self) -> Arc<DeviceConfig> {
        self.config.read().clone()
    }

    fn logger(&self) -> DeviceLogger {
        let cfg = self.config();
        DeviceLogger::new(cfg.id.clone(), cfg.name.clone())
    }

    /// Replace the device descriptor wholesale. Cached values and tag
    /// bookkeeping are reset; the driver never patches configuration.
    pub fn load(&self, data: DeviceConfig) {
        let count = data.tags.len();
        let logger = DeviceLogger::new(data.id.clone(), data.name.clone());
        self.registry.load(data.tags.clone());
        *self.config.write() = Arc::new(data);
        logger.log_init(&format!("data loaded ({count})"));
    }

    /// Bind the historian sink receiving persist-worthy changes.
    pub fn bind_daq(&self, sink: Arc<dyn DaqSink>) {
        *self.daq.write() = Some(sink);
    }

    // ========================================================================
    // Busy-guard
    // ========================================================================

    /// Claim or release the per-device busy-guard.
    ///
    /// An overlapping claim is rejected and counted; the in-flight
    /// operation is left alone (tearing it down would destroy sockets it
    /// is still using).
    fn check_working(&self, engage: bool, polling: bool) -> bool {
        if engage {
            if self
                .working
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                let count = self.overload.fetch_add(1, Ordering::SeqCst) + 1;
                self.logger().log_overload(
                    if polling { "polling" } else { "connection" },
                    count,
                );
                return false;
            }
            self.overload.store(0, Ordering::SeqCst);
            true
        } else {
            self.working.store(false, Ordering::SeqCst);
            true
        }
    }

    /// Number of calls rejected since the guard was last taken.
    pub fn overload_count(&self) -> u32 {
        self.overload.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn emit_status(&self, status: DeviceStatus) {
        *self.last_status.lock() = Some(status);
        let cfg = self.config();
        let _ = self.events.send(DeviceEvent::Status {
            id: cfg.id.clone(),
            status,
        });
    }

    fn emit_values(&self, values: Vec<ValueRecord>) {
        let cfg = self.config();
        let _ = self.events.send(DeviceEvent::Values {
            id: cfg.id.clone(),
            values,
        });
    }

    /// Null every cached value; emits the cleared list when anything was
    /// cached.
    fn clear_values(&self) {
        if self.registry.clear_values() {
            self.emit_values(self.registry.snapshot());
        }
    }

    // ========================================================================
    // Connect / disconnect
    // ========================================================================

    /// Connect the messaging channel, then every cyclic IO session.
    ///
    /// Any failure rolls the whole device back before returning; the
    /// status event is the host-visible outcome either way. The driver
    /// never retries by itself - the host's scheduler calls again on its
    /// own cadence.
    pub async fn connect(&self) -> Result<()> {
        let cfg = self.config();
        let logger = self.logger();

        if cfg.property.address.is_none() {
            error!(device = %cfg.name, "missing connection data");
            self.emit_status(DeviceStatus::ConnectFailed);
            self.clear_values();
            return Err(EnipSrvError::config("missing connection address"));
        }

        if !self.check_working(true, false) {
            self.emit_status(DeviceStatus::ConnectBusy);
            return Err(EnipSrvError::busy("connect while another operation in flight"));
        }

        *self.state.lock() = ConnectionState::Connecting;
        debug!(device = %cfg.name, "try to connect {}", cfg.property.address.as_deref().unwrap_or(""));

        match self.establish(&cfg).await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                *self.state.lock() = ConnectionState::Connected;
                logger.log_status(DeviceStatus::ConnectOk, "connected");
                self.emit_status(DeviceStatus::ConnectOk);
                self.check_working(false, false);
                Ok(())
            },
            Err(err) => {
                error!(device = %cfg.name, "try to connect error: {err}");
                // full rollback: no half-open device survives a failed connect
                if let Err(rollback) = self.disconnect_all().await {
                    debug!(device = %cfg.name, "rollback disconnect error: {rollback}");
                }
                self.connected.store(false, Ordering::SeqCst);
                *self.state.lock() = ConnectionState::Disconnected;
                self.check_working(false, false);
                self.emit_status(DeviceStatus::ConnectError);
                self.clear_values();
                Err(err)
            },
        }
    }

    async fn establish(&self, cfg: &DeviceConfig) -> Result<()> {
        // start from a clean slate even if a previous attempt left residue
        if let Err(err) = self.disconnect_all().await {
            debug!(device = %cfg.name, "pre-connect cleanup error: {err}");
        }

        let (host, port) = cfg.property.endpoint()?;
        let addr = resolve(&host, port).await?;
        let logger = self.logger();

        let conn =
            MessagingConnection::open(self.factory.as_ref(), addr, cfg.property.backplane(), logger)
                .await?;
        *self.messaging.write() = Some(Arc::new(AsyncMutex::new(conn)));

        let modules: Vec<ModuleConfig> = cfg.modules.values().cloned().collect();
        let io_port = cfg.property.io_port();
        let io_target = SocketAddr::new(addr.ip(), io_port);
        let io_tags = self.registry.io_tags();
        self.scanner
            .open_sessions(
                self.factory.as_ref(),
                modules,
                &io_tags,
                addr,
                io_target,
                io_port,
            )
            .await?;
        Ok(())
    }

    /// Tear the device down unconditionally.
    ///
    /// Per-resource close errors are swallowed into forced closes; the
    /// device always ends disconnected, values cleared, status emitted.
    pub async fn disconnect(&self) -> Result<()> {
        let cfg = self.config();
        debug!(device = %cfg.name, "disconnect external called");

        if !self.check_working(true, false) {
            return Err(EnipSrvError::busy(
                "disconnect while another operation in flight",
            ));
        }

        let result = self.disconnect_all().await;
        if let Err(ref err) = result {
            error!(device = %cfg.name, "disconnect failure: {err}");
        }
        self.connected.store(false, Ordering::SeqCst);
        *self.state.lock() = ConnectionState::Disconnected;
        self.check_working(false, false);
        self.emit_status(DeviceStatus::ConnectOff);
        self.clear_values();
        result
    }

    /// Close IO sessions, then the messaging channel. The handle is
    /// force-released even when the close itself fails.
    async fn disconnect_all(&self) -> Result<()> {
        self.scanner.close_all().await;

        let messaging = self.messaging.write().take();
        if let Some(conn) = messaging {
            let mut guard = conn.lock().await;
            if let Err(err) = guard.close().await {
                debug!("message connection force closed: {err}");
                return Err(err);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Polling
    // ========================================================================

    /// One poll cycle: IO tables, explicit attributes, symbolic tags.
    ///
    /// Quiet no-op while busy or disconnected. A mid-poll failure aborts
    /// this tick only; the connection is left for the next connect/poll
    /// attempt to sort out.
    pub async fn poll(&self) -> Result<()> {
        let cfg = self.config();
        if !self.check_working(true, true) {
            debug!(device = %cfg.name, "polling skipped, device busy");
            return Ok(());
        }
        if !self.is_connected() {
            debug!(device = %cfg.name, "polling skipped, not connected");
            self.check_working(false, true);
            return Ok(());
        }

        *self.state.lock() = ConnectionState::Polling;
        let result = self.read_values().await;
        *self.state.lock() = ConnectionState::Connected;

        match result {
            Ok(items) => {
                self.check_working(false, true);
                if items.is_empty() {
                    return Ok(());
                }
                let timestamp = chrono::Utc::now().timestamp_millis();
                let mut changed: HashMap<String, ValueRecord> = HashMap::new();
                for (id, raw) in items {
                    if raw.is_null() {
                        continue;
                    }
                    if let Some((record, save)) = self.registry.apply_raw(&id, raw, timestamp) {
                        if save {
                            changed.insert(id, record);
                        }
                    }
                }
                self.last_read_ts.store(timestamp, Ordering::SeqCst);
                self.emit_values(self.registry.snapshot());
                if !changed.is_empty() {
                    let sink = self.daq.read().clone();
                    if let Some(sink) = sink {
                        sink.add_daq(changed, &cfg.name, &cfg.id);
                    }
                }
                Ok(())
            },
            Err(err) => {
                error!(device = %cfg.name, "polling error: {err}");
                self.check_working(false, true);
                Err(EnipSrvError::poll(err.to_string()))
            },
        }
    }

    /// Gather raw values from every source class, in order.
    async fn read_values(&self) -> Result<HashMap<String, PlcValue>> {
        let cfg = self.config();
        let mut items = HashMap::new();

        let messaging = self
            .messaging
            .read()
            .clone()
            .ok_or_else(|| EnipSrvError::connection("messaging channel absent"))?;

        // Nothing configured: probe the identity object so the channel
        // stays alive.
        if self.registry.is_empty() && !self.scanner.has_sessions() {
            let mut conn = messaging.lock().await;
            conn.keep_alive().await?;
            return Ok(items);
        }

        // (a) IO session tables; already in memory, the datagram exchange
        // runs continuously in the background
        let io_tags = self.registry.io_input_tags();
        if !io_tags.is_empty() {
            self.logger().log_poll("io", io_tags.len());
        }
        for tag in &io_tags {
            if let Some(value) = self.scanner.read_input(tag) {
                items.insert(tag.id.clone(), value);
            }
        }

        // (b) explicit attribute reads; send-only tags were filtered out
        let explicit = self.registry.explicit_read_tags();
        for tag in &explicit {
            let TagSource::Explicit {
                class,
                instance,
                attribute,
                ..
            } = &tag.source
            else {
                continue;
            };
            let (Some(class), Some(instance), Some(attribute)) = (class, instance, attribute)
            else {
                warn!(
                    device = %cfg.name,
                    "explicit tag '{}' missing class/instance/attribute, skipped", tag.name
                );
                continue;
            };
            let mut conn = messaging.lock().await;
            let bytes = conn.read_attribute(*class, *instance, *attribute).await?;
            items.insert(tag.id.clone(), PlcValue::Bytes(bytes));
        }

        // (c) symbolic tags, batched while the controller allows it
        let symbolic = self.registry.symbolic_tags();
        if !symbolic.is_empty() {
            let mut conn = messaging.lock().await;
            items.extend(conn.read_symbolic_tags(&symbolic).await?);
        }

        Ok(items)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Route a write to whichever channel owns the tag's representation.
    ///
    /// IO output tags land in the session output table immediately (the
    /// background exchange transmits them on its own cadence). Explicit
    /// and symbolic writes are dispatched as detached tasks: the returned
    /// `true` means dispatched, not applied - failures surface only
    /// through the log.
    pub fn set_value(&self, tag_id: &str, value: &str) -> bool {
        let cfg = self.config();
        let Some(tag) = self.registry.tag(tag_id) else {
            return false;
        };

        match &tag.source {
            TagSource::AssemblyIo { output, .. } => {
                if !*output {
                    // input tags are never written, connected or not
                    return false;
                }
                let raw = outbound_value(&tag, value);
                self.scanner.write_output(&tag, &raw)
            },

            TagSource::Explicit {
                class,
                instance,
                attribute,
                send_buffer,
                ..
            } => {
                let (Some(class), Some(instance), Some(attribute)) =
                    (*class, *instance, *attribute)
                else {
                    error!(
                        device = %cfg.name,
                        "'{}' explicit tag definition missing class or instance or attribute",
                        tag.name
                    );
                    return false;
                };
                let payload = if !value.trim().is_empty() {
                    value.to_string()
                } else if let Some(buffer) = send_buffer.as_ref().filter(|b| !b.is_empty()) {
                    buffer.clone()
                } else {
                    error!(
                        device = %cfg.name,
                        "'{}' explicit tag value must be a hex byte string", tag.name
                    );
                    return false;
                };
                let stripped: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
                let bytes = match parse_hex(&stripped) {
                    Some(bytes) => bytes,
                    None => {
                        error!(
                            device = %cfg.name,
                            "'{}' error converting send buffer from hex", tag.name
                        );
                        return false;
                    },
                };

                let Some(conn) = self.messaging.read().clone() else {
                    warn!(device = %cfg.name, "'{}' write dropped, no connection", tag.name);
                    return true;
                };
                let name = tag.name.clone();
                let device = cfg.name.clone();
                tokio::spawn(async move {
                    let mut guard = conn.lock().await;
                    match guard.write_attribute(class, instance, attribute, &bytes).await {
                        Ok(()) => debug!(device = %device, "'{name}' setValue buffer written"),
                        Err(err) => error!(device = %device, "'{name}' setValue error: {err}"),
                    }
                });
                true
            },

            TagSource::Symbolic { .. } => {
                let raw = outbound_value(&tag, value);
                let Some(conn) = self.messaging.read().clone() else {
                    warn!(device = %cfg.name, "'{}' write dropped, no connection", tag.name);
                    return true;
                };
                let name = tag.name.clone();
                let device = cfg.name.clone();
                let tag = tag.clone();
                tokio::spawn(async move {
                    let mut guard = conn.lock().await;
                    match guard.write_symbolic(&tag, raw.clone()).await {
                        Ok(()) => debug!(device = %device, "sending value {raw} to '{name}'"),
                        Err(err) => error!(device = %device, "'{name}' setValue error: {err}"),
                    }
                });
                true
            },

            TagSource::Calculated => false,
        }
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Request the remote's full symbolic tag catalog over a throwaway
    /// connection, grouped by declaring program with a distinguished
    /// "global" group.
    pub async fn browse(&self) -> Result<BTreeMap<String, Vec<TagListEntry>>> {
        if !self.check_working(true, false) {
            return Err(EnipSrvError::busy("browse while another operation in flight"));
        }
        let result = self.browse_inner().await;
        self.check_working(false, false);
        result
    }

    async fn browse_inner(&self) -> Result<BTreeMap<String, Vec<TagListEntry>>> {
        let cfg = self.config();
        let (host, port) = cfg.property.endpoint()?;
        let addr = resolve(&host, port).await?;

        let mut client = self.factory.messaging();
        client.connect(addr, cfg.property.backplane()).await?;
        let result = client.list_tags().await;
        if let Err(err) = client.disconnect().await {
            debug!(device = %cfg.name, "browse connection close error: {err}");
        }

        let tags = match result {
            Ok(tags) => tags,
            Err(EnipError::Cip {
                general_status: 0x05 | 0x08,
                ..
            }) => {
                return Err(EnipSrvError::protocol(
                    "browse for tags not supported by device",
                ))
            },
            Err(err) => {
                error!(device = %cfg.name, "error retrieving symbolic tag catalog: {err}");
                return Err(err.into());
            },
        };

        let mut groups: BTreeMap<String, Vec<TagListEntry>> = BTreeMap::new();
        for tag in tags {
            let key = tag.program.clone().unwrap_or_else(|| "global".to_string());
            groups.entry(key).or_default().push(tag);
        }
        Ok(groups)
    }

    /// Listen on the well-known discovery port for a fixed window and
    /// return every device that announced itself.
    pub async fn browse_for_devices(&self) -> Result<Vec<DiscoveredDevice>> {
        if !self.check_working(true, false) {
            return Err(EnipSrvError::busy(
                "device browse while another operation in flight",
            ));
        }
        let discovery = self.factory.discovery();
        let result = discovery
            .browse(DISCOVERY_PORT, Duration::from_millis(DISCOVERY_WINDOW_MS))
            .await
            .map_err(EnipSrvError::from);
        self.check_working(false, false);
        if let Err(ref err) = result {
            error!("error searching for devices: {err}");
        }
        result
    }

    // ========================================================================
    // Query surface
    // ========================================================================

    pub fn get_values(&self) -> Vec<ValueRecord> {
        self.registry.snapshot()
    }

    pub fn get_value(&self, id: &str) -> Option<TagValue> {
        self.registry.get(id).map(|record| TagValue {
            id: id.to_string(),
            value: record.value,
            ts: self.last_read_ts.load(Ordering::SeqCst),
        })
    }

    pub fn get_status(&self) -> Option<DeviceStatus> {
        *self.last_status.lock()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn get_tag_property(&self, id: &str) -> Option<TagProperty> {
        self.registry.tag_property(id)
    }

    pub fn get_tag_daq_settings(&self, id: &str) -> Option<DaqPolicy> {
        self.registry.daq_settings(id)
    }

    pub fn set_tag_daq_settings(&self, id: &str, settings: &DaqPolicyUpdate) -> bool {
        self.registry.set_daq_settings(id, settings)
    }

    pub fn last_read_timestamp(&self) -> i64 {
        self.last_read_ts.load(Ordering::SeqCst)
    }

    /// Connected means the messaging channel is up and every IO session
    /// has seen data.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self.messaging.read().is_some()
            && self.scanner.all_live()
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| EnipSrvError::connection(format!("cannot resolve '{host}': {e}")))?
        .next()
        .ok_or_else(|| EnipSrvError::connection(format!("no address for '{host}'")))
}

/// Engineering value to the raw value sent to the device: string tags pass
/// through, symbolic BOOL accepts textual booleans, numerics run through
/// the inverse scaling.
fn outbound_value(tag: &TagConfig, value: &str) -> PlcValue {
    if codec::is_string_tag(tag) {
        return PlcValue::String(value.to_string());
    }
    if matches!(
        tag.source,
        TagSource::Symbolic {
            data_type: data_type::BOOL,
            ..
        }
    ) {
        match value {
            "true" => return PlcValue::Integer(1),
            "false" => return PlcValue::Integer(0),
            _ => {},
        }
    }
    match value.parse::<f64>() {
        Ok(v) => codec::decompose(&PlcValue::Float(v), tag),
        Err(_) => PlcValue::String(value.to_string()),
    }
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0a1B"), Some(vec![0x0A, 0x1B]));
        assert_eq!(parse_hex("FF"), Some(vec![0xFF]));
        assert!(parse_hex("").is_none());
        assert!(parse_hex("ABC").is_none());
        assert!(parse_hex("ZZ").is_none());
    }

    #[test]
    fn test_outbound_value_bool_coercion() {
        let tag = TagConfig {
            id: "b".into(),
            name: "b".into(),
            address: "Flag".into(),
            tag_type: None,
            format: None,
            divisor: 1.0,
            daq: DaqPolicy::default(),
            source: TagSource::Symbolic {
                program: None,
                data_type: data_type::BOOL,
            },
        };
        assert_eq!(outbound_value(&tag, "true"), PlcValue::Integer(1));
        assert_eq!(outbound_value(&tag, "false"), PlcValue::Integer(0));
        assert_eq!(outbound_value(&tag, "1"), PlcValue::Float(1.0));
    }

    #[test]
    fn test_outbound_value_scaling_and_strings() {
        let mut tag = TagConfig {
            id: "v".into(),
            name: "v".into(),
            address: "Speed".into(),
            tag_type: None,
            format: None,
            divisor: 10.0,
            daq: DaqPolicy::default(),
            source: TagSource::Symbolic {
                program: None,
                data_type: data_type::REAL,
            },
        };
        // engineering 2.5 with divisor 10 -> raw 25
        assert_eq!(outbound_value(&tag, "2.5"), PlcValue::Float(25.0));

        tag.source = TagSource::Symbolic {
            program: None,
            data_type: data_type::SHORT_STRING,
        };
        assert_eq!(
            outbound_value(&tag, "2.5"),
            PlcValue::String("2.5".to_string())
        );
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Polling.to_string(), "POLLING");
        assert_eq!(ConnectionState::Disconnected.to_string(), "DISCONNECTED");
    }
}
