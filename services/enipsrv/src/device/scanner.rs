//! IO scanner
//!
//! Owns the cyclic datagram side of a device: one session per configured
//! IO module, each exchanging a fixed-layout input/output table at its
//! requested packet interval, all sharing one process-wide UDP listener.
//!
//! A session counts as connected only once its first inbound datagram
//! arrives; acceptance of the forward-open alone does not guarantee the
//! remote will ever transmit.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use enip_link::types::{ForwardOpenReply, ForwardOpenRequest};
use enip_link::{ClientFactory, EnipError, IoPacketCodec, MessagingClient, PlcValue};

use crate::config::{IoDataKind, ModuleConfig, TagConfig, TagSource};
use crate::error::{EnipSrvError, Result};
use crate::events::DeviceLogger;

/// Fixed wait slice of the first-packet loop.
pub const IO_WAIT_SLICE_MS: u64 = 500;

/// Slices granted per unit of session connection timeout.
const CONNECT_TIMEOUT_MULTIPLIER: u64 = 5;

// ============================================================================
// IO tables
// ============================================================================

/// Fixed-size assembly image, one per direction per session.
#[derive(Debug)]
pub struct IoTable {
    data: Vec<u8>,
}

impl IoTable {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
        }
    }

    fn read_bit(&self, byte_offset: u16, bit_offset: u8) -> Option<bool> {
        let byte = self.data.get(byte_offset as usize)?;
        if bit_offset > 7 {
            return None;
        }
        Some(byte & (1 << bit_offset) != 0)
    }

    /// 16-bit word, CIP byte order (little-endian).
    fn read_word(&self, byte_offset: u16) -> Option<u16> {
        let lo = *self.data.get(byte_offset as usize)?;
        let hi = *self.data.get(byte_offset as usize + 1)?;
        Some(u16::from_le_bytes([lo, hi]))
    }

    fn write_bit(&mut self, byte_offset: u16, bit_offset: u8, value: bool) -> bool {
        if bit_offset > 7 {
            return false;
        }
        match self.data.get_mut(byte_offset as usize) {
            Some(byte) => {
                if value {
                    *byte |= 1 << bit_offset;
                } else {
                    *byte &= !(1 << bit_offset);
                }
                true
            },
            None => false,
        }
    }

    fn write_word(&mut self, byte_offset: u16, value: u16) -> bool {
        let offset = byte_offset as usize;
        if offset + 2 > self.data.len() {
            return false;
        }
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        true
    }

    fn fill_from(&mut self, src: &[u8]) {
        let n = src.len().min(self.data.len());
        self.data[..n].copy_from_slice(&src[..n]);
    }

    fn snapshot(&self) -> Vec<u8> {
        self.data.clone()
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Session lifecycle. `Closed` is terminal; there is no reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    AwaitingFirstPacket,
    Live,
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct TagMapEntry {
    kind: IoDataKind,
    byte_offset: u16,
    bit_offset: Option<u8>,
}

/// One cyclic IO connection for one module.
pub struct IoSession {
    pub module_id: String,
    rpi_ms: u32,
    timeout_ms: u64,
    state: Mutex<SessionState>,
    reply: Mutex<Option<ForwardOpenReply>>,
    last_error: Mutex<Option<EnipError>>,
    input: Mutex<IoTable>,
    output: Mutex<IoTable>,
    input_map: RwLock<HashMap<String, TagMapEntry>>,
    output_map: RwLock<HashMap<String, TagMapEntry>>,
    live: AtomicBool,
    sequence: AtomicU16,
    /// Per-session channel used for the forward-open/close handshakes
    client: tokio::sync::Mutex<Box<dyn MessagingClient>>,
}

impl IoSession {
    fn new(module: &ModuleConfig, client: Box<dyn MessagingClient>) -> Self {
        Self {
            module_id: module.id.clone(),
            rpi_ms: module.rpi_ms,
            timeout_ms: module.timeout_ms(),
            state: Mutex::new(SessionState::Opening),
            reply: Mutex::new(None),
            last_error: Mutex::new(None),
            input: Mutex::new(IoTable::new(module.input.size as usize)),
            output: Mutex::new(IoTable::new(module.output.size as usize)),
            input_map: RwLock::new(HashMap::new()),
            output_map: RwLock::new(HashMap::new()),
            live: AtomicBool::new(false),
            sequence: AtomicU16::new(0),
            client: tokio::sync::Mutex::new(client),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Inbound datagram for this session: refresh the input image; the
    /// first one flips the session live.
    fn accept_packet(&self, data: &[u8]) {
        self.input.lock().fill_from(data);
        if !self.live.swap(true, Ordering::SeqCst) {
            *self.state.lock() = SessionState::Live;
        }
    }

    /// Register where a tag lives inside this session's tables, chosen by
    /// the tag's declared direction.
    fn map_tag(&self, tag: &TagConfig) {
        if let TagSource::AssemblyIo {
            data,
            byte_offset,
            bit_offset,
            output,
            ..
        } = tag.source
        {
            let entry = TagMapEntry {
                kind: data,
                byte_offset,
                bit_offset,
            };
            if output {
                self.output_map.write().insert(tag.id.clone(), entry);
            } else {
                self.input_map.write().insert(tag.id.clone(), entry);
            }
        }
    }

    /// Pure in-memory read of an input tag; no network involved.
    fn read_input(&self, tag_id: &str) -> Option<PlcValue> {
        let entry = *self.input_map.read().get(tag_id)?;
        let table = self.input.lock();
        match entry.kind {
            IoDataKind::Bit => table
                .read_bit(entry.byte_offset, entry.bit_offset.unwrap_or(0))
                .map(PlcValue::Bool),
            IoDataKind::Word16 => table
                .read_word(entry.byte_offset)
                .map(|w| PlcValue::Integer(w as i64)),
        }
    }

    /// Pure in-memory write of an output tag; the background exchange
    /// transmits it on its own cadence.
    fn write_output(&self, tag_id: &str, value: &PlcValue) -> bool {
        let entry = match self.output_map.read().get(tag_id) {
            Some(entry) => *entry,
            None => return false,
        };
        let mut table = self.output.lock();
        match entry.kind {
            IoDataKind::Bit => match value.as_bool() {
                Some(v) => table.write_bit(entry.byte_offset, entry.bit_offset.unwrap_or(0), v),
                None => false,
            },
            IoDataKind::Word16 => match value.as_i64() {
                Some(v) if (0..=u16::MAX as i64).contains(&v) => {
                    table.write_word(entry.byte_offset, v as u16)
                },
                _ => false,
            },
        }
    }
}

// ============================================================================
// Shared listener
// ============================================================================

/// Process-wide UDP listener shared by every device using the same local
/// io port. Sessions are registered by their inbound connection id.
pub struct SharedIoListener {
    port: u16,
    socket: Arc<UdpSocket>,
    sessions: RwLock<HashMap<u32, Arc<IoSession>>>,
    rx_task: Mutex<Option<JoinHandle<()>>>,
}

static LISTENERS: tokio::sync::Mutex<BTreeMap<u16, Arc<SharedIoListener>>> =
    tokio::sync::Mutex::const_new(BTreeMap::new());

/// Lazily bind (or reuse) the shared listener for a local port.
async fn acquire_listener(
    port: u16,
    codec: Arc<dyn IoPacketCodec>,
) -> Result<Arc<SharedIoListener>> {
    let mut registry = LISTENERS.lock().await;
    if let Some(listener) = registry.get(&port) {
        return Ok(listener.clone());
    }

    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .map_err(|e| EnipSrvError::io_session(format!("io listener bind failed: {e}"), vec![], false))?;
    let listener = Arc::new(SharedIoListener {
        port,
        socket: Arc::new(socket),
        sessions: RwLock::new(HashMap::new()),
        rx_task: Mutex::new(None),
    });

    let task = tokio::spawn(rx_loop(listener.clone(), codec));
    *listener.rx_task.lock() = Some(task);
    registry.insert(port, listener.clone());
    debug!("io listener bound on udp port {port}");
    Ok(listener)
}

/// Drop the listener once no device has a session left on it.
async fn release_listener_if_idle(port: u16) {
    let mut registry = LISTENERS.lock().await;
    let idle = registry
        .get(&port)
        .map(|l| l.sessions.read().is_empty())
        .unwrap_or(false);
    if idle {
        if let Some(listener) = registry.remove(&port) {
            if let Some(task) = listener.rx_task.lock().take() {
                task.abort();
            }
            debug!("io listener on udp port {port} released");
        }
    }
}

/// Route inbound datagrams to their sessions.
async fn rx_loop(listener: Arc<SharedIoListener>, codec: Arc<dyn IoPacketCodec>) {
    let mut buf = vec![0u8; 1500];
    loop {
        match listener.socket.recv_from(&mut buf).await {
            Ok((n, _peer)) => {
                if let Some(packet) = codec.decode(&buf[..n]) {
                    let session = listener.sessions.read().get(&packet.connection_id).cloned();
                    if let Some(session) = session {
                        session.accept_packet(packet.data);
                    }
                }
            },
            Err(err) => {
                warn!("io listener receive error: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            },
        }
    }
}

/// Transmit one session's output table at its packet interval.
async fn tx_loop(
    socket: Arc<UdpSocket>,
    codec: Arc<dyn IoPacketCodec>,
    session: Arc<IoSession>,
    target: SocketAddr,
) {
    let mut interval =
        tokio::time::interval(Duration::from_millis(session.rpi_ms.max(1) as u64));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let reply = match *session.reply.lock() {
            Some(reply) => reply,
            None => continue,
        };
        let data = session.output.lock().snapshot();
        let sequence = session.sequence.fetch_add(1, Ordering::Relaxed);
        let frame = codec.encode(reply.o_to_t_connection_id, sequence, &data);
        if let Err(err) = socket.send_to(&frame, target).await {
            debug!("io transmit error for {}: {err}", session.module_id);
        }
    }
}

// ============================================================================
// Scanner
// ============================================================================

/// The cyclic IO side of one device.
pub struct IoScanner {
    logger: DeviceLogger,
    listener: Mutex<Option<Arc<SharedIoListener>>>,
    sessions: RwLock<Vec<Arc<IoSession>>>,
    tx_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IoScanner {
    pub fn new(logger: DeviceLogger) -> Self {
        Self {
            logger,
            listener: Mutex::new(None),
            sessions: RwLock::new(Vec::new()),
            tx_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn has_sessions(&self) -> bool {
        !self.sessions.read().is_empty()
    }

    /// True when every session has seen data; trivially true with no
    /// sessions configured.
    pub fn all_live(&self) -> bool {
        self.sessions.read().iter().all(|s| s.is_live())
    }

    /// Open one session per module, map the device's IO tags into the
    /// session tables and wait until every session has received data.
    pub async fn open_sessions(
        &self,
        factory: &dyn ClientFactory,
        modules: Vec<ModuleConfig>,
        tags: &[TagConfig],
        messaging_addr: SocketAddr,
        io_target: SocketAddr,
        local_port: u16,
    ) -> Result<()> {
        if modules.is_empty() {
            return Ok(());
        }

        let codec = factory.io_codec();
        let listener = acquire_listener(local_port, codec.clone()).await?;
        *self.listener.lock() = Some(listener.clone());

        for module in &modules {
            let session = Arc::new(IoSession::new(module, factory.messaging()));
            let request = ForwardOpenRequest {
                configuration: module.configuration,
                input: module.input,
                output: module.output,
                rpi_ms: module.rpi_ms,
                local_port,
            };

            let open_result = {
                let mut client = session.client.lock().await;
                match client.connect(messaging_addr, None).await {
                    Ok(()) => client.forward_open(&request).await,
                    Err(err) => Err(err),
                }
            };

            match open_result {
                Ok(reply) => {
                    *session.reply.lock() = Some(reply);
                    *session.state.lock() = SessionState::AwaitingFirstPacket;
                    listener
                        .sessions
                        .write()
                        .insert(reply.t_to_o_connection_id, session.clone());
                    let handle = tokio::spawn(tx_loop(
                        listener.socket.clone(),
                        codec.clone(),
                        session.clone(),
                        io_target,
                    ));
                    self.tx_tasks.lock().push(handle);
                    self.logger
                        .log_io(&module.id, &format!("forward-open accepted, rpi {}ms", reply.actual_rpi_ms));
                },
                Err(err) => {
                    // Recorded, not fatal yet: the wait loop reports it
                    // once the budget runs out.
                    self.logger
                        .log_io(&module.id, &format!("forward-open failed: {err}"));
                    *session.last_error.lock() = Some(err);
                },
            }

            self.sessions.write().push(session);
        }

        for tag in tags {
            if let TagSource::AssemblyIo { module_id, .. } = &tag.source {
                let sessions = self.sessions.read();
                if let Some(session) = sessions.iter().find(|s| &s.module_id == module_id) {
                    session.map_tag(tag);
                }
            }
        }

        self.wait_for_sessions().await
    }

    /// Wait, in fixed slices, until every session produced data.
    ///
    /// The slice budget derives from each session's own connection
    /// timeout; exhaustion reports the sessions still pending and whether
    /// any of them hit an ownership conflict.
    async fn wait_for_sessions(&self) -> Result<()> {
        let sessions: Vec<Arc<IoSession>> = self.sessions.read().clone();
        if sessions.is_empty() {
            return Ok(());
        }
        let budget: u64 = sessions
            .iter()
            .map(|s| CONNECT_TIMEOUT_MULTIPLIER * (s.timeout_ms / IO_WAIT_SLICE_MS).max(1))
            .sum();
        let mut remaining = budget;

        loop {
            if sessions.iter().all(|s| s.is_live()) {
                debug!(device = %self.logger.device_name, "io connections finished connecting");
                return Ok(());
            }
            if remaining == 0 {
                let pending: Vec<String> = sessions
                    .iter()
                    .filter(|s| !s.is_live())
                    .map(|s| s.module_id.clone())
                    .collect();
                let mut ownership_conflict = false;
                for session in sessions.iter().filter(|s| !s.is_live()) {
                    if let Some(err) = session.last_error.lock().as_ref() {
                        error!(
                            device = %self.logger.device_name,
                            "io module {} connection setup error: {err}", session.module_id
                        );
                        if err.is_ownership_conflict() {
                            error!(
                                device = %self.logger.device_name,
                                "io module {} connection ownership conflict", session.module_id
                            );
                            ownership_conflict = true;
                        }
                    }
                }
                return Err(EnipSrvError::io_session(
                    format!(
                        "no data from io module(s) [{}] within {budget} wait slices",
                        pending.join(", ")
                    ),
                    pending,
                    ownership_conflict,
                ));
            }
            remaining -= 1;
            tokio::time::sleep(Duration::from_millis(IO_WAIT_SLICE_MS)).await;
        }
    }

    /// In-memory read of an input-direction IO tag.
    pub fn read_input(&self, tag: &TagConfig) -> Option<PlcValue> {
        if let TagSource::AssemblyIo { module_id, .. } = &tag.source {
            let sessions = self.sessions.read();
            let session = sessions.iter().find(|s| &s.module_id == module_id)?;
            session.read_input(&tag.id)
        } else {
            None
        }
    }

    /// In-memory write of an output-direction IO tag. False when the tag
    /// is not mapped into any session's output table.
    pub fn write_output(&self, tag: &TagConfig, value: &PlcValue) -> bool {
        if let TagSource::AssemblyIo { module_id, .. } = &tag.source {
            let sessions = self.sessions.read();
            match sessions.iter().find(|s| &s.module_id == module_id) {
                Some(session) => session.write_output(&tag.id, value),
                None => false,
            }
        } else {
            false
        }
    }

    /// Close every session of this device and release the shared listener
    /// once nobody uses it anymore. Per-session errors are swallowed into
    /// forced closes.
    pub async fn close_all(&self) {
        for handle in self.tx_tasks.lock().drain(..) {
            handle.abort();
        }
        let sessions: Vec<Arc<IoSession>> = {
            let mut guard = self.sessions.write();
            guard.drain(..).collect()
        };
        let listener = self.listener.lock().take();

        for session in &sessions {
            *session.state.lock() = SessionState::Closed;
            session.live.store(false, Ordering::SeqCst);
            let reply = *session.reply.lock();

            let mut client = session.client.lock().await;
            if let Some(reply) = reply {
                if let Err(err) = client.forward_close(reply.o_to_t_connection_id).await {
                    debug!(
                        device = %self.logger.device_name,
                        "forward-close failed for {}, forcing: {err}", session.module_id
                    );
                }
            }
            if let Err(err) = client.disconnect().await {
                debug!(
                    device = %self.logger.device_name,
                    "io channel disconnect failed for {}, forcing: {err}", session.module_id
                );
            }

            if let (Some(listener), Some(reply)) = (listener.as_ref(), reply) {
                listener.sessions.write().remove(&reply.t_to_o_connection_id);
            }
        }

        if let Some(listener) = listener {
            release_listener_if_idle(listener.port).await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
