//! Simulated EtherNet/IP backend
//!
//! An in-memory implementation of the enip-link traits with scriptable
//! fault modes: connection refusal, group-read rejection, forward-open
//! ownership conflicts and IO sessions that accept the open but never
//! transmit. Drives the integration tests and the demo binary; production
//! hosts plug a real transport factory in instead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::debug;

use enip_link::types::{
    BackplanePath, DiscoveredDevice, ForwardOpenReply, ForwardOpenRequest, IdentityObject,
    IoPacket, SymbolicTag, TagListEntry,
};
use enip_link::{
    ClientFactory, DeviceDiscovery, EnipError, IoPacketCodec, MessagingClient, PlcValue,
};

type LinkResult<T> = enip_link::Result<T>;

// ============================================================================
// Shared simulator state
// ============================================================================

/// Scriptable device state shared by every client the factory hands out.
pub struct SimBackend {
    tags: Mutex<HashMap<String, PlcValue>>,
    attributes: Mutex<HashMap<(u16, u16, u16), Vec<u8>>>,
    catalog: Mutex<Vec<TagListEntry>>,
    discovered: Mutex<Vec<DiscoveredDevice>>,
    identity: Mutex<IdentityObject>,
    /// Input images keyed by input assembly instance
    images: Mutex<HashMap<u16, Arc<Mutex<Vec<u8>>>>>,

    // Fault switches
    pub refuse_connect: AtomicBool,
    pub fail_group_read: AtomicBool,
    pub ownership_conflict: AtomicBool,
    /// Accept forward-opens but never transmit data
    pub silent_io: AtomicBool,
    read_delay_ms: AtomicU64,

    // Observability for tests
    group_read_attempts: AtomicU32,
    identity_probes: AtomicU32,
    tag_writes: Mutex<Vec<(String, PlcValue)>>,
    attribute_writes: Mutex<Vec<((u16, u16, u16), Vec<u8>)>>,

    next_connection: AtomicU32,
    io_tasks: Mutex<HashMap<u32, JoinHandle<()>>>,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self {
            tags: Mutex::new(HashMap::new()),
            attributes: Mutex::new(HashMap::new()),
            catalog: Mutex::new(Vec::new()),
            discovered: Mutex::new(Vec::new()),
            identity: Mutex::new(IdentityObject {
                vendor_id: 0x5A5A,
                product_type: 14,
                product_code: 65,
                revision_major: 2,
                revision_minor: 11,
                serial_number: 0x00C0FFEE,
                product_name: "SimPLC 5000".to_string(),
            }),
            images: Mutex::new(HashMap::new()),
            refuse_connect: AtomicBool::new(false),
            fail_group_read: AtomicBool::new(false),
            ownership_conflict: AtomicBool::new(false),
            silent_io: AtomicBool::new(false),
            read_delay_ms: AtomicU64::new(0),
            group_read_attempts: AtomicU32::new(0),
            identity_probes: AtomicU32::new(0),
            tag_writes: Mutex::new(Vec::new()),
            attribute_writes: Mutex::new(Vec::new()),
            next_connection: AtomicU32::new(0x1000),
            io_tasks: Mutex::new(HashMap::new()),
        }
    }
}

impl SimBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_tag(&self, name: impl Into<String>, value: PlcValue) {
        self.tags.lock().insert(name.into(), value);
    }

    pub fn tag_value(&self, name: &str) -> Option<PlcValue> {
        self.tags.lock().get(name).cloned()
    }

    pub fn set_attribute(&self, class: u16, instance: u16, attribute: u16, data: Vec<u8>) {
        self.attributes.lock().insert((class, instance, attribute), data);
    }

    pub fn set_catalog(&self, entries: Vec<TagListEntry>) {
        *self.catalog.lock() = entries;
    }

    pub fn set_discovered(&self, devices: Vec<DiscoveredDevice>) {
        *self.discovered.lock() = devices;
    }

    /// Refresh the cyclic input image transmitted for an input assembly.
    pub fn set_input_image(&self, instance: u16, data: Vec<u8>) {
        let mut images = self.images.lock();
        match images.get(&instance) {
            Some(slot) => *slot.lock() = data,
            None => {
                images.insert(instance, Arc::new(Mutex::new(data)));
            },
        }
    }

    /// Artificial latency for every messaging read, to exercise overload
    /// handling.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn group_read_attempts(&self) -> u32 {
        self.group_read_attempts.load(Ordering::SeqCst)
    }

    pub fn identity_probes(&self) -> u32 {
        self.identity_probes.load(Ordering::SeqCst)
    }

    pub fn tag_writes(&self) -> Vec<(String, PlcValue)> {
        self.tag_writes.lock().clone()
    }

    pub fn attribute_writes(&self) -> Vec<((u16, u16, u16), Vec<u8>)> {
        self.attribute_writes.lock().clone()
    }

    /// Stop every cyclic transmitter (end of test / shutdown).
    pub fn stop_io(&self) {
        for (_, task) in self.io_tasks.lock().drain() {
            task.abort();
        }
    }

    async fn read_delay(&self) {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    fn image_slot(&self, instance: u16, size: usize) -> Arc<Mutex<Vec<u8>>> {
        self.images
            .lock()
            .entry(instance)
            .or_insert_with(|| Arc::new(Mutex::new(vec![0u8; size])))
            .clone()
    }
}

impl Drop for SimBackend {
    fn drop(&mut self) {
        for (_, task) in self.io_tasks.lock().drain() {
            task.abort();
        }
    }
}

// ============================================================================
// Datagram codec
// ============================================================================

/// Minimal class-1 framing: connection id (u32 BE), sequence (u16 BE),
/// then the assembly data.
pub struct SimIoCodec;

impl IoPacketCodec for SimIoCodec {
    fn decode<'a>(&self, datagram: &'a [u8]) -> Option<IoPacket<'a>> {
        if datagram.len() < 6 {
            return None;
        }
        let connection_id = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        let sequence = u16::from_be_bytes([datagram[4], datagram[5]]);
        Some(IoPacket {
            connection_id,
            sequence,
            data: &datagram[6..],
        })
    }

    fn encode(&self, connection_id: u32, sequence: u16, data: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(6 + data.len());
        frame.extend_from_slice(&connection_id.to_be_bytes());
        frame.extend_from_slice(&sequence.to_be_bytes());
        frame.extend_from_slice(data);
        frame
    }
}

// ============================================================================
// Messaging client
// ============================================================================

struct SimMessagingClient {
    backend: Arc<SimBackend>,
    established: bool,
}

#[async_trait]
impl MessagingClient for SimMessagingClient {
    async fn connect(
        &mut self,
        _addr: SocketAddr,
        _path: Option<BackplanePath>,
    ) -> LinkResult<()> {
        if self.backend.refuse_connect.load(Ordering::SeqCst) {
            return Err(EnipError::connection("connection refused"));
        }
        self.established = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> LinkResult<()> {
        self.established = false;
        Ok(())
    }

    fn is_established(&self) -> bool {
        self.established
    }

    async fn read_tag(&mut self, tag: &SymbolicTag) -> LinkResult<PlcValue> {
        if !self.established {
            return Err(EnipError::NotConnected);
        }
        self.backend.read_delay().await;
        Ok(self
            .backend
            .tags
            .lock()
            .get(&tag.name)
            .cloned()
            .unwrap_or(PlcValue::Null))
    }

    async fn write_tag(&mut self, tag: &SymbolicTag, value: PlcValue) -> LinkResult<()> {
        if !self.established {
            return Err(EnipError::NotConnected);
        }
        self.backend
            .tag_writes
            .lock()
            .push((tag.name.clone(), value.clone()));
        self.backend.tags.lock().insert(tag.name.clone(), value);
        Ok(())
    }

    async fn read_tag_group(
        &mut self,
        tags: &[SymbolicTag],
    ) -> LinkResult<HashMap<String, PlcValue>> {
        if !self.established {
            return Err(EnipError::NotConnected);
        }
        self.backend.group_read_attempts.fetch_add(1, Ordering::SeqCst);
        if self.backend.fail_group_read.load(Ordering::SeqCst) {
            return Err(EnipError::service_unsupported());
        }
        self.backend.read_delay().await;
        let store = self.backend.tags.lock();
        Ok(tags
            .iter()
            .map(|tag| {
                (
                    tag.name.clone(),
                    store.get(&tag.name).cloned().unwrap_or(PlcValue::Null),
                )
            })
            .collect())
    }

    async fn get_attribute_single(
        &mut self,
        class: u16,
        instance: u16,
        attribute: u16,
    ) -> LinkResult<Vec<u8>> {
        if !self.established {
            return Err(EnipError::NotConnected);
        }
        self.backend.read_delay().await;
        self.backend
            .attributes
            .lock()
            .get(&(class, instance, attribute))
            .cloned()
            // 0x05: path destination unknown
            .ok_or(EnipError::cip(0x05, None))
    }

    async fn set_attribute_single(
        &mut self,
        class: u16,
        instance: u16,
        attribute: u16,
        data: &[u8],
    ) -> LinkResult<()> {
        if !self.established {
            return Err(EnipError::NotConnected);
        }
        self.backend
            .attribute_writes
            .lock()
            .push(((class, instance, attribute), data.to_vec()));
        self.backend
            .attributes
            .lock()
            .insert((class, instance, attribute), data.to_vec());
        Ok(())
    }

    async fn read_identity(&mut self) -> LinkResult<IdentityObject> {
        if !self.established {
            return Err(EnipError::NotConnected);
        }
        self.backend.identity_probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.backend.identity.lock().clone())
    }

    async fn list_tags(&mut self) -> LinkResult<Vec<TagListEntry>> {
        if !self.established {
            return Err(EnipError::NotConnected);
        }
        Ok(self.backend.catalog.lock().clone())
    }

    async fn forward_open(&mut self, request: &ForwardOpenRequest) -> LinkResult<ForwardOpenReply> {
        if !self.established {
            return Err(EnipError::NotConnected);
        }
        if self.backend.ownership_conflict.load(Ordering::SeqCst) {
            return Err(EnipError::ownership_conflict());
        }

        let o_to_t = self.backend.next_connection.fetch_add(2, Ordering::SeqCst);
        let t_to_o = o_to_t + 1;
        let reply = ForwardOpenReply {
            o_to_t_connection_id: o_to_t,
            t_to_o_connection_id: t_to_o,
            actual_rpi_ms: request.rpi_ms,
        };

        if !self.backend.silent_io.load(Ordering::SeqCst) {
            let image = self
                .backend
                .image_slot(request.input.instance, request.input.size as usize);
            let rpi = request.rpi_ms.max(1) as u64;
            let target: SocketAddr = ([127, 0, 0, 1], request.local_port).into();
            let task = tokio::spawn(async move {
                let socket = match UdpSocket::bind(("127.0.0.1", 0)).await {
                    Ok(socket) => socket,
                    Err(err) => {
                        debug!("sim io transmitter bind failed: {err}");
                        return;
                    },
                };
                let codec = SimIoCodec;
                let mut sequence: u16 = 0;
                let mut interval = tokio::time::interval(Duration::from_millis(rpi));
                loop {
                    interval.tick().await;
                    let data = image.lock().clone();
                    let frame = codec.encode(t_to_o, sequence, &data);
                    sequence = sequence.wrapping_add(1);
                    if let Err(err) = socket.send_to(&frame, target).await {
                        debug!("sim io transmit error: {err}");
                    }
                }
            });
            self.backend.io_tasks.lock().insert(o_to_t, task);
        }

        Ok(reply)
    }

    async fn forward_close(&mut self, o_to_t_connection_id: u32) -> LinkResult<()> {
        if let Some(task) = self.backend.io_tasks.lock().remove(&o_to_t_connection_id) {
            task.abort();
        }
        Ok(())
    }
}

// ============================================================================
// Discovery
// ============================================================================

struct SimDiscovery {
    backend: Arc<SimBackend>,
}

#[async_trait]
impl DeviceDiscovery for SimDiscovery {
    async fn browse(&self, _port: u16, window: Duration) -> LinkResult<Vec<DiscoveredDevice>> {
        tokio::time::sleep(window).await;
        Ok(self.backend.discovered.lock().clone())
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Transport factory handing out clients bound to one shared simulated
/// device.
pub struct SimFactory {
    backend: Arc<SimBackend>,
}

impl SimFactory {
    pub fn new(backend: Arc<SimBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> Arc<SimBackend> {
        self.backend.clone()
    }
}

impl ClientFactory for SimFactory {
    fn messaging(&self) -> Box<dyn MessagingClient> {
        Box::new(SimMessagingClient {
            backend: self.backend.clone(),
            established: false,
        })
    }

    fn io_codec(&self) -> Arc<dyn IoPacketCodec> {
        Arc::new(SimIoCodec)
    }

    fn discovery(&self) -> Box<dyn DeviceDiscovery> {
        Box::new(SimDiscovery {
            backend: self.backend.clone(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
