//! Core EtherNet/IP Traits
//!
//! The contract between the driver core and a transport backend. All
//! wire-level concerns (encapsulation framing, CIP request encoding,
//! class-1 datagram headers) live behind these traits.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    BackplanePath, DiscoveredDevice, ForwardOpenReply, ForwardOpenRequest, IdentityObject,
    IoPacket, PlcValue, SymbolicTag, TagListEntry,
};

// ============================================================================
// Messaging channel
// ============================================================================

/// Connection-oriented messaging client.
///
/// Carries both symbolic tag access and explicit (class/instance/attribute)
/// messaging over a single request/response channel, plus the forward-open
/// handshakes that establish cyclic IO connections.
///
/// @lifecycle connect → read/write → disconnect
/// @errors CIP-level rejections surface as `EnipError::Cip` with the reply
///         status codes preserved
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Open the channel to the target, optionally routing through a
    /// chassis backplane.
    async fn connect(&mut self, addr: SocketAddr, path: Option<BackplanePath>) -> Result<()>;

    /// Close the channel. Implementations should release the socket even
    /// when the remote never acknowledges the close.
    async fn disconnect(&mut self) -> Result<()>;

    /// Check channel status
    fn is_established(&self) -> bool;

    /// Read one symbolic tag
    async fn read_tag(&mut self, tag: &SymbolicTag) -> Result<PlcValue>;

    /// Write one symbolic tag
    async fn write_tag(&mut self, tag: &SymbolicTag, value: PlcValue) -> Result<()>;

    /// Read a batch of symbolic tags in one round trip, keyed by tag name.
    ///
    /// Targets that do not implement the batched service reject it with
    /// CIP status 0x08; callers are expected to fall back to per-tag reads.
    async fn read_tag_group(
        &mut self,
        tags: &[SymbolicTag],
    ) -> Result<HashMap<String, PlcValue>>;

    /// Explicit read of a single attribute
    async fn get_attribute_single(
        &mut self,
        class: u16,
        instance: u16,
        attribute: u16,
    ) -> Result<Vec<u8>>;

    /// Explicit write of a single attribute
    async fn set_attribute_single(
        &mut self,
        class: u16,
        instance: u16,
        attribute: u16,
        data: &[u8],
    ) -> Result<()>;

    /// Read the identity object. Cheap request used as an idle keep-alive
    /// probe.
    async fn read_identity(&mut self) -> Result<IdentityObject>;

    /// Retrieve the controller's full symbolic tag catalog
    async fn list_tags(&mut self) -> Result<Vec<TagListEntry>>;

    /// Establish one cyclic IO connection.
    ///
    /// A successful reply only means the target accepted the request;
    /// whether it ever transmits data is a separate question.
    async fn forward_open(&mut self, request: &ForwardOpenRequest) -> Result<ForwardOpenReply>;

    /// Tear down a cyclic IO connection (best-effort)
    async fn forward_close(&mut self, o_to_t_connection_id: u32) -> Result<()>;
}

// ============================================================================
// Class-1 datagram codec
// ============================================================================

/// Encoder/decoder for the cyclic IO datagrams exchanged on the shared
/// UDP socket.
pub trait IoPacketCodec: Send + Sync {
    /// Decode an inbound datagram; `None` for frames that are not class-1
    /// data (they are dropped silently).
    fn decode<'a>(&self, datagram: &'a [u8]) -> Option<IoPacket<'a>>;

    /// Encode an outbound datagram for the given connection
    fn encode(&self, connection_id: u32, sequence: u16, data: &[u8]) -> Vec<u8>;
}

// ============================================================================
// Discovery
// ============================================================================

/// Network discovery via the well-known announcement port.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    /// Listen on `port` for `window` and return every device that
    /// announced itself.
    async fn browse(&self, port: u16, window: Duration) -> Result<Vec<DiscoveredDevice>>;
}

// ============================================================================
// Backend factory
// ============================================================================

/// Produces the transport pieces a device driver needs.
///
/// One factory per backend (real stack, simulator); the driver holds it as
/// a trait object so every channel it opens — steady-state or throwaway —
/// comes from the same backend.
pub trait ClientFactory: Send + Sync {
    /// A fresh, unconnected messaging client
    fn messaging(&self) -> Box<dyn MessagingClient>;

    /// The datagram codec shared by all IO sessions of this backend
    fn io_codec(&self) -> Arc<dyn IoPacketCodec>;

    /// A discovery listener
    fn discovery(&self) -> Box<dyn DeviceDiscovery>;
}
