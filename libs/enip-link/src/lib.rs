//! EtherNet/IP Link Library
//!
//! Protocol-facing abstractions shared by EtherNet/IP services: the CIP
//! data model (elementary type codes, values, identity objects, tag
//! catalog entries), the messaging-client and discovery traits, and the
//! class-1 datagram codec seam.
//!
//! The wire-level encapsulation itself lives behind these traits; this
//! crate defines the contract a transport backend has to satisfy, so the
//! driver logic above it can be exercised against a simulator as well as
//! a real stack.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{EnipError, Result};
pub use traits::{ClientFactory, DeviceDiscovery, IoPacketCodec, MessagingClient};
pub use types::{
    AssemblyInstance, BackplanePath, DiscoveredDevice, ForwardOpenReply, ForwardOpenRequest,
    IdentityObject, IoPacket, PlcValue, SymbolicTag, TagListEntry,
};
