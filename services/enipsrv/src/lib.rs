//! EtherNet/IP Device Driver Service
//!
//! An async industrial device driver that keeps a live connection to a
//! remote controller, continuously polls a configured set of tags and
//! exposes both cyclic (scanned) and on-demand (explicit) read/write
//! access to a supervisory host.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────────┐    ┌─────────────────┐
//! │  DeviceConfig   │───►│     EnipDevice       │───►│  DeviceEvent    │
//! │  (YAML/JSON)    │    │  connect/poll/write  │    │  (status/value) │
//! └─────────────────┘    └──────────────────────┘    └─────────────────┘
//!                           │               │
//!                           ▼               ▼
//!                  ┌─────────────────┐  ┌─────────────────┐
//!                  │   Messaging     │  │   IO Scanner    │
//!                  │   Connection    │  │  (cyclic UDP)   │
//!                  └─────────────────┘  └─────────────────┘
//! ```
//!
//! Two transport classes per device: one request/response messaging
//! channel carrying explicit and symbolic traffic, and zero or more
//! cyclic datagram sessions (one per configured IO module) sharing a
//! process-wide UDP listener. The wire-level stack lives behind the
//! `enip-link` traits; the in-tree [`sim`] backend stands in for it in
//! tests and the demo binary.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use enipsrv::device::EnipDevice;
//! use enipsrv::sim::{SimBackend, SimFactory};
//!
//! #[tokio::main]
//! async fn main() -> enipsrv::Result<()> {
//!     let config = enipsrv::config::load_from_file("device.yaml".as_ref())?;
//!     let (events, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     let factory = Arc::new(SimFactory::new(SimBackend::new()));
//!     let device = EnipDevice::new(config, events, factory);
//!
//!     device.connect().await?;
//!     device.poll().await?;
//!     while let Ok(event) = rx.try_recv() {
//!         println!("{event:?}");
//!     }
//!     device.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod registry;
pub mod sim;

pub use config::{DaqPolicy, DaqPolicyUpdate, DeviceConfig, ModuleConfig, TagConfig, TagSource};
pub use device::{ConnectionState, EnipDevice, TagValue};
pub use error::{EnipSrvError, Result};
pub use events::{DaqSink, DeviceEvent, DeviceStatus, EventSender};
pub use registry::{TagProperty, ValueRecord};
