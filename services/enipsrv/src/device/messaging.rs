//! Messaging connection
//!
//! The single request/response channel of a device. Carries explicit
//! attribute access and symbolic tag access, owns the per-connection
//! tag-group capability flag and the idle keep-alive probe.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, info};

use enip_link::types::BackplanePath;
use enip_link::{ClientFactory, MessagingClient, PlcValue, SymbolicTag, TagListEntry};

use crate::config::{TagConfig, TagSource};
use crate::error::Result;
use crate::events::DeviceLogger;

/// Connection-oriented messaging channel of one device.
pub struct MessagingConnection {
    client: Box<dyn MessagingClient>,
    logger: DeviceLogger,
    /// Set once to false the first time the controller rejects the group
    /// service; never re-probed for the lifetime of this connection.
    supports_tag_group: bool,
}

impl MessagingConnection {
    /// Open the channel to the target.
    pub async fn open(
        factory: &dyn ClientFactory,
        addr: SocketAddr,
        path: Option<BackplanePath>,
        logger: DeviceLogger,
    ) -> Result<Self> {
        let mut client = factory.messaging();
        client.connect(addr, path).await?;
        logger.log_connect(&addr.to_string(), "messaging channel established");
        Ok(Self {
            client,
            logger,
            supports_tag_group: true,
        })
    }

    pub fn is_established(&self) -> bool {
        self.client.is_established()
    }

    pub fn supports_tag_group(&self) -> bool {
        self.supports_tag_group
    }

    /// Close the channel. Best-effort: a close failure is returned for
    /// logging, but the handle is force-released either way (dropping the
    /// client tears the socket down rather than leaving it dangling).
    pub async fn close(&mut self) -> Result<()> {
        match self.client.disconnect().await {
            Ok(()) => {
                debug!(device = %self.logger.device_name, "message connection closed");
                Ok(())
            },
            Err(err) => {
                debug!(
                    device = %self.logger.device_name,
                    "error disconnecting message connection, forcing close: {err}"
                );
                Err(err.into())
            },
        }
    }

    /// Explicit read of one attribute.
    pub async fn read_attribute(
        &mut self,
        class: u16,
        instance: u16,
        attribute: u16,
    ) -> Result<Vec<u8>> {
        Ok(self
            .client
            .get_attribute_single(class, instance, attribute)
            .await?)
    }

    /// Explicit write of one attribute.
    pub async fn write_attribute(
        &mut self,
        class: u16,
        instance: u16,
        attribute: u16,
        data: &[u8],
    ) -> Result<()> {
        Ok(self
            .client
            .set_attribute_single(class, instance, attribute, data)
            .await?)
    }

    /// Read a set of symbolic tags, keyed by tag id.
    ///
    /// Uses the batched group service while the controller supports it.
    /// The first "service not supported" rejection flips the capability
    /// flag permanently; that poll returns no symbolic values and every
    /// later call reads one tag at a time.
    pub async fn read_symbolic_tags(
        &mut self,
        tags: &[TagConfig],
    ) -> Result<HashMap<String, PlcValue>> {
        let mut items = HashMap::new();
        if tags.is_empty() {
            return Ok(items);
        }

        let symbols: Vec<(String, SymbolicTag)> = tags
            .iter()
            .map(|tag| (tag.id.clone(), symbolic_ref(tag)))
            .collect();

        if self.supports_tag_group {
            let group: Vec<SymbolicTag> = symbols.iter().map(|(_, s)| s.clone()).collect();
            match self.client.read_tag_group(&group).await {
                Ok(by_name) => {
                    for (id, symbol) in &symbols {
                        if let Some(value) = by_name.get(&symbol.name) {
                            items.insert(id.clone(), value.clone());
                        }
                    }
                    Ok(items)
                },
                Err(err) if err.is_service_unsupported() => {
                    info!(
                        device = %self.logger.device_name,
                        "controller does not support group symbolic tag reads"
                    );
                    // next polling cycle falls back to single reads
                    self.supports_tag_group = false;
                    Ok(items)
                },
                Err(err) => Err(err.into()),
            }
        } else {
            for (id, symbol) in &symbols {
                let value = self.client.read_tag(symbol).await?;
                let value = match value {
                    PlcValue::Null => PlcValue::String(String::new()),
                    other => other,
                };
                items.insert(id.clone(), value);
            }
            Ok(items)
        }
    }

    /// Write one symbolic tag.
    pub async fn write_symbolic(&mut self, tag: &TagConfig, value: PlcValue) -> Result<()> {
        Ok(self.client.write_tag(&symbolic_ref(tag), value).await?)
    }

    /// Identity probe keeping the channel alive when there is nothing to
    /// poll.
    pub async fn keep_alive(&mut self) -> Result<()> {
        self.client.read_identity().await?;
        Ok(())
    }

    /// Full symbolic tag catalog of the controller.
    pub async fn tag_list(&mut self) -> Result<Vec<TagListEntry>> {
        Ok(self.client.list_tags().await?)
    }
}

/// Symbolic reference for the link layer, built from the tag's address and
/// declared scope/type.
fn symbolic_ref(tag: &TagConfig) -> SymbolicTag {
    match &tag.source {
        TagSource::Symbolic { program, data_type } => SymbolicTag::new(tag.address.clone())
            .with_program(program.clone())
            .with_data_type(Some(*data_type)),
        _ => SymbolicTag::new(tag.address.clone()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use enip_link::types::{ForwardOpenReply, ForwardOpenRequest, IdentityObject};
    use enip_link::EnipError;

    use crate::config::DaqPolicy;

    struct FlakyGroupClient {
        group_calls: Arc<AtomicU32>,
        single_calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl MessagingClient for FlakyGroupClient {
        async fn connect(
            &mut self,
            _addr: SocketAddr,
            _path: Option<BackplanePath>,
        ) -> enip_link::Result<()> {
            Ok(())
        }

        async fn disconnect(&mut self) -> enip_link::Result<()> {
            Ok(())
        }

        fn is_established(&self) -> bool {
            true
        }

        async fn read_tag(&mut self, _tag: &SymbolicTag) -> enip_link::Result<PlcValue> {
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            Ok(PlcValue::Integer(7))
        }

        async fn write_tag(
            &mut self,
            _tag: &SymbolicTag,
            _value: PlcValue,
        ) -> enip_link::Result<()> {
            Ok(())
        }

        async fn read_tag_group(
            &mut self,
            _tags: &[SymbolicTag],
        ) -> enip_link::Result<HashMap<String, PlcValue>> {
            self.group_calls.fetch_add(1, Ordering::SeqCst);
            Err(EnipError::service_unsupported())
        }

        async fn get_attribute_single(
            &mut self,
            _class: u16,
            _instance: u16,
            _attribute: u16,
        ) -> enip_link::Result<Vec<u8>> {
            Ok(vec![])
        }

        async fn set_attribute_single(
            &mut self,
            _class: u16,
            _instance: u16,
            _attribute: u16,
            _data: &[u8],
        ) -> enip_link::Result<()> {
            Ok(())
        }

        async fn read_identity(&mut self) -> enip_link::Result<IdentityObject> {
            Ok(IdentityObject::default())
        }

        async fn list_tags(&mut self) -> enip_link::Result<Vec<TagListEntry>> {
            Ok(vec![])
        }

        async fn forward_open(
            &mut self,
            _request: &ForwardOpenRequest,
        ) -> enip_link::Result<ForwardOpenReply> {
            Err(EnipError::NotSupported("io".into()))
        }

        async fn forward_close(&mut self, _id: u32) -> enip_link::Result<()> {
            Ok(())
        }
    }

    fn symbolic_tag(id: &str) -> TagConfig {
        TagConfig {
            id: id.to_string(),
            name: id.to_string(),
            address: format!("Sym_{id}"),
            tag_type: None,
            format: None,
            divisor: 1.0,
            daq: DaqPolicy::default(),
            source: TagSource::Symbolic {
                program: None,
                data_type: enip_link::types::data_type::DINT,
            },
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_group_fallback_is_permanent() {
        let group_calls = Arc::new(AtomicU32::new(0));
        let single_calls = Arc::new(AtomicU32::new(0));
        let mut conn = MessagingConnection {
            client: Box::new(FlakyGroupClient {
                group_calls: group_calls.clone(),
                single_calls: single_calls.clone(),
            }),
            logger: DeviceLogger::new("d1", "Device 1"),
            supports_tag_group: true,
        };

        let tags = vec![symbolic_tag("a"), symbolic_tag("b")];

        // First read: group rejected with 0x08, no values this cycle
        let items = conn.read_symbolic_tags(&tags).await.unwrap();
        assert!(items.is_empty());
        assert!(!conn.supports_tag_group());
        assert_eq!(group_calls.load(Ordering::SeqCst), 1);
        assert!(logs_contain("does not support group symbolic tag reads"));

        // Second read: per-tag, group never attempted again
        let items = conn.read_symbolic_tags(&tags).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(group_calls.load(Ordering::SeqCst), 1);
        assert_eq!(single_calls.load(Ordering::SeqCst), 2);
        assert_eq!(items.get("a"), Some(&PlcValue::Integer(7)));
    }
}
