//! End-to-end driver flows against the simulated backend
//!
//! Each test builds one device, wires the event channel and drives the
//! public surface the way the host runtime would: connect, poll on a
//! cadence, write, disconnect.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use enip_link::types::data_type;
use enip_link::{AssemblyInstance, PlcValue};
use enipsrv::config::{
    DaqPolicy, DeviceConfig, DeviceProperty, IoDataKind, ModuleConfig, TagConfig, TagSource,
};
use enipsrv::device::EnipDevice;
use enipsrv::sim::{SimBackend, SimFactory};
use enipsrv::{DaqSink, DeviceEvent, DeviceStatus, EnipSrvError, ValueRecord};

// ============================================================================
// Builders
// ============================================================================

fn symbolic_tag(id: &str, address: &str, divisor: f64) -> TagConfig {
    TagConfig {
        id: id.to_string(),
        name: id.to_string(),
        address: address.to_string(),
        tag_type: Some("number".into()),
        format: None,
        divisor,
        daq: DaqPolicy::default(),
        source: TagSource::Symbolic {
            program: None,
            data_type: data_type::DINT,
        },
    }
}

fn explicit_tag(id: &str, triple: Option<(u16, u16, u16)>, get_or_send: bool) -> TagConfig {
    let (class, instance, attribute) = match triple {
        Some((c, i, a)) => (Some(c), Some(i), Some(a)),
        None => (None, None, None),
    };
    TagConfig {
        id: id.to_string(),
        name: id.to_string(),
        address: String::new(),
        tag_type: Some("bytes".into()),
        format: None,
        divisor: 1.0,
        daq: DaqPolicy::default(),
        source: TagSource::Explicit {
            class,
            instance,
            attribute,
            get_or_send,
            send_buffer: None,
        },
    }
}

fn io_tag(
    id: &str,
    module_id: &str,
    data: IoDataKind,
    byte_offset: u16,
    bit_offset: Option<u8>,
    output: bool,
) -> TagConfig {
    TagConfig {
        id: id.to_string(),
        name: id.to_string(),
        address: String::new(),
        tag_type: Some("io".into()),
        format: None,
        divisor: 1.0,
        daq: DaqPolicy::default(),
        source: TagSource::AssemblyIo {
            module_id: module_id.to_string(),
            data,
            byte_offset,
            bit_offset,
            output,
        },
    }
}

fn module(id: &str, rpi_ms: u32, timeout_ms: u64) -> ModuleConfig {
    ModuleConfig {
        id: id.to_string(),
        name: None,
        configuration: AssemblyInstance::new(1, 0),
        input: AssemblyInstance::new(101, 4),
        output: AssemblyInstance::new(102, 4),
        rpi_ms,
        timeout_ms: Some(timeout_ms),
    }
}

fn device_config(tags: Vec<TagConfig>, modules: Vec<ModuleConfig>, ioport: u16) -> DeviceConfig {
    DeviceConfig {
        id: "dev1".into(),
        name: "Test Device".into(),
        enabled: true,
        property: DeviceProperty {
            address: Some("127.0.0.1".into()),
            ioport: Some(ioport),
            rack: None,
            slot: None,
            options: false,
        },
        tags: tags.into_iter().map(|t| (t.id.clone(), t)).collect(),
        modules: modules.into_iter().map(|m| (m.id.clone(), m)).collect(),
    }
}

type EventRx = tokio::sync::mpsc::UnboundedReceiver<DeviceEvent>;

fn build_device(config: DeviceConfig) -> (Arc<EnipDevice>, Arc<SimBackend>, EventRx) {
    let backend = SimBackend::new();
    let factory = Arc::new(SimFactory::new(backend.clone()));
    let (events, rx) = tokio::sync::mpsc::unbounded_channel();
    let device = Arc::new(EnipDevice::new(config, events, factory));
    (device, backend, rx)
}

fn drain(rx: &mut EventRx) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn statuses(events: &[DeviceEvent]) -> Vec<DeviceStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::Status { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

fn value_lists(events: &[DeviceEvent]) -> Vec<Vec<ValueRecord>> {
    events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::Values { values, .. } => Some(values.clone()),
            _ => None,
        })
        .collect()
}

#[derive(Default)]
struct RecordingSink {
    calls: Mutex<Vec<HashMap<String, ValueRecord>>>,
}

impl DaqSink for RecordingSink {
    fn add_daq(&self, changed: HashMap<String, ValueRecord>, _device_name: &str, _device_id: &str) {
        self.calls.lock().unwrap().push(changed);
    }
}

// ============================================================================
// Connect / poll / disconnect
// ============================================================================

#[tokio::test]
async fn connect_poll_and_disconnect_symbolic() {
    let (device, backend, mut rx) = build_device(device_config(
        vec![
            symbolic_tag("speed", "Pump.Speed", 10.0),
            symbolic_tag("level", "Tank.Level", 1.0),
        ],
        vec![],
        42101,
    ));
    backend.set_tag("Pump.Speed", PlcValue::Integer(250));
    backend.set_tag("Tank.Level", PlcValue::Integer(7));

    device.connect().await.unwrap();
    assert!(device.is_connected());

    device.poll().await.unwrap();
    assert!(device.last_read_timestamp() > 0);

    let speed = device.get_value("speed").unwrap();
    assert_eq!(speed.value, PlcValue::Float(25.0)); // 250 / 10
    let level = device.get_value("level").unwrap();
    assert_eq!(level.value, PlcValue::Integer(7));

    device.disconnect().await.unwrap();
    assert!(!device.is_connected());

    let events = drain(&mut rx);
    let statuses = statuses(&events);
    assert_eq!(
        statuses,
        vec![DeviceStatus::ConnectOk, DeviceStatus::ConnectOff]
    );
    // poll emitted one value list, disconnect emitted the cleared list
    let lists = value_lists(&events);
    assert_eq!(lists.len(), 2);
    assert!(lists[1].iter().all(|r| r.value.is_null()));
}

#[tokio::test]
async fn disconnect_nulls_every_cached_value() {
    let (device, backend, _rx) = build_device(device_config(
        vec![symbolic_tag("t1", "T1", 1.0)],
        vec![],
        42102,
    ));
    backend.set_tag("T1", PlcValue::Integer(5));

    device.connect().await.unwrap();
    device.poll().await.unwrap();
    assert_eq!(device.get_value("t1").unwrap().value, PlcValue::Integer(5));

    device.disconnect().await.unwrap();
    assert!(!device.is_connected());
    for record in device.get_values() {
        assert!(record.value.is_null());
    }
}

#[tokio::test]
async fn connect_without_address_reports_connect_failed() {
    let mut config = device_config(vec![], vec![], 42103);
    config.property.address = None;
    let (device, _backend, mut rx) = build_device(config);

    let err = device.connect().await.unwrap_err();
    assert!(matches!(err, EnipSrvError::Config(_)));
    assert_eq!(statuses(&drain(&mut rx)), vec![DeviceStatus::ConnectFailed]);
}

#[tokio::test]
async fn refused_connect_reports_connect_error() {
    let (device, backend, mut rx) = build_device(device_config(
        vec![symbolic_tag("t1", "T1", 1.0)],
        vec![],
        42104,
    ));
    backend.refuse_connect.store(true, Ordering::SeqCst);

    assert!(device.connect().await.is_err());
    assert!(!device.is_connected());
    assert_eq!(statuses(&drain(&mut rx)), vec![DeviceStatus::ConnectError]);

    // host retries on its own cadence; the next attempt succeeds
    backend.refuse_connect.store(false, Ordering::SeqCst);
    device.connect().await.unwrap();
    assert!(device.is_connected());
}

// ============================================================================
// Group-read capability fallback
// ============================================================================

#[tokio::test]
async fn group_read_unsupported_falls_back_permanently() {
    let (device, backend, _rx) = build_device(device_config(
        vec![
            symbolic_tag("a", "TagA", 1.0),
            symbolic_tag("b", "TagB", 1.0),
        ],
        vec![],
        42105,
    ));
    backend.set_tag("TagA", PlcValue::Integer(1));
    backend.set_tag("TagB", PlcValue::Integer(2));
    backend.fail_group_read.store(true, Ordering::SeqCst);

    device.connect().await.unwrap();

    // First poll: the group service is rejected with 0x08; the cycle
    // completes without symbolic values.
    device.poll().await.unwrap();
    assert_eq!(backend.group_read_attempts(), 1);
    assert!(device.get_value("a").is_none());

    // Second poll reads one tag at a time and never retries the group.
    device.poll().await.unwrap();
    assert_eq!(backend.group_read_attempts(), 1);
    assert_eq!(device.get_value("a").unwrap().value, PlcValue::Integer(1));
    assert_eq!(device.get_value("b").unwrap().value, PlcValue::Integer(2));

    device.poll().await.unwrap();
    assert_eq!(backend.group_read_attempts(), 1);
}

// ============================================================================
// Busy-guard / overload
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_poll_is_rejected_and_counted() {
    let (device, backend, _rx) = build_device(device_config(
        vec![symbolic_tag("slow", "Slow", 1.0)],
        vec![],
        42106,
    ));
    backend.set_tag("Slow", PlcValue::Integer(1));
    backend.set_read_delay(Duration::from_millis(400));

    device.connect().await.unwrap();
    assert_eq!(device.overload_count(), 0);

    let slow_device = device.clone();
    let slow_poll = tokio::spawn(async move { slow_device.poll().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The overlapping call returns immediately without reading and is
    // counted, never queued.
    let started = std::time::Instant::now();
    device.poll().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(device.overload_count(), 1);

    slow_poll.await.unwrap().unwrap();
    // taking the guard again resets the counter
    device.poll().await.unwrap();
    assert_eq!(device.overload_count(), 0);
}

// ============================================================================
// Cyclic IO
// ============================================================================

#[tokio::test]
async fn io_tags_read_from_session_tables() {
    let tags = vec![
        io_tag("run", "m1", IoDataKind::Bit, 0, Some(0), false),
        io_tag("count", "m1", IoDataKind::Word16, 2, None, false),
        io_tag("cmd", "m1", IoDataKind::Word16, 0, None, true),
    ];
    let (device, backend, _rx) = build_device(device_config(
        tags,
        vec![module("m1", 50, 500)],
        42107,
    ));
    // bit 0 of byte 0 set, word at bytes 2..4 = 513 (little-endian)
    backend.set_input_image(101, vec![0b0000_0001, 0x00, 0x01, 0x02]);

    device.connect().await.unwrap();
    assert!(device.is_connected());

    // let at least one more datagram land
    tokio::time::sleep(Duration::from_millis(120)).await;
    device.poll().await.unwrap();

    assert_eq!(device.get_value("run").unwrap().value, PlcValue::Bool(true));
    assert_eq!(
        device.get_value("count").unwrap().value,
        PlcValue::Integer(0x0201)
    );

    // output tag: written into the table, visible only via the cyclic
    // exchange, call returns immediately
    assert!(device.set_value("cmd", "513"));

    device.disconnect().await.unwrap();
}

#[tokio::test]
async fn silent_io_module_fails_connect_with_session_error() {
    let (device, backend, mut rx) = build_device(device_config(
        vec![io_tag("run", "m1", IoDataKind::Bit, 0, Some(0), false)],
        vec![module("m1", 500, 500)],
        42108,
    ));
    // forward-open accepted, but the module never transmits
    backend.silent_io.store(true, Ordering::SeqCst);

    let err = device.connect().await.unwrap_err();
    match err {
        EnipSrvError::IoSession {
            pending,
            ownership_conflict,
            ..
        } => {
            assert_eq!(pending, vec!["m1".to_string()]);
            assert!(!ownership_conflict);
        },
        other => panic!("expected IoSession error, got {other:?}"),
    }
    assert!(!device.is_connected());
    assert_eq!(statuses(&drain(&mut rx)), vec![DeviceStatus::ConnectError]);
}

#[tokio::test]
async fn ownership_conflict_is_flagged_distinctly() {
    let (device, backend, _rx) = build_device(device_config(
        vec![],
        vec![module("m1", 500, 500)],
        42109,
    ));
    backend.ownership_conflict.store(true, Ordering::SeqCst);

    let err = device.connect().await.unwrap_err();
    match err {
        EnipSrvError::IoSession {
            ownership_conflict, ..
        } => assert!(ownership_conflict),
        other => panic!("expected IoSession error, got {other:?}"),
    }
}

// ============================================================================
// Writes
// ============================================================================

#[tokio::test]
async fn set_value_on_input_only_io_tag_returns_false() {
    let tags = vec![io_tag("sensor", "m1", IoDataKind::Bit, 0, Some(0), false)];
    let (device, backend, _rx) = build_device(device_config(
        tags,
        vec![module("m1", 50, 500)],
        42110,
    ));
    backend.set_input_image(101, vec![0; 4]);

    // disconnected: no write, no panic
    assert!(!device.set_value("sensor", "1"));

    device.connect().await.unwrap();
    // connected: an input tag still refuses the write
    assert!(!device.set_value("sensor", "1"));

    device.disconnect().await.unwrap();
}

#[tokio::test]
async fn symbolic_write_is_fire_and_forget() {
    let (device, backend, _rx) = build_device(device_config(
        vec![symbolic_tag("speed", "Pump.Speed", 10.0)],
        vec![],
        42111,
    ));
    backend.set_tag("Pump.Speed", PlcValue::Integer(0));

    device.connect().await.unwrap();

    // engineering 2.5 -> raw 25 through the divisor
    assert!(device.set_value("speed", "2.5"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let writes = backend.tag_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, "Pump.Speed");
    assert_eq!(writes[0].1, PlcValue::Float(25.0));
}

#[tokio::test]
async fn explicit_write_parses_hex_and_validates_triple() {
    let (device, backend, _rx) = build_device(device_config(
        vec![
            explicit_tag("ok", Some((0x04, 100, 3)), false),
            explicit_tag("incomplete", None, false),
        ],
        vec![],
        42112,
    ));

    device.connect().await.unwrap();

    // missing class/instance/attribute: configuration error, not dispatched
    assert!(!device.set_value("incomplete", "0102"));

    // malformed hex: rejected before dispatch
    assert!(!device.set_value("ok", "zz"));

    // whitespace is stripped from the buffer
    assert!(device.set_value("ok", "0A 1B 2C"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let writes = backend.attribute_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, (0x04, 100, 3));
    assert_eq!(writes[0].1, vec![0x0A, 0x1B, 0x2C]);
}

#[tokio::test]
async fn explicit_poll_reads_and_skips_send_only() {
    let (device, backend, _rx) = build_device(device_config(
        vec![
            explicit_tag("status", Some((0x04, 100, 3)), true),
            explicit_tag("command", Some((0x04, 101, 3)), false),
        ],
        vec![],
        42113,
    ));
    backend.set_attribute(0x04, 100, 3, vec![0x12, 0x34]);

    device.connect().await.unwrap();
    device.poll().await.unwrap();

    assert_eq!(
        device.get_value("status").unwrap().value,
        PlcValue::Bytes(vec![0x12, 0x34])
    );
    // send-only tags are never read
    assert!(device.get_value("command").is_none());
}

// ============================================================================
// DAQ policy
// ============================================================================

#[tokio::test]
async fn unchanged_raw_is_emitted_but_not_persisted() {
    let (device, backend, mut rx) = build_device(device_config(
        vec![symbolic_tag("t1", "T1", 1.0)],
        vec![],
        42114,
    ));
    backend.set_tag("T1", PlcValue::Integer(5));
    let sink = Arc::new(RecordingSink::default());
    device.bind_daq(sink.clone());

    device.connect().await.unwrap();

    device.poll().await.unwrap();
    assert_eq!(sink.calls.lock().unwrap().len(), 1);

    // same raw value: in the emitted list, absent from the DAQ change-set
    device.poll().await.unwrap();
    assert_eq!(sink.calls.lock().unwrap().len(), 1);

    backend.set_tag("T1", PlcValue::Integer(6));
    device.poll().await.unwrap();
    assert_eq!(sink.calls.lock().unwrap().len(), 2);

    let lists = value_lists(&drain(&mut rx));
    assert_eq!(lists.len(), 3, "every poll emits the value list");
}

// ============================================================================
// Keep-alive
// ============================================================================

#[tokio::test]
async fn poll_without_tags_probes_identity() {
    let (device, backend, _rx) = build_device(device_config(vec![], vec![], 42115));

    device.connect().await.unwrap();
    assert_eq!(backend.identity_probes(), 0);

    device.poll().await.unwrap();
    device.poll().await.unwrap();
    assert_eq!(backend.identity_probes(), 2);
    // keep-alive produces no values
    assert!(device.get_values().is_empty());
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn browse_groups_catalog_by_program() {
    use enip_link::TagListEntry;
    let (device, backend, _rx) = build_device(device_config(vec![], vec![], 42116));
    backend.set_catalog(vec![
        TagListEntry {
            name: "GlobalCounter".into(),
            program: None,
            data_type: data_type::DINT,
        },
        TagListEntry {
            name: "Speed".into(),
            program: Some("Line1".into()),
            data_type: data_type::REAL,
        },
        TagListEntry {
            name: "Level".into(),
            program: Some("Line1".into()),
            data_type: data_type::REAL,
        },
    ]);

    let groups = device.browse().await.unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups.get("global").unwrap().len(), 1);
    assert_eq!(groups.get("Line1").unwrap().len(), 2);
    // throwaway connection: the steady-state machine is untouched
    assert!(!device.is_connected());
}

#[tokio::test(start_paused = true)]
async fn browse_for_devices_returns_announcements() {
    use enip_link::types::DiscoveredDevice;
    let (device, backend, _rx) = build_device(device_config(vec![], vec![], 42117));
    backend.set_discovered(vec![DiscoveredDevice {
        identity: Default::default(),
        encap_version: 1,
        socket_addr: ([192, 168, 1, 50], 44818).into(),
    }]);

    let found = device.browse_for_devices().await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].encap_version, 1);
}
