//! Tag registry
//!
//! Indexes the configured tags and carries the per-tag value records: last
//! raw value, composed value, change flag and timestamp. Records are
//! mutated only by the poll cycle, reset on load and nulled on disconnect.

use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use enip_link::PlcValue;

use crate::codec;
use crate::config::{DaqPolicy, DaqPolicyUpdate, TagConfig, TagSource};

/// One tag's current value as emitted to the host.
#[derive(Debug, Clone, Serialize)]
pub struct ValueRecord {
    pub id: String,
    pub value: PlcValue,
    #[serde(skip_serializing)]
    pub raw: PlcValue,
    #[serde(rename = "type")]
    pub tag_type: Option<String>,
    pub daq: DaqPolicy,
    pub changed: bool,
    pub timestamp: i64,
}

/// Tag metadata projection for the host UI.
#[derive(Debug, Clone, Serialize)]
pub struct TagProperty {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub tag_type: Option<String>,
    pub format: Option<String>,
}

/// Tag index plus value cache for one device.
#[derive(Debug, Default)]
pub struct TagRegistry {
    tags: RwLock<HashMap<String, TagConfig>>,
    values: DashMap<String, ValueRecord>,
    last_daq: DashMap<String, i64>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tag table wholesale and drop every cached value.
    pub fn load(&self, tags: HashMap<String, TagConfig>) {
        *self.tags.write() = tags;
        self.values.clear();
        self.last_daq.clear();
    }

    pub fn tag(&self, id: &str) -> Option<TagConfig> {
        self.tags.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tags.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.read().is_empty()
    }

    /// Input-direction assembly-IO tags, read from session tables.
    pub fn io_input_tags(&self) -> Vec<TagConfig> {
        self.filter_tags(|tag| {
            matches!(tag.source, TagSource::AssemblyIo { output: false, .. })
        })
    }

    /// All assembly-IO tags, both directions (for session tag maps).
    pub fn io_tags(&self) -> Vec<TagConfig> {
        self.filter_tags(|tag| matches!(tag.source, TagSource::AssemblyIo { .. }))
    }

    /// Explicit tags polled during the read cycle; send-only tags are
    /// skipped.
    pub fn explicit_read_tags(&self) -> Vec<TagConfig> {
        self.filter_tags(|tag| {
            matches!(
                tag.source,
                TagSource::Explicit {
                    get_or_send: true,
                    ..
                }
            )
        })
    }

    pub fn symbolic_tags(&self) -> Vec<TagConfig> {
        self.filter_tags(|tag| matches!(tag.source, TagSource::Symbolic { .. }))
    }

    fn filter_tags(&self, predicate: impl Fn(&TagConfig) -> bool) -> Vec<TagConfig> {
        self.tags
            .read()
            .values()
            .filter(|tag| predicate(tag))
            .cloned()
            .collect()
    }

    /// Fold one raw sample into the cache.
    ///
    /// Returns the emitted snapshot (change flag set against the previous
    /// *raw* value) and whether the sample goes to the DAQ sink. The
    /// stored record keeps its change flag cleared; the flag only lives in
    /// the emitted copy.
    pub fn apply_raw(
        &self,
        id: &str,
        raw: PlcValue,
        timestamp: i64,
    ) -> Option<(ValueRecord, bool)> {
        let tag = self.tag(id)?;
        let changed = match self.values.get(id) {
            Some(existing) => existing.raw != raw,
            None => true,
        };
        let composed = codec::compose(&raw, &tag);

        let last_saved = self.last_daq.get(id).map(|v| *v).unwrap_or(0);
        let save = tag.daq.warrants_save(changed, last_saved, timestamp);
        if save {
            self.last_daq.insert(id.to_string(), timestamp);
        }

        let snapshot = ValueRecord {
            id: id.to_string(),
            value: composed,
            raw,
            tag_type: tag.tag_type.clone(),
            daq: tag.daq,
            changed,
            timestamp,
        };
        self.values.insert(
            id.to_string(),
            ValueRecord {
                changed: false,
                ..snapshot.clone()
            },
        );
        Some((snapshot, save))
    }

    /// Null out every cached value. Returns true when anything was cached
    /// (the caller then emits the cleared list).
    pub fn clear_values(&self) -> bool {
        let mut any = false;
        for mut entry in self.values.iter_mut() {
            entry.value = PlcValue::Null;
            entry.raw = PlcValue::Null;
            entry.changed = false;
            any = true;
        }
        any
    }

    pub fn get(&self, id: &str) -> Option<ValueRecord> {
        self.values.get(id).map(|v| v.clone())
    }

    /// Every cached record, for value events and the query surface.
    pub fn snapshot(&self) -> Vec<ValueRecord> {
        self.values.iter().map(|v| v.clone()).collect()
    }

    pub fn daq_settings(&self, id: &str) -> Option<DaqPolicy> {
        self.tags.read().get(id).map(|t| t.daq)
    }

    /// Merge partial DAQ settings into the tag; absent fields keep their
    /// current value.
    pub fn set_daq_settings(&self, id: &str, update: &DaqPolicyUpdate) -> bool {
        match self.tags.write().get_mut(id) {
            Some(tag) => {
                tag.daq.merge(update);
                true
            },
            None => false,
        }
    }

    pub fn tag_property(&self, id: &str) -> Option<TagProperty> {
        self.tags.read().get(id).map(|tag| TagProperty {
            id: tag.id.clone(),
            name: tag.name.clone(),
            tag_type: tag.tag_type.clone(),
            format: tag.format.clone(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use enip_link::types::data_type;

    fn symbolic_tag(id: &str, divisor: f64, daq: DaqPolicy) -> TagConfig {
        TagConfig {
            id: id.to_string(),
            name: format!("Tag {id}"),
            address: format!("Sym_{id}"),
            tag_type: Some("number".into()),
            format: None,
            divisor,
            daq,
            source: TagSource::Symbolic {
                program: None,
                data_type: data_type::DINT,
            },
        }
    }

    fn registry_with(tags: Vec<TagConfig>) -> TagRegistry {
        let registry = TagRegistry::new();
        registry.load(tags.into_iter().map(|t| (t.id.clone(), t)).collect());
        registry
    }

    #[test]
    fn test_first_sample_counts_as_changed() {
        let registry = registry_with(vec![symbolic_tag("t1", 1.0, DaqPolicy::default())]);
        let (record, save) = registry.apply_raw("t1", PlcValue::Integer(5), 100).unwrap();
        assert!(record.changed);
        assert!(save);
        // The stored record keeps its flag cleared
        assert!(!registry.get("t1").unwrap().changed);
    }

    #[test]
    fn test_equal_raw_is_emitted_but_not_saved() {
        let registry = registry_with(vec![symbolic_tag("t1", 1.0, DaqPolicy::default())]);
        registry.apply_raw("t1", PlcValue::Integer(5), 100).unwrap();
        let (record, save) = registry.apply_raw("t1", PlcValue::Integer(5), 200).unwrap();
        assert!(!record.changed);
        assert!(!save, "on-change policy must not persist an equal raw value");
        // Still present in the emitted snapshot
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_change_detection_uses_raw_not_composed() {
        // divisor scaling must not make every sample look changed
        let registry = registry_with(vec![symbolic_tag("t1", 10.0, DaqPolicy::default())]);
        registry.apply_raw("t1", PlcValue::Integer(50), 100).unwrap();
        let (record, save) = registry.apply_raw("t1", PlcValue::Integer(50), 200).unwrap();
        assert!(!record.changed);
        assert!(!save);
        assert_eq!(record.value, PlcValue::Float(5.0));
    }

    #[test]
    fn test_interval_policy_saves_without_change() {
        let daq = DaqPolicy {
            enabled: true,
            changed: false,
            interval: 1000,
        };
        let registry = registry_with(vec![symbolic_tag("t1", 1.0, daq)]);
        let (_, save) = registry.apply_raw("t1", PlcValue::Integer(1), 1000).unwrap();
        assert!(save); // first sample: interval elapsed since epoch
        let (_, save) = registry.apply_raw("t1", PlcValue::Integer(2), 1500).unwrap();
        assert!(!save, "inside the interval, even though the value changed");
        let (_, save) = registry.apply_raw("t1", PlcValue::Integer(3), 2100).unwrap();
        assert!(save);
    }

    #[test]
    fn test_clear_values_nulls_everything() {
        let registry = registry_with(vec![symbolic_tag("t1", 1.0, DaqPolicy::default())]);
        registry.apply_raw("t1", PlcValue::Integer(5), 100).unwrap();
        assert!(registry.clear_values());
        let record = registry.get("t1").unwrap();
        assert!(record.value.is_null());
        assert!(record.raw.is_null());

        // Nothing cached: nothing to emit
        let empty = registry_with(vec![symbolic_tag("t2", 1.0, DaqPolicy::default())]);
        assert!(!empty.clear_values());
    }

    #[test]
    fn test_unknown_tag_is_ignored() {
        let registry = registry_with(vec![]);
        assert!(registry.apply_raw("ghost", PlcValue::Integer(1), 0).is_none());
    }

    #[test]
    fn test_daq_settings_merge() {
        let registry = registry_with(vec![symbolic_tag("t1", 1.0, DaqPolicy::default())]);
        assert!(registry.set_daq_settings(
            "t1",
            &DaqPolicyUpdate {
                interval: Some(30_000),
                ..Default::default()
            }
        ));
        let daq = registry.daq_settings("t1").unwrap();
        assert_eq!(daq.interval, 30_000);
        assert!(daq.changed);
        assert!(!registry.set_daq_settings("ghost", &DaqPolicyUpdate::default()));
    }

    #[test]
    fn test_source_kind_filters() {
        let mut io_tag = symbolic_tag("io1", 1.0, DaqPolicy::default());
        io_tag.source = TagSource::AssemblyIo {
            module_id: "m1".into(),
            data: crate::config::IoDataKind::Bit,
            byte_offset: 0,
            bit_offset: Some(2),
            output: false,
        };
        let mut out_tag = symbolic_tag("io2", 1.0, DaqPolicy::default());
        out_tag.source = TagSource::AssemblyIo {
            module_id: "m1".into(),
            data: crate::config::IoDataKind::Word16,
            byte_offset: 2,
            bit_offset: None,
            output: true,
        };
        let mut send_only = symbolic_tag("e1", 1.0, DaqPolicy::default());
        send_only.source = TagSource::Explicit {
            class: Some(4),
            instance: Some(100),
            attribute: Some(3),
            get_or_send: false,
            send_buffer: None,
        };
        let registry = registry_with(vec![
            symbolic_tag("s1", 1.0, DaqPolicy::default()),
            io_tag,
            out_tag,
            send_only,
        ]);

        assert_eq!(registry.symbolic_tags().len(), 1);
        assert_eq!(registry.io_input_tags().len(), 1);
        assert_eq!(registry.io_tags().len(), 2);
        assert!(registry.explicit_read_tags().is_empty());
    }
}
