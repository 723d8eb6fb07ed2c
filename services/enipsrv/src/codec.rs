//! Value composition
//!
//! Converts between device-native raw values and engineering units using
//! the per-tag linear divisor. Text-typed tags pass through unscaled.

use enip_link::types::data_type;
use enip_link::PlcValue;

use crate::config::{TagConfig, TagSource};

/// True iff the tag's declared native type is one of the string-family
/// CIP codes. Non-symbolic tags are never string tags.
pub fn is_string_tag(tag: &TagConfig) -> bool {
    match tag.source {
        TagSource::Symbolic { data_type: dt, .. } => data_type::is_string_family(dt),
        _ => false,
    }
}

/// Raw device value to engineering value.
pub fn compose(raw: &PlcValue, tag: &TagConfig) -> PlcValue {
    if is_string_tag(tag) || !scaling_active(tag) {
        return raw.clone();
    }
    match raw.as_f64() {
        Some(v) => PlcValue::Float(v / tag.divisor),
        // Bytes, null and unparsable strings are not scalable
        None => raw.clone(),
    }
}

/// Engineering value back to the raw value written to the device.
pub fn decompose(value: &PlcValue, tag: &TagConfig) -> PlcValue {
    if is_string_tag(tag) || !scaling_active(tag) {
        return value.clone();
    }
    match value.as_f64() {
        Some(v) => PlcValue::Float(v * tag.divisor),
        None => value.clone(),
    }
}

fn scaling_active(tag: &TagConfig) -> bool {
    tag.divisor != 0.0 && tag.divisor != 1.0
}
