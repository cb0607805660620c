//! Event model: what detectors emit and publishers externalise.
//!
//! A [`Detection`] never leaves its detector; once it survives filtering it
//! becomes an [`Event`], and the publish layer wraps that in an
//! [`EventEnvelope`] carrying a deterministic SHA1 `event_id` that
//! downstream consumers use for idempotence.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::geometry::BBox;

/// Raw model output: label, confidence, box. Internal to detectors.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    pub conf: f32,
    pub bbox: BBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, conf: f32, bbox: BBox) -> Self {
        Self {
            label: label.into(),
            conf,
            bbox,
        }
    }
}

/// Coarse event category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Weapon,
    Fire,
    Smoke,
    Alpr,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Weapon => "weapon",
            EventType::Fire => "fire",
            EventType::Smoke => "smoke",
            EventType::Alpr => "alpr",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detector-specific extra field: a scalar, serialised as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for ExtraValue {
    fn from(v: bool) -> Self {
        ExtraValue::Bool(v)
    }
}

impl From<i64> for ExtraValue {
    fn from(v: i64) -> Self {
        ExtraValue::Int(v)
    }
}

impl From<u64> for ExtraValue {
    fn from(v: u64) -> Self {
        ExtraValue::Int(v as i64)
    }
}

impl From<f64> for ExtraValue {
    fn from(v: f64) -> Self {
        ExtraValue::Float(v)
    }
}

impl From<f32> for ExtraValue {
    fn from(v: f32) -> Self {
        ExtraValue::Float(v as f64)
    }
}

impl From<&str> for ExtraValue {
    fn from(v: &str) -> Self {
        ExtraValue::Str(v.to_string())
    }
}

impl From<String> for ExtraValue {
    fn from(v: String) -> Self {
        ExtraValue::Str(v)
    }
}

impl ExtraValue {
    /// Render for contexts that only take strings (object-store metadata).
    pub fn to_display_string(&self) -> String {
        match self {
            ExtraValue::Bool(v) => v.to_string(),
            ExtraValue::Int(v) => v.to_string(),
            ExtraValue::Float(v) => v.to_string(),
            ExtraValue::Str(v) => v.clone(),
        }
    }
}

/// Open map of detector-specific fields.
pub type Extras = BTreeMap<String, ExtraValue>;

/// The externalised detection artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub camera_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub label: String,
    pub conf: f32,
    pub bbox: BBox,
    pub ts_ms: i64,
    #[serde(default)]
    pub extras: Extras,
}

impl Event {
    /// Invariants: confidence in [0, 1], well-formed box, positive timestamp.
    pub fn is_well_formed(&self) -> bool {
        (0.0..=1.0).contains(&self.conf) && self.bbox.is_well_formed() && self.ts_ms > 0
    }
}

/// Deterministic event identifier.
///
/// The timestamp is bucketed (default width 1000 ms) so that sub-second
/// duplicates of the same camera/type/label collapse onto one id.
pub fn event_id(
    camera_id: &str,
    event_type: EventType,
    label: &str,
    ts_ms: i64,
    bucket_ms: i64,
) -> String {
    let bucket = ts_ms / bucket_ms.max(1);
    let input = format!("{}:{}:{}:{}", camera_id, event_type.as_str(), label, bucket);
    hex::encode(Sha1::digest(input.as_bytes()))
}

/// Publish-layer wrapper around an [`Event`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub camera_id: String,
    pub producer: String,
    pub payload: Event,
}

impl EventEnvelope {
    pub fn wrap(event: Event, producer: &str, bucket_ms: i64) -> Self {
        let event_id = event_id(
            &event.camera_id,
            event.event_type,
            &event.label,
            event.ts_ms,
            bucket_ms,
        );
        Self {
            event_id,
            camera_id: event.camera_id.clone(),
            producer: producer.to_string(),
            payload: event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;

    fn event(ts_ms: i64) -> Event {
        Event {
            camera_id: "cam-a".to_string(),
            event_type: EventType::Weapon,
            label: "gun".to_string(),
            conf: 0.9,
            bbox: BBox::new(10.0, 10.0, 50.0, 50.0),
            ts_ms,
            extras: Extras::new(),
        }
    }

    #[test]
    fn event_ids_collapse_within_one_second_bucket() {
        let a = event_id("cam-a", EventType::Weapon, "gun", 1234, 1000);
        let b = event_id("cam-a", EventType::Weapon, "gun", 1876, 1000);
        let c = event_id("cam-a", EventType::Weapon, "gun", 2001, 1000);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn event_id_is_full_sha1_hex() {
        let id = event_id("cam-a", EventType::Alpr, "plate", 5000, 1000);
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn event_id_honours_bucket_width() {
        let narrow_a = event_id("cam-a", EventType::Weapon, "gun", 1234, 500);
        let narrow_b = event_id("cam-a", EventType::Weapon, "gun", 1876, 500);
        assert_ne!(narrow_a, narrow_b);
    }

    #[test]
    fn envelope_wraps_event_with_derived_id() {
        let envelope = EventEnvelope::wrap(event(1234), "kvs-infer/0.2", 1000);
        assert_eq!(envelope.camera_id, "cam-a");
        assert_eq!(envelope.producer, "kvs-infer/0.2");
        assert_eq!(
            envelope.event_id,
            event_id("cam-a", EventType::Weapon, "gun", 1234, 1000)
        );
    }

    #[test]
    fn envelope_serialises_with_typed_payload() {
        let mut ev = event(1234);
        ev.extras.insert("ocr_conf".to_string(), ExtraValue::Float(0.87));
        ev.extras
            .insert("text".to_string(), ExtraValue::Str("AB1234".to_string()));
        let envelope = EventEnvelope::wrap(ev, "kvs-infer/0.2", 1000);
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"weapon\""));
        assert!(json.contains("\"bbox\":[10.0,10.0,50.0,50.0]"));
        assert!(json.contains("\"ocr_conf\":0.87"));

        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn well_formedness_checks_conf_bbox_and_timestamp() {
        assert!(event(1000).is_well_formed());
        let mut bad = event(1000);
        bad.conf = 1.5;
        assert!(!bad.is_well_formed());
        let mut bad = event(0);
        bad.ts_ms = 0;
        assert!(!bad.is_well_formed());
        let mut bad = event(1000);
        bad.bbox = BBox::new(50.0, 50.0, 10.0, 10.0);
        assert!(!bad.is_well_formed());
    }
}
