//! Detector abstraction.
//!
//! A detector is configured once at camera-worker startup (factory
//! construction doubles as validation; a bad config aborts the worker) and
//! then called synchronously per frame from a single caller. Detector
//! state (temporal buffers, dedup rings, frame counters) is strictly
//! per-worker; nothing here is shared or locked.
//!
//! Every detector runs the same filtering pipeline over its model output:
//! per-label confidence, label whitelist, ROI, minimum area, temporal
//! confirmation, spatial dedup, then event construction. ALPR adds a
//! crop/OCR stage and a second dedup keyed on the recognised text.

pub mod alpr;
pub mod fire_smoke;
pub mod infer;
pub mod ocr;
#[cfg(feature = "backend-tract")]
pub mod tract;
pub mod weapon;

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::event::{Detection, Event};
use crate::frame::Frame;
use crate::geometry::{bbox_accepted_by_roi, Polygon, RoiMode};

pub use alpr::AlprDetector;
pub use fire_smoke::FireSmokeDetector;
pub use infer::{InferenceBackend, ScriptedBackend};
pub use ocr::{OcrEngine, StubOcrEngine};
pub use weapon::WeaponDetector;

/// Per-camera context handed to every `process` call.
#[derive(Clone, Debug)]
pub struct DetectorContext<'a> {
    pub camera_id: &'a str,
    pub frame_width: u32,
    pub frame_height: u32,
    pub roi_polygons: &'a [Polygon],
    pub min_box_area: Option<f32>,
}

/// A configured detector instance.
pub trait Detector: Send {
    /// Registration key this detector was created under.
    fn kind(&self) -> &'static str;

    /// Run the full pipeline on one frame. May block for inference; must
    /// be cheap to call in a tight loop from a single caller.
    fn process(&mut self, frame: &Frame, ts_ms: i64, ctx: &DetectorContext) -> Result<Vec<Event>>;
}

/// Raw `params` mapping from the camera's detector list. Unrecognised keys
/// are ignored by the per-detector config structs.
pub type DetectorParams = serde_yaml::Mapping;

pub type DetectorFactory = fn(&DetectorParams) -> Result<Box<dyn Detector>>;

/// Startup-seeded map from configuration type tag to constructor.
pub struct DetectorRegistry {
    factories: HashMap<&'static str, DetectorFactory>,
}

impl DetectorRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in detector types.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("weapon", weapon::factory);
        registry.register("fire_smoke", fire_smoke::factory);
        registry.register("alpr", alpr::factory);
        registry
    }

    pub fn register(&mut self, kind: &'static str, factory: DetectorFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn create(&self, kind: &str, params: &DetectorParams) -> Result<Box<dyn Detector>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| anyhow!("unknown detector type '{}'", kind))?;
        factory(params)
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Parse a detector config struct out of the raw params mapping.
pub(crate) fn params_to<T: serde::de::DeserializeOwned>(params: &DetectorParams) -> Result<T> {
    serde_yaml::from_value(serde_yaml::Value::Mapping(params.clone()))
        .map_err(|e| anyhow!("invalid detector params: {}", e))
}

/// Keep detections whose label appears in `whitelist` (empty = keep all).
pub(crate) fn filter_by_whitelist(detections: Vec<Detection>, whitelist: &[String]) -> Vec<Detection> {
    if whitelist.is_empty() {
        return detections;
    }
    detections
        .into_iter()
        .filter(|d| whitelist.iter().any(|w| w == &d.label))
        .collect()
}

/// ROI acceptance over the context polygons.
pub(crate) fn filter_by_roi(
    detections: Vec<Detection>,
    ctx: &DetectorContext,
    mode: RoiMode,
    min_overlap: f32,
) -> Vec<Detection> {
    if ctx.roi_polygons.is_empty() {
        return detections;
    }
    detections
        .into_iter()
        .filter(|d| bbox_accepted_by_roi(&d.bbox, ctx.roi_polygons, mode, min_overlap))
        .collect()
}

/// Drop boxes below the configured minimum area, if any.
pub(crate) fn filter_by_min_area(detections: Vec<Detection>, min_area: Option<f32>) -> Vec<Detection> {
    match min_area {
        None => detections,
        Some(min_area) => detections
            .into_iter()
            .filter(|d| d.bbox.area() >= min_area)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;

    fn det(label: &str, bbox: BBox) -> Detection {
        Detection::new(label, 0.9, bbox)
    }

    #[test]
    fn builtin_registry_knows_all_three_types() {
        let registry = DetectorRegistry::builtin();
        assert_eq!(registry.kinds(), vec!["alpr", "fire_smoke", "weapon"]);
    }

    #[test]
    fn unknown_detector_type_is_an_error() {
        let registry = DetectorRegistry::builtin();
        let result = registry.create("face", &DetectorParams::new());
        let err = match result {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.to_string().contains("unknown detector type"));
    }

    #[test]
    fn whitelist_empty_keeps_everything() {
        let input = vec![det("gun", BBox::new(0.0, 0.0, 10.0, 10.0))];
        assert_eq!(filter_by_whitelist(input.clone(), &[]).len(), 1);
        assert_eq!(
            filter_by_whitelist(input.clone(), &["knife".to_string()]).len(),
            0
        );
        assert_eq!(
            filter_by_whitelist(input, &["gun".to_string()]).len(),
            1
        );
    }

    #[test]
    fn min_area_filter_drops_small_boxes() {
        let input = vec![
            det("gun", BBox::new(0.0, 0.0, 10.0, 10.0)),
            det("gun", BBox::new(0.0, 0.0, 100.0, 100.0)),
        ];
        let kept = filter_by_min_area(input, Some(500.0));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].bbox.area(), 10_000.0);
    }
}
