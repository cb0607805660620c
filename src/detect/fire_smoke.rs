//! Fire and smoke detector.
//!
//! One model pass covers both label families. The pass runs at the lower
//! of the two thresholds and the per-label threshold is applied
//! afterwards, so a smoke detection at 0.56 survives even when fire
//! requires 0.6.

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::detect::infer::{build_backend, BackendParams, InferenceBackend};
use crate::detect::{
    filter_by_min_area, filter_by_roi, params_to, Detector, DetectorContext, DetectorParams,
};
use crate::event::{Event, EventType, Extras};
use crate::frame::Frame;
use crate::geometry::RoiMode;
use crate::temporal::{detection_hash, DedupRing, TemporalBuffer};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FireSmokeConfig {
    pub fire_labels: Vec<String>,
    pub smoke_labels: Vec<String>,
    pub fire_conf_threshold: f32,
    pub smoke_conf_threshold: f32,
    #[serde(alias = "roi_filter_mode")]
    pub roi_mode: RoiMode,
    pub roi_min_overlap: f32,
    pub temporal_window: usize,
    pub temporal_iou: f32,
    pub temporal_min_conf: usize,
    pub dedup_window: u64,
    pub dedup_grid_size: u32,
}

impl Default for FireSmokeConfig {
    fn default() -> Self {
        Self {
            fire_labels: vec!["fire".to_string()],
            smoke_labels: vec!["smoke".to_string()],
            fire_conf_threshold: 0.6,
            smoke_conf_threshold: 0.55,
            roi_mode: RoiMode::Center,
            roi_min_overlap: 0.5,
            temporal_window: 5,
            temporal_iou: 0.3,
            temporal_min_conf: 3,
            dedup_window: 30,
            dedup_grid_size: 20,
        }
    }
}

impl FireSmokeConfig {
    fn validate(&self) -> Result<()> {
        if self.fire_labels.is_empty() && self.smoke_labels.is_empty() {
            return Err(anyhow!(
                "at least one of fire_labels or smoke_labels must be set"
            ));
        }
        for threshold in [self.fire_conf_threshold, self.smoke_conf_threshold] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(anyhow!("confidence threshold {} outside [0, 1]", threshold));
            }
        }
        if self.temporal_min_conf == 0 {
            return Err(anyhow!("temporal_min_conf must be at least 1"));
        }
        Ok(())
    }

    fn threshold_for(&self, label: &str) -> Option<f32> {
        if self.fire_labels.iter().any(|l| l == label) {
            Some(self.fire_conf_threshold)
        } else if self.smoke_labels.iter().any(|l| l == label) {
            Some(self.smoke_conf_threshold)
        } else {
            None
        }
    }

    fn event_type_for(&self, label: &str) -> Option<EventType> {
        if self.fire_labels.iter().any(|l| l == label) {
            Some(EventType::Fire)
        } else if self.smoke_labels.iter().any(|l| l == label) {
            Some(EventType::Smoke)
        } else {
            None
        }
    }
}

pub struct FireSmokeDetector {
    config: FireSmokeConfig,
    backend: Box<dyn InferenceBackend>,
    temporal: TemporalBuffer,
    dedup: DedupRing,
    frame_count: u64,
}

pub(crate) fn factory(params: &DetectorParams) -> Result<Box<dyn Detector>> {
    let config: FireSmokeConfig = params_to(params)?;
    let backend_params: BackendParams = params_to(params)?;
    let classes: Vec<String> = config
        .fire_labels
        .iter()
        .chain(config.smoke_labels.iter())
        .cloned()
        .collect();
    let backend = build_backend(&backend_params, &classes)?;
    Ok(Box::new(FireSmokeDetector::with_backend(config, backend)?))
}

impl FireSmokeDetector {
    pub fn with_backend(
        config: FireSmokeConfig,
        backend: Box<dyn InferenceBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let temporal = TemporalBuffer::new(config.temporal_window);
        let dedup = DedupRing::new(config.dedup_window);
        Ok(Self {
            config,
            backend,
            temporal,
            dedup,
            frame_count: 0,
        })
    }
}

impl Detector for FireSmokeDetector {
    fn kind(&self) -> &'static str {
        "fire_smoke"
    }

    fn process(&mut self, frame: &Frame, ts_ms: i64, ctx: &DetectorContext) -> Result<Vec<Event>> {
        self.frame_count += 1;

        // Model pass at the lower threshold; per-label filter below.
        let model_threshold = self
            .config
            .fire_conf_threshold
            .min(self.config.smoke_conf_threshold);
        let detections = self.backend.infer(frame, model_threshold)?;

        let detections: Vec<_> = detections
            .into_iter()
            .filter(|d| match self.config.threshold_for(&d.label) {
                Some(threshold) => d.conf >= threshold,
                None => false,
            })
            .collect();
        let detections = filter_by_roi(
            detections,
            ctx,
            self.config.roi_mode,
            self.config.roi_min_overlap,
        );
        let detections = filter_by_min_area(detections, ctx.min_box_area);

        let mut events = Vec::new();
        for detection in detections {
            let Some(event_type) = self.config.event_type_for(&detection.label) else {
                continue;
            };

            let confirmed = self.temporal.confirm(
                &detection.label,
                &detection.bbox,
                detection.conf,
                self.config.temporal_min_conf,
                self.config.temporal_iou,
                self.frame_count,
            );
            if !confirmed {
                continue;
            }

            let hash = detection_hash(
                &detection.label,
                &detection.bbox,
                self.config.dedup_grid_size,
            );
            if self.dedup.is_duplicate(self.frame_count, &hash) {
                continue;
            }

            let threshold = self.config.threshold_for(&detection.label).unwrap_or(0.0);
            let mut extras = Extras::new();
            extras.insert("frame_index".to_string(), self.frame_count.into());
            extras.insert("det_hash".to_string(), hash.into());
            extras.insert("threshold".to_string(), threshold.into());

            log::info!(
                "[{}] {} detected: {} ({:.2}) frame={}",
                ctx.camera_id,
                event_type,
                detection.label,
                detection.conf,
                self.frame_count
            );
            events.push(Event {
                camera_id: ctx.camera_id.to_string(),
                event_type,
                label: detection.label,
                conf: detection.conf,
                bbox: detection.bbox,
                ts_ms,
                extras,
            });
        }
        Ok(events)
    }
}
