//! Weapon detector.

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::detect::infer::{build_backend, BackendParams, InferenceBackend};
use crate::detect::{
    filter_by_min_area, filter_by_roi, filter_by_whitelist, params_to, Detector, DetectorContext,
    DetectorParams,
};
use crate::event::{Event, EventType, Extras};
use crate::frame::Frame;
use crate::geometry::RoiMode;
use crate::temporal::{detection_hash, DedupRing, TemporalBuffer};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeaponConfig {
    /// Weapon class whitelist (empty = report every model class).
    pub classes: Vec<String>,
    pub conf_threshold: f32,
    #[serde(alias = "roi_filter_mode")]
    pub roi_mode: RoiMode,
    pub roi_min_overlap: f32,
    pub temporal_window: usize,
    pub temporal_iou: f32,
    pub temporal_min_conf: usize,
    pub dedup_window: u64,
    pub dedup_grid_size: u32,
}

impl Default for WeaponConfig {
    fn default() -> Self {
        Self {
            classes: Vec::new(),
            conf_threshold: 0.6,
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

impl WeaponConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.conf_threshold) {
            return Err(anyhow!(
                "conf_threshold {} outside [0, 1]",
                self.conf_threshold
            ));
        }
        if self.temporal_min_conf == 0 {
            return Err(anyhow!("temporal_min_conf must be at least 1"));
        }
        if self.temporal_window < self.temporal_min_conf {
            return Err(anyhow!(
                "temporal_window {} smaller than temporal_min_conf {}",
                self.temporal_window,
                self.temporal_min_conf
            ));
        }
        Ok(())
    }
}

pub struct WeaponDetector {
    config: WeaponConfig,
    backend: Box<dyn InferenceBackend>,
    temporal: TemporalBuffer,
    dedup: DedupRing,
    frame_count: u64,
}

pub(crate) fn factory(params: &DetectorParams) -> Result<Box<dyn Detector>> {
    let config: WeaponConfig = params_to(params)?;
    let backend_params: BackendParams = params_to(params)?;
    let backend = build_backend(&backend_params, &config.classes)?;
    Ok(Box::new(WeaponDetector::with_backend(config, backend)?))
}

impl WeaponDetector {
    pub fn with_backend(config: WeaponConfig, backend: Box<dyn InferenceBackend>) -> Result<Self> {
        config.validate()?;
        if config.classes.is_empty() {
            log::warn!("weapon detector has no class whitelist, reporting all classes");
        }
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

impl Detector for WeaponDetector {
    fn kind(&self) -> &'static str {
        "weapon"
    }

    fn process(&mut self, frame: &Frame, ts_ms: i64, ctx: &DetectorContext) -> Result<Vec<Event>> {
        self.frame_count += 1;

        let detections = self.backend.infer(frame, self.config.conf_threshold)?;
        let detections = filter_by_whitelist(detections, &self.config.classes);
        let detections = filter_by_roi(
            detections,
            ctx,
            self.config.roi_mode,
            self.config.roi_min_overlap,
        );
        let detections = filter_by_min_area(detections, ctx.min_box_area);

        let mut events = Vec::new();
        for detection in detections {
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
                log::debug!(
                    "[{}] duplicate weapon detection filtered: {} @ {:?}",
                    ctx.camera_id,
                    detection.label,
                    detection.bbox
                );
                continue;
            }

            let mut extras = Extras::new();
            extras.insert("frame_index".to_string(), self.frame_count.into());
            extras.insert("det_hash".to_string(), hash.into());
            extras.insert("threshold".to_string(), self.config.conf_threshold.into());

            log::info!(
                "[{}] weapon detected: {} ({:.2}) frame={}",
                ctx.camera_id,
                detection.label,
                detection.conf,
                self.frame_count
            );
            events.push(Event {
                camera_id: ctx.camera_id.to_string(),
                event_type: EventType::Weapon,
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
