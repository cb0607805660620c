//! ALPR detector: plate detection plus OCR.
//!
//! After temporal confirmation the plate region is cropped with an
//! expansion margin and handed to the OCR engine; the event only fires
//! for confidently read, non-empty text. A second dedup keyed on
//! (text, grid cell) guards against re-emitting the same plate while it
//! sits in the same part of the scene.

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::detect::infer::{build_backend, BackendParams, InferenceBackend};
use crate::detect::ocr::{build_ocr_engine, OcrEngine};
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
pub struct AlprConfig {
    pub plate_classes: Vec<String>,
    pub conf_threshold: f32,
    #[serde(alias = "roi_filter_mode")]
    pub roi_mode: RoiMode,
    pub roi_min_overlap: f32,
    /// Crop expansion as a ratio of the box extent.
    pub crop_expand: f32,
    pub ocr_engine: String,
    pub ocr_lang: String,
    pub ocr_conf_threshold: f32,
    pub temporal_window: usize,
    pub temporal_iou: f32,
    pub temporal_min_conf: usize,
    pub dedup_window: u64,
    pub dedup_grid_size: u32,
}

impl Default for AlprConfig {
    fn default() -> Self {
        Self {
            plate_classes: vec!["plate".to_string(), "license_plate".to_string()],
            conf_threshold: 0.6,
            roi_mode: RoiMode::Center,
            roi_min_overlap: 0.5,
            crop_expand: 0.1,
            ocr_engine: "stub".to_string(),
            ocr_lang: "en".to_string(),
            ocr_conf_threshold: 0.6,
            temporal_window: 5,
            temporal_iou: 0.3,
            temporal_min_conf: 3,
            dedup_window: 60,
            dedup_grid_size: 20,
        }
    }
}

impl AlprConfig {
    fn validate(&self) -> Result<()> {
        for threshold in [self.conf_threshold, self.ocr_conf_threshold] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(anyhow!("confidence threshold {} outside [0, 1]", threshold));
            }
        }
        if self.crop_expand < 0.0 {
            return Err(anyhow!("crop_expand must not be negative"));
        }
        if self.temporal_min_conf == 0 {
            return Err(anyhow!("temporal_min_conf must be at least 1"));
        }
        Ok(())
    }
}

pub struct AlprDetector {
    config: AlprConfig,
    backend: Box<dyn InferenceBackend>,
    ocr: Box<dyn OcrEngine>,
    temporal: TemporalBuffer,
    dedup: DedupRing,
    frame_count: u64,
}

pub(crate) fn factory(params: &DetectorParams) -> Result<Box<dyn Detector>> {
    let config: AlprConfig = params_to(params)?;
    let backend_params: BackendParams = params_to(params)?;
    let backend = build_backend(&backend_params, &config.plate_classes)?;
    let ocr = build_ocr_engine(&config.ocr_engine, &config.ocr_lang)?;
    Ok(Box::new(AlprDetector::with_parts(config, backend, ocr)?))
}

impl AlprDetector {
    pub fn with_parts(
        config: AlprConfig,
        backend: Box<dyn InferenceBackend>,
        ocr: Box<dyn OcrEngine>,
    ) -> Result<Self> {
        config.validate()?;
        let temporal = TemporalBuffer::new(config.temporal_window);
        let dedup = DedupRing::new(config.dedup_window);
        Ok(Self {
            config,
            backend,
            ocr,
            temporal,
            dedup,
            frame_count: 0,
        })
    }
}

impl Detector for AlprDetector {
    fn kind(&self) -> &'static str {
        "alpr"
    }

    fn process(&mut self, frame: &Frame, ts_ms: i64, ctx: &DetectorContext) -> Result<Vec<Event>> {
        self.frame_count += 1;

        let detections = self.backend.infer(frame, self.config.conf_threshold)?;
        let detections = filter_by_whitelist(detections, &self.config.plate_classes);
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

            let crop = match frame.crop_expanded(&detection.bbox, self.config.crop_expand) {
                Ok(crop) => crop,
                Err(err) => {
                    log::error!("[{}] failed to crop plate: {}", ctx.camera_id, err);
                    continue;
                }
            };

            let (text, ocr_conf) = match self.ocr.recognize(&crop) {
                Ok(result) => result,
                Err(err) => {
                    log::error!("[{}] ocr error: {}", ctx.camera_id, err);
                    continue;
                }
            };
            if ocr_conf < self.config.ocr_conf_threshold {
                log::debug!(
                    "[{}] low ocr confidence: '{}' ({:.2} < {:.2})",
                    ctx.camera_id,
                    text,
                    ocr_conf,
                    self.config.ocr_conf_threshold
                );
                continue;
            }
            let text = text.trim().to_string();
            if text.is_empty() {
                continue;
            }

            // Dedup on what was read, not on the detector label.
            let hash = detection_hash(&text, &detection.bbox, self.config.dedup_grid_size);
            if self.dedup.is_duplicate(self.frame_count, &hash) {
                log::debug!(
                    "[{}] duplicate plate filtered: {} @ {:?}",
                    ctx.camera_id,
                    text,
                    detection.bbox
                );
                continue;
            }

            let mut extras = Extras::new();
            extras.insert("text".to_string(), text.clone().into());
            extras.insert("ocr_conf".to_string(), ocr_conf.into());
            extras.insert("ocr_engine".to_string(), self.ocr.name().into());
            extras.insert("frame_index".to_string(), self.frame_count.into());
            extras.insert("det_hash".to_string(), hash.into());

            log::info!(
                "[{}] plate detected: {} ({:.2}, ocr {:.2}) frame={}",
                ctx.camera_id,
                text,
                detection.conf,
                ocr_conf,
                self.frame_count
            );
            events.push(Event {
                camera_id: ctx.camera_id.to_string(),
                event_type: EventType::Alpr,
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
