//! Object-store snapshot publisher.
//!
//! One JPEG per snapshot under `{prefix}/{camera_id}/{ts_ms}.jpg`.
//! Annotation draws on a copy via `imageproc` (hollow rectangles plus a
//! `label conf` text tag rendered with a TrueType font). Encode and
//! upload failures are counted and reported as `None`; the worker never
//! stops over a lost snapshot.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageEncoder, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};

use crate::event::Event;
use crate::frame::{Bgr, Frame};
use crate::geometry::BBox;
use crate::metrics::Metrics;
use crate::publish::client::ObjectStore;

const ANNOTATION_COLOR: Bgr = [0, 255, 0];
const ANNOTATION_THICKNESS: i32 = 2;
const LABEL_FONT_SIZE: f32 = 16.0;

/// Common TrueType locations tried when no font path is configured.
const LABEL_FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
];

#[derive(Clone, Debug)]
pub struct S3Config {
    pub bucket: String,
    pub prefix: String,
    pub region: String,
    /// JPEG quality, clamped to 0..=100.
    pub jpeg_quality: u8,
    /// TrueType font for annotation labels; system locations are searched
    /// when unset.
    pub label_font_path: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: "snapshots".to_string(),
            region: "us-east-1".to_string(),
            jpeg_quality: 90,
            label_font_path: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetrics {
    pub saved: u64,
    pub failed: u64,
    pub bytes_uploaded: u64,
}

pub struct SnapshotPublisher {
    config: S3Config,
    store: Arc<dyn ObjectStore>,
    label_font: Option<Font<'static>>,
    metrics: Mutex<SnapshotMetrics>,
    prom: Option<Arc<Metrics>>,
}

impl SnapshotPublisher {
    pub fn new(mut config: S3Config, store: Arc<dyn ObjectStore>) -> Self {
        config.jpeg_quality = config.jpeg_quality.min(100);
        config.prefix = config.prefix.trim_end_matches('/').to_string();

        let label_font = load_label_font(config.label_font_path.as_deref());
        if label_font.is_none() {
            log::warn!("no label font found; snapshot annotations will omit text");
        }

        log::info!(
            "snapshot publisher ready: bucket={}, prefix={}, quality={}",
            config.bucket,
            config.prefix,
            config.jpeg_quality
        );
        Self {
            config,
            store,
            label_font,
            metrics: Mutex::new(SnapshotMetrics::default()),
            prom: None,
        }
    }

    pub fn with_prometheus(mut self, prom: Arc<Metrics>) -> Self {
        self.prom = Some(prom);
        self
    }

    /// Upload a frame as JPEG. Returns the object key, or `None` when
    /// encoding or the upload failed.
    pub fn save(
        &self,
        frame: &Frame,
        camera_id: &str,
        ts_ms: i64,
        extra_metadata: Option<&BTreeMap<String, String>>,
    ) -> Option<String> {
        let key = self.object_key(camera_id, ts_ms);
        self.upload(frame, &key, camera_id, ts_ms, extra_metadata)
    }

    /// Draw detection rectangles (and `label conf` tags, when asked) on a
    /// copy, then upload it with the annotation metadata attached.
    pub fn save_with_bbox(
        &self,
        frame: &Frame,
        camera_id: &str,
        ts_ms: i64,
        events: &[Event],
        draw_labels: bool,
    ) -> Option<String> {
        let annotated = self.annotated_copy(frame, events, draw_labels);

        let mut metadata = BTreeMap::new();
        metadata.insert("detection_count".to_string(), events.len().to_string());
        metadata.insert("has_bboxes".to_string(), "true".to_string());
        self.save(&annotated, camera_id, ts_ms, Some(&metadata))
    }

    /// Upload the expanded crop around one detection box.
    pub fn save_crop(
        &self,
        frame: &Frame,
        bbox: &BBox,
        expand_ratio: f32,
        camera_id: &str,
        ts_ms: i64,
    ) -> Option<String> {
        let crop = match frame.crop_expanded(bbox, expand_ratio) {
            Ok(crop) => crop,
            Err(err) => {
                log::warn!("[{}] crop failed, skipping upload: {}", camera_id, err);
                self.count_failure();
                return None;
            }
        };
        let key = format!("{}/{}/{}_crop.jpg", self.config.prefix, camera_id, ts_ms);
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "bbox".to_string(),
            format!("{},{},{},{}", bbox.x1, bbox.y1, bbox.x2, bbox.y2),
        );
        self.upload(&crop, &key, camera_id, ts_ms, Some(&metadata))
    }

    pub fn get_metrics(&self) -> SnapshotMetrics {
        self.metrics.lock().unwrap().clone()
    }

    /// Nothing is buffered; flush exists so the supervisor can drain every
    /// publisher uniformly at shutdown.
    pub fn flush(&self) -> bool {
        true
    }

    /// Copy of `frame` with one hollow rectangle per event and, when
    /// requested and a font is available, a `label conf` tag above it.
    /// Colours pass straight through: the canvas holds the frame's BGR
    /// bytes, so the annotation colour is given in BGR too.
    fn annotated_copy(&self, frame: &Frame, events: &[Event], draw_labels: bool) -> Frame {
        let Some(mut canvas) =
            RgbImage::from_raw(frame.width(), frame.height(), frame.data().to_vec())
        else {
            // Buffer length is validated on construction; keep the
            // unannotated copy rather than panic.
            return frame.clone();
        };

        for event in events {
            draw_detection_box(&mut canvas, &event.bbox);
            if draw_labels {
                if let Some(font) = &self.label_font {
                    let text = format!("{} {:.2}", event.label, event.conf);
                    let x = event.bbox.x1.max(0.0) as i32;
                    let y = (event.bbox.y1 as i32 - LABEL_FONT_SIZE as i32 - 2).max(0);
                    draw_text_mut(
                        &mut canvas,
                        Rgb(ANNOTATION_COLOR),
                        x,
                        y,
                        Scale::uniform(LABEL_FONT_SIZE),
                        font,
                        &text,
                    );
                }
            }
        }

        Frame::from_bgr(frame.width(), frame.height(), canvas.into_raw())
            .unwrap_or_else(|_| frame.clone())
    }

    fn object_key(&self, camera_id: &str, ts_ms: i64) -> String {
        format!("{}/{}/{}.jpg", self.config.prefix, camera_id, ts_ms)
    }

    fn upload(
        &self,
        frame: &Frame,
        key: &str,
        camera_id: &str,
        ts_ms: i64,
        extra_metadata: Option<&BTreeMap<String, String>>,
    ) -> Option<String> {
        let body = match encode_jpeg(frame, self.config.jpeg_quality) {
            Ok(body) => body,
            Err(err) => {
                log::error!("[{}] jpeg encode failed: {}", camera_id, err);
                self.count_failure();
                return None;
            }
        };
        let body_len = body.len() as u64;

        let mut metadata = BTreeMap::new();
        metadata.insert("camera_id".to_string(), camera_id.to_string());
        metadata.insert("timestamp_ms".to_string(), ts_ms.to_string());
        metadata.insert(
            "jpeg_quality".to_string(),
            self.config.jpeg_quality.to_string(),
        );
        metadata.insert("frame_shape".to_string(), frame.shape_string());
        if let Some(extra) = extra_metadata {
            for (k, v) in extra {
                metadata.insert(k.clone(), v.clone());
            }
        }

        match self
            .store
            .put_object(&self.config.bucket, key, body, "image/jpeg", &metadata)
        {
            Ok(()) => {
                let mut metrics = self.metrics.lock().unwrap();
                metrics.saved += 1;
                metrics.bytes_uploaded += body_len;
                log::debug!("snapshot saved: {} ({} bytes)", key, body_len);
                Some(key.to_string())
            }
            Err(err) => {
                log::error!("[{}] snapshot upload failed: {}", camera_id, err);
                self.count_failure();
                None
            }
        }
    }

    fn count_failure(&self) {
        self.metrics.lock().unwrap().failed += 1;
        if let Some(prom) = &self.prom {
            prom.record_publisher_failures("s3", 1);
        }
    }
}

/// Hollow rectangle with line thickness, clipped by the canvas.
fn draw_detection_box(canvas: &mut RgbImage, bbox: &BBox) {
    let x = bbox.x1.max(0.0) as i32;
    let y = bbox.y1.max(0.0) as i32;
    let width = bbox.width().max(1.0) as u32;
    let height = bbox.height().max(1.0) as u32;

    for inset in 0..ANNOTATION_THICKNESS {
        let w = width.saturating_sub(2 * inset as u32);
        let h = height.saturating_sub(2 * inset as u32);
        if w == 0 || h == 0 {
            break;
        }
        draw_hollow_rect_mut(
            canvas,
            Rect::at(x + inset, y + inset).of_size(w, h),
            Rgb(ANNOTATION_COLOR),
        );
    }
}

/// Load the label font: the configured path first, then common system
/// locations.
fn load_label_font(configured: Option<&str>) -> Option<Font<'static>> {
    let candidates = configured
        .into_iter()
        .chain(LABEL_FONT_PATHS.iter().copied());
    for path in candidates {
        let Ok(data) = std::fs::read(path) else {
            continue;
        };
        match Font::try_from_vec(data) {
            Some(font) => {
                log::debug!("label font loaded from {}", path);
                return Some(font);
            }
            None => log::warn!("font file '{}' could not be parsed, skipping", path),
        }
    }
    None
}

/// Encode a BGR frame as JPEG at the given quality.
fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let mut rgb = Vec::with_capacity(frame.data().len());
    for pixel in frame.data().chunks_exact(3) {
        rgb.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
    }

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .write_image(&rgb, frame.width(), frame.height(), ColorType::Rgb8)
        .map_err(|e| anyhow!("jpeg encoding failed: {}", e))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, Extras};
    use crate::publish::client::InMemoryObjectStore;

    fn publisher(store: Arc<InMemoryObjectStore>) -> SnapshotPublisher {
        SnapshotPublisher::new(
            S3Config {
                bucket: "snaps".to_string(),
                prefix: "snapshots/".to_string(),
                ..S3Config::default()
            },
            store,
        )
    }

    fn gun_event(bbox: BBox) -> Event {
        Event {
            camera_id: "cam-a".to_string(),
            event_type: EventType::Weapon,
            label: "gun".to_string(),
            conf: 0.9,
            bbox,
            ts_ms: 1000,
            extras: Extras::new(),
        }
    }

    #[test]
    fn save_uses_the_key_format_and_metadata() {
        let store = Arc::new(InMemoryObjectStore::new());
        let publisher = publisher(store.clone());
        let frame = Frame::filled(64, 48, [10, 20, 30]);

        let key = publisher.save(&frame, "cam-a", 1697123456789, None).unwrap();
        assert_eq!(key, "snapshots/cam-a/1697123456789.jpg");

        let objects = store.objects();
        assert_eq!(objects.len(), 1);
        let object = &objects[0];
        assert_eq!(object.content_type, "image/jpeg");
        assert_eq!(object.metadata.get("camera_id").unwrap(), "cam-a");
        assert_eq!(object.metadata.get("frame_shape").unwrap(), "48x64");
        assert_eq!(object.metadata.get("jpeg_quality").unwrap(), "90");
        // JPEG magic bytes.
        assert_eq!(&object.body[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn upload_failure_counts_and_returns_none() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.fail_next_put();
        let publisher = publisher(store);
        let frame = Frame::filled(8, 8, [0, 0, 0]);
        assert!(publisher.save(&frame, "cam-a", 1000, None).is_none());
        let metrics = publisher.get_metrics();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.saved, 0);
    }

    #[test]
    fn save_with_bbox_does_not_mutate_the_original_frame() {
        let store = Arc::new(InMemoryObjectStore::new());
        let publisher = publisher(store);
        let frame = Frame::filled(64, 64, [0, 0, 0]);
        let original = frame.clone();
        let event = gun_event(BBox::new(10.0, 10.0, 40.0, 40.0));
        publisher
            .save_with_bbox(&frame, "cam-a", 1000, std::slice::from_ref(&event), true)
            .unwrap();
        assert_eq!(frame, original);
    }

    #[test]
    fn save_with_bbox_attaches_annotation_metadata() {
        let store = Arc::new(InMemoryObjectStore::new());
        let publisher = publisher(store.clone());
        let frame = Frame::filled(64, 64, [0, 0, 0]);
        let events = vec![
            gun_event(BBox::new(5.0, 5.0, 25.0, 25.0)),
            gun_event(BBox::new(30.0, 30.0, 60.0, 60.0)),
        ];
        publisher
            .save_with_bbox(&frame, "cam-a", 1000, &events, false)
            .unwrap();

        let object = &store.objects()[0];
        assert_eq!(object.metadata.get("detection_count").unwrap(), "2");
        assert_eq!(object.metadata.get("has_bboxes").unwrap(), "true");
        // Base metadata survives alongside.
        assert_eq!(object.metadata.get("camera_id").unwrap(), "cam-a");
    }

    #[test]
    fn annotated_copy_marks_rectangle_edges_only() {
        let store = Arc::new(InMemoryObjectStore::new());
        let publisher = publisher(store);
        let frame = Frame::filled(64, 64, [0, 0, 0]);
        let event = gun_event(BBox::new(10.0, 10.0, 40.0, 40.0));

        let annotated =
            publisher.annotated_copy(&frame, std::slice::from_ref(&event), false);
        assert_eq!(annotated.pixel(10, 10), Some(ANNOTATION_COLOR));
        assert_eq!(annotated.pixel(25, 10), Some(ANNOTATION_COLOR));
        // Interior stays untouched.
        assert_eq!(annotated.pixel(25, 25), Some([0, 0, 0]));
        // Original frame untouched.
        assert_eq!(frame.pixel(10, 10), Some([0, 0, 0]));
    }

    #[test]
    fn save_crop_clamps_and_tags_bbox_metadata() {
        let store = Arc::new(InMemoryObjectStore::new());
        let publisher = publisher(store.clone());
        let frame = Frame::filled(100, 100, [5, 5, 5]);
        let bbox = BBox::new(80.0, 80.0, 99.0, 99.0);
        let key = publisher
            .save_crop(&frame, &bbox, 0.2, "cam-a", 2000)
            .unwrap();
        assert_eq!(key, "snapshots/cam-a/2000_crop.jpg");
        let object = &store.objects()[0];
        assert!(object.metadata.contains_key("bbox"));
    }

    #[test]
    fn quality_is_clamped_to_valid_range() {
        let store = Arc::new(InMemoryObjectStore::new());
        let publisher = SnapshotPublisher::new(
            S3Config {
                bucket: "b".to_string(),
                jpeg_quality: 200,
                ..S3Config::default()
            },
            store,
        );
        let frame = Frame::filled(8, 8, [0, 0, 0]);
        assert!(publisher.save(&frame, "cam-a", 1, None).is_some());
    }
}
