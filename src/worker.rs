//! Camera worker: one long-lived loop per enabled camera.
//!
//! Owns its frame source and detector chain outright; publishers and the
//! metric registry are shared handles. Frames are processed strictly in
//! arrival order and events from frame N are enqueued before any event
//! from frame N+1. A fatal frame-source error terminates this worker
//! only; the rest of the process keeps running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::detect::{Detector, DetectorContext};
use crate::event::{Event, EventEnvelope};
use crate::frame::Frame;
use crate::frame_source::FrameSource;
use crate::geometry::Polygon;
use crate::metrics::Metrics;
use crate::publish::Publishers;
use crate::time::Clock;

pub struct CameraWorker {
    camera_id: String,
    source: Box<dyn FrameSource>,
    detectors: Vec<Box<dyn Detector>>,
    publishers: Arc<Publishers>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<AtomicBool>,
    fps_target: Option<f32>,
    roi: Vec<Polygon>,
    min_box_area: Option<f32>,
    save_snapshots: bool,
    /// Envelope identity settings, shared across sinks so event ids match.
    producer: String,
    event_id_bucket_ms: i64,
}

impl CameraWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera_id: String,
        source: Box<dyn FrameSource>,
        detectors: Vec<Box<dyn Detector>>,
        publishers: Arc<Publishers>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let producer = concat!("kvs-infer/", env!("CARGO_PKG_VERSION")).to_string();
        let event_id_bucket_ms = 1000;
        Self {
            camera_id,
            source,
            detectors,
            publishers,
            metrics,
            clock,
            shutdown,
            fps_target: None,
            roi: Vec::new(),
            min_box_area: None,
            save_snapshots: false,
            producer,
            event_id_bucket_ms,
        }
    }

    pub fn with_fps_target(mut self, fps_target: Option<f32>) -> Self {
        self.fps_target = fps_target;
        self
    }

    pub fn with_roi(mut self, roi: Vec<Polygon>) -> Self {
        self.roi = roi;
        self
    }

    pub fn with_min_box_area(mut self, min_box_area: Option<f32>) -> Self {
        self.min_box_area = min_box_area;
        self
    }

    pub fn with_save_snapshots(mut self, save_snapshots: bool) -> Self {
        self.save_snapshots = save_snapshots;
        self
    }

    pub fn with_envelope_identity(mut self, producer: String, event_id_bucket_ms: i64) -> Self {
        self.producer = producer;
        self.event_id_bucket_ms = event_id_bucket_ms;
        self
    }

    /// Run until shutdown or a fatal source error. Consumes the worker.
    pub fn run(mut self) {
        let alive = self.metrics.worker_alive_gauge(&self.camera_id);
        let latency = self.metrics.latency_histogram(&self.camera_id);
        alive.set(1);
        log::info!("[{}] camera worker started", self.camera_id);

        if let Err(err) = self.source.start() {
            // Not fatal yet: read_frame drives reconnection with backoff.
            log::warn!("[{}] initial connect failed: {}", self.camera_id, err);
        }

        let frame_interval = self
            .fps_target
            .map(|fps| Duration::from_secs_f64(1.0 / f64::from(fps)));
        let mut last_accepted: Option<Duration> = None;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                log::info!("[{}] shutdown requested, stopping", self.camera_id);
                break;
            }

            // Pre-read throttle: skip excess frames at the decoder
            // boundary, not after inference.
            if let (Some(interval), Some(last)) = (frame_interval, last_accepted) {
                let elapsed = self.clock.monotonic().saturating_sub(last);
                if elapsed < interval {
                    self.clock.sleep(interval - elapsed);
                }
            }

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let Some((frame, ts_ms)) = self.source.read_frame() else {
                if self.source.is_fatal() {
                    log::error!(
                        "[{}] frame source failed permanently, terminating worker",
                        self.camera_id
                    );
                    break;
                }
                // Transient failure or stop; the source already backed off.
                continue;
            };

            last_accepted = Some(self.clock.monotonic());
            self.metrics.record_frame(&self.camera_id);

            let inference_started = self.clock.monotonic();
            let ctx = DetectorContext {
                camera_id: &self.camera_id,
                frame_width: frame.width(),
                frame_height: frame.height(),
                roi_polygons: &self.roi,
                min_box_area: self.min_box_area,
            };

            let mut frame_events = Vec::new();
            for detector in &mut self.detectors {
                match detector.process(&frame, ts_ms, &ctx) {
                    Ok(events) => frame_events.extend(events),
                    Err(err) => {
                        // Skip this frame for this detector, keep looping.
                        log::error!(
                            "[{}] detector '{}' failed: {}",
                            self.camera_id,
                            detector.kind(),
                            err
                        );
                    }
                }
            }

            let elapsed = self.clock.monotonic().saturating_sub(inference_started);
            latency.observe(elapsed.as_secs_f64() * 1000.0);

            if !frame_events.is_empty() {
                self.publish_frame_events(&frame, ts_ms, &frame_events);
            }
        }

        self.source.release();
        alive.set(0);
        log::info!("[{}] camera worker stopped", self.camera_id);
    }

    fn publish_frame_events(&self, frame: &Frame, ts_ms: i64, events: &[Event]) {
        for event in events {
            self.metrics
                .record_event(&self.camera_id, event.event_type.as_str());
        }

        if let Some(stream) = &self.publishers.events {
            for event in events {
                stream.put_event(event, &self.camera_id);
            }
        }

        if let Some(metadata) = &self.publishers.metadata {
            let envelopes: Vec<EventEnvelope> = events
                .iter()
                .map(|event| {
                    EventEnvelope::wrap(event.clone(), &self.producer, self.event_id_bucket_ms)
                })
                .collect();
            metadata.put_events(&envelopes);
        }

        if self.save_snapshots {
            if let Some(snapshots) = &self.publishers.snapshots {
                snapshots.save_with_bbox(frame, &self.camera_id, ts_ms, events, true);
            }
        }
    }
}
