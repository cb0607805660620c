//! Prometheus metric registry for the whole service.
//!
//! One [`Metrics`] instance is created at startup and shared by reference
//! across workers, frame sources, and the HTTP surface. The registry is
//! thread-safe by library contract; per-camera handles are cheap clones of
//! labelled children.

use anyhow::Result;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::frame_source::ConnectionState;

/// Latency buckets in milliseconds for `infer_latency_ms`.
const LATENCY_BUCKETS_MS: &[f64] = &[
    10.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0,
];

pub struct Metrics {
    registry: Registry,
    frames_total: IntCounterVec,
    events_total: IntCounterVec,
    publisher_failures_total: IntCounterVec,
    infer_latency_ms: HistogramVec,
    worker_alive: IntGaugeVec,
    hls_reconnects_total: IntCounterVec,
    hls_url_refreshes_total: IntCounterVec,
    hls_read_errors_total: IntCounterVec,
    hls_frames_total: IntCounterVec,
    hls_connection_state: IntGaugeVec,
    hls_last_frame_timestamp: GaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let frames_total = IntCounterVec::new(
            Opts::new("infer_frames_total", "Frames processed per camera"),
            &["camera_id"],
        )?;
        let events_total = IntCounterVec::new(
            Opts::new("infer_events_total", "Events emitted per camera and type"),
            &["camera_id", "type"],
        )?;
        let publisher_failures_total = IntCounterVec::new(
            Opts::new(
                "publisher_failures_total",
                "Records dropped or failed per sink",
            ),
            &["sink"],
        )?;
        let infer_latency_ms = HistogramVec::new(
            HistogramOpts::new("infer_latency_ms", "Per-frame inference latency in ms")
                .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["camera_id"],
        )?;
        let worker_alive = IntGaugeVec::new(
            Opts::new("worker_alive", "1 while the camera worker loop runs"),
            &["camera_id"],
        )?;
        let hls_reconnects_total = IntCounterVec::new(
            Opts::new("kvs_hls_reconnects_total", "HLS reconnections per camera"),
            &["camera_id"],
        )?;
        let hls_url_refreshes_total = IntCounterVec::new(
            Opts::new(
                "kvs_hls_url_refreshes_total",
                "HLS session URL acquisitions per camera",
            ),
            &["camera_id"],
        )?;
        let hls_read_errors_total = IntCounterVec::new(
            Opts::new("kvs_hls_read_errors_total", "Frame read errors per camera"),
            &["camera_id"],
        )?;
        let hls_frames_total = IntCounterVec::new(
            Opts::new("kvs_hls_frames_total", "Frames decoded from HLS per camera"),
            &["camera_id"],
        )?;
        let hls_connection_state = IntGaugeVec::new(
            Opts::new(
                "kvs_hls_connection_state",
                "0=disconnected 1=connecting 2=connected 3=reconnecting 4=error",
            ),
            &["camera_id"],
        )?;
        let hls_last_frame_timestamp = GaugeVec::new(
            Opts::new(
                "kvs_hls_last_frame_timestamp",
                "Wall-clock ms of the last decoded frame",
            ),
            &["camera_id"],
        )?;

        registry.register(Box::new(frames_total.clone()))?;
        registry.register(Box::new(events_total.clone()))?;
        registry.register(Box::new(publisher_failures_total.clone()))?;
        registry.register(Box::new(infer_latency_ms.clone()))?;
        registry.register(Box::new(worker_alive.clone()))?;
        registry.register(Box::new(hls_reconnects_total.clone()))?;
        registry.register(Box::new(hls_url_refreshes_total.clone()))?;
        registry.register(Box::new(hls_read_errors_total.clone()))?;
        registry.register(Box::new(hls_frames_total.clone()))?;
        registry.register(Box::new(hls_connection_state.clone()))?;
        registry.register(Box::new(hls_last_frame_timestamp.clone()))?;

        Ok(Self {
            registry,
            frames_total,
            events_total,
            publisher_failures_total,
            infer_latency_ms,
            worker_alive,
            hls_reconnects_total,
            hls_url_refreshes_total,
            hls_read_errors_total,
            hls_frames_total,
            hls_connection_state,
            hls_last_frame_timestamp,
        })
    }

    pub fn record_frame(&self, camera_id: &str) {
        self.frames_total.with_label_values(&[camera_id]).inc();
    }

    pub fn record_event(&self, camera_id: &str, event_type: &str) {
        self.events_total
            .with_label_values(&[camera_id, event_type])
            .inc();
    }

    pub fn record_publisher_failures(&self, sink: &str, count: u64) {
        self.publisher_failures_total
            .with_label_values(&[sink])
            .inc_by(count);
    }

    pub fn latency_histogram(&self, camera_id: &str) -> Histogram {
        self.infer_latency_ms.with_label_values(&[camera_id])
    }

    pub fn worker_alive_gauge(&self, camera_id: &str) -> IntGauge {
        self.worker_alive.with_label_values(&[camera_id])
    }

    /// Per-camera handles for the frame source to update inline.
    pub fn stream_metrics(&self, camera_id: &str) -> CameraStreamMetrics {
        CameraStreamMetrics {
            reconnects: self.hls_reconnects_total.with_label_values(&[camera_id]),
            url_refreshes: self.hls_url_refreshes_total.with_label_values(&[camera_id]),
            read_errors: self.hls_read_errors_total.with_label_values(&[camera_id]),
            frames: self.hls_frames_total.with_label_values(&[camera_id]),
            connection_state: self.hls_connection_state.with_label_values(&[camera_id]),
            last_frame_timestamp: self
                .hls_last_frame_timestamp
                .with_label_values(&[camera_id]),
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Labelled children owned by one frame source.
#[derive(Clone)]
pub struct CameraStreamMetrics {
    pub reconnects: IntCounter,
    pub url_refreshes: IntCounter,
    pub read_errors: IntCounter,
    pub frames: IntCounter,
    pub connection_state: IntGauge,
    pub last_frame_timestamp: Gauge,
}

impl CameraStreamMetrics {
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.set(state.as_gauge_value());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_registered_families() {
        let metrics = Metrics::new().unwrap();
        metrics.record_frame("cam-a");
        metrics.record_event("cam-a", "weapon");
        metrics.record_publisher_failures("kds", 2);
        metrics.latency_histogram("cam-a").observe(42.0);
        metrics.worker_alive_gauge("cam-a").set(1);

        let text = metrics.render().unwrap();
        assert!(text.contains("infer_frames_total{camera_id=\"cam-a\"} 1"));
        assert!(text.contains("infer_events_total{camera_id=\"cam-a\",type=\"weapon\"} 1"));
        assert!(text.contains("publisher_failures_total{sink=\"kds\"} 2"));
        assert!(text.contains("infer_latency_ms_bucket"));
        assert!(text.contains("worker_alive{camera_id=\"cam-a\"} 1"));
    }

    #[test]
    fn stream_metrics_update_gauges() {
        let metrics = Metrics::new().unwrap();
        let stream = metrics.stream_metrics("cam-b");
        stream.set_connection_state(ConnectionState::Connected);
        stream.frames.inc();
        stream.last_frame_timestamp.set(1234.0);

        let text = metrics.render().unwrap();
        assert!(text.contains("kvs_hls_connection_state{camera_id=\"cam-b\"} 2"));
        assert!(text.contains("kvs_hls_frames_total{camera_id=\"cam-b\"} 1"));
    }
}
