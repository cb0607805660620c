//! Service supervisor.
//!
//! Owns the publisher handles and the set of worker threads: loads
//! configuration, constructs each publisher once, spawns one camera
//! worker per enabled camera plus the HTTP surface, then blocks on the
//! shutdown flag. Shutdown: flag -> workers drain (bounded wait) ->
//! publishers flush -> HTTP stops -> exit 0.
//!
//! Cloud transports are trait seams; this build wires the in-process
//! implementations and says so at startup. Deployments with real
//! bindings construct the supervisor through `with_parts`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::config::{AppConfig, CameraSettings};
use crate::detect::{Detector, DetectorRegistry};
use crate::frame_source::{FrameSource, KvsHlsSource, StubSessionProvider, SyntheticDecoder};
use crate::http;
use crate::metrics::Metrics;
use crate::publish::{
    EventStreamPublisher, InMemoryObjectStore, InMemoryStreamClient, InMemoryTableClient,
    MetadataPublisher, Publishers, SnapshotPublisher,
};
use crate::time::{Clock, SystemClock};
use crate::worker::CameraWorker;

/// Bound on the post-shutdown worker drain.
pub const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Supervisor {
    config: AppConfig,
    metrics: Arc<Metrics>,
    publishers: Arc<Publishers>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<AtomicBool>,
    registry: DetectorRegistry,
}

impl Supervisor {
    /// Build with the in-process sink transports and synthetic stream
    /// decode (the compiled-in defaults).
    pub fn new(config: AppConfig) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let publishers = Arc::new(build_default_publishers(&config, &metrics, &clock));
        Ok(Self::with_parts(config, metrics, publishers, clock))
    }

    /// Build from pre-constructed collaborators.
    pub fn with_parts(
        config: AppConfig,
        metrics: Arc<Metrics>,
        publishers: Arc<Publishers>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            metrics,
            publishers,
            clock,
            shutdown: Arc::new(AtomicBool::new(false)),
            registry: DetectorRegistry::builtin(),
        }
    }

    /// Shared flag the signal handler (and the HTTP shutdown route) trip.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Run until shutdown. Returns after the drain completes.
    pub fn run(&self, http_addr: &str) -> Result<()> {
        let http_handle = http::spawn(http_addr, self.metrics.clone(), self.shutdown.clone())?;

        let (done_tx, done_rx) = mpsc::channel::<String>();
        let mut workers = Vec::new();
        for camera in self.config.enabled_cameras() {
            let worker = self.build_worker(camera)?;
            let camera_id = camera.camera_id.clone();
            let done_tx = done_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("camera-{}", camera_id))
                .spawn(move || {
                    worker.run();
                    let _ = done_tx.send(camera_id);
                })
                .context("failed to spawn camera worker thread")?;
            workers.push((camera.camera_id.clone(), handle));
        }
        drop(done_tx);
        log::info!(
            "supervisor running: {} camera worker(s), http on {}",
            workers.len(),
            http_handle.addr
        );

        while !self.shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
        log::info!("shutdown flag set, draining workers");

        // Workers observe the flag at their loop head and read boundary.
        let deadline = Instant::now() + SHUTDOWN_JOIN_TIMEOUT;
        let mut completed: HashSet<String> = HashSet::new();
        while completed.len() < workers.len() {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => break,
            };
            match done_rx.recv_timeout(remaining) {
                Ok(camera_id) => {
                    completed.insert(camera_id);
                }
                Err(_) => break,
            }
        }

        for (camera_id, handle) in workers {
            if completed.contains(&camera_id) {
                let _ = handle.join();
            } else {
                // Abandon; the thread is detached when the handle drops.
                log::warn!(
                    "[{}] worker did not stop within {:?}, abandoning",
                    camera_id,
                    SHUTDOWN_JOIN_TIMEOUT
                );
            }
        }

        self.publishers.flush_all();
        http_handle.stop()?;
        log::info!("supervisor stopped");
        Ok(())
    }

    fn build_worker(&self, camera: &CameraSettings) -> Result<CameraWorker> {
        let mut detectors: Vec<Box<dyn Detector>> = Vec::new();
        for spec in &camera.detectors {
            let detector = self
                .registry
                .create(&spec.kind, &spec.params)
                .with_context(|| {
                    format!(
                        "camera '{}': cannot configure detector '{}'",
                        camera.camera_id, spec.kind
                    )
                })?;
            detectors.push(detector);
        }

        log::warn!(
            "[{}] cloud video transport not compiled in; using synthetic decode for stream '{}'",
            camera.camera_id,
            camera.source.stream_name
        );
        let source = KvsHlsSource::new(
            camera.source.clone(),
            Box::new(StubSessionProvider::new()),
            Box::new(SyntheticDecoder::default()),
            self.clock.clone(),
        )?
        .with_stream_metrics(self.metrics.stream_metrics(&camera.camera_id));

        let save_snapshots = self
            .config
            .publishers
            .s3
            .as_ref()
            .map(|s3| s3.save_snapshots)
            .unwrap_or(false);
        let (producer, bucket_ms) = match &self.config.publishers.kds {
            Some(kds) => (kds.producer.clone(), kds.event_id_bucket_ms),
            None => (
                concat!("kvs-infer/", env!("CARGO_PKG_VERSION")).to_string(),
                1000,
            ),
        };

        Ok(CameraWorker::new(
            camera.camera_id.clone(),
            Box::new(source) as Box<dyn FrameSource>,
            detectors,
            self.publishers.clone(),
            self.metrics.clone(),
            self.clock.clone(),
            self.shutdown.clone(),
        )
        .with_fps_target(camera.fps_target)
        .with_roi(camera.roi.clone())
        .with_min_box_area(camera.min_box_area)
        .with_save_snapshots(save_snapshots)
        .with_envelope_identity(producer, bucket_ms))
    }
}

/// Publishers over the in-process transports, for builds without cloud
/// bindings. Each enabled sink logs what it is actually writing to.
fn build_default_publishers(
    config: &AppConfig,
    metrics: &Arc<Metrics>,
    clock: &Arc<dyn Clock>,
) -> Publishers {
    let mut publishers = Publishers::default();

    if let Some(kds) = &config.publishers.kds {
        log::warn!(
            "event stream transport not compiled in; stream '{}' records stay in-process",
            kds.stream_name
        );
        publishers.events = Some(
            EventStreamPublisher::new(
                kds.clone(),
                Arc::new(InMemoryStreamClient::new()),
                clock.clone(),
            )
            .with_prometheus(metrics.clone()),
        );
    }

    if let Some(s3) = &config.publishers.s3 {
        log::warn!(
            "object store transport not compiled in; bucket '{}' snapshots stay in-process",
            s3.publisher.bucket
        );
        publishers.snapshots = Some(
            SnapshotPublisher::new(s3.publisher.clone(), Arc::new(InMemoryObjectStore::new()))
                .with_prometheus(metrics.clone()),
        );
    }

    if let Some(ddb) = &config.publishers.ddb {
        log::warn!(
            "metadata store transport not compiled in; table '{}' rows stay in-process",
            ddb.table_name
        );
        publishers.metadata = Some(
            MetadataPublisher::new(
                ddb.clone(),
                Arc::new(InMemoryTableClient::new()),
                clock.clone(),
            )
            .with_prometheus(metrics.clone()),
        );
    }

    publishers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_builds_from_config_with_detectors() {
        let config = AppConfig::from_yaml(
            r#"
publishers:
  kds:
    enabled: true
    stream_name: events
cameras:
  cam-a:
    kvs_stream_name: stream-a
    detectors:
      - type: weapon
        params:
          classes: [gun]
"#,
        )
        .unwrap();
        let supervisor = Supervisor::new(config).unwrap();
        assert!(!supervisor.shutdown_flag().load(Ordering::SeqCst));
    }

    #[test]
    fn bad_detector_type_aborts_worker_construction() {
        let config = AppConfig::from_yaml(
            r#"
cameras:
  cam-a:
    kvs_stream_name: stream-a
    detectors:
      - type: sasquatch
"#,
        )
        .unwrap();
        let supervisor = Supervisor::new(config.clone()).unwrap();
        let camera = &config.cameras[0];
        let result = supervisor.build_worker(camera);
        let err = match result {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.to_string().contains("cannot configure detector"));
    }
}
