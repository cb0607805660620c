//! HLS frame source for Kinesis Video Streams.
//!
//! Produces a lazy, infinite sequence of (frame, timestamp) pairs from a
//! live stream, surviving session-URL expiry and transport faults. All
//! status is reported through [`ConnectionState`] transitions; every
//! transition is logged and exported as a gauge.
//!
//! Single-reader invariant: only one caller enters `read_frame` at a time
//! (the source is owned by exactly one worker), and URL refresh happens
//! inline at the top of the read cycle before the decoder is touched.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::Rng;

use crate::frame::Frame;
use crate::frame_source::control::{
    ControlPlaneError, HlsSessionRequest, StreamingSessionProvider, HLS_API_NAME,
};
use crate::frame_source::decoder::{VideoDecoder, VideoReader};
use crate::frame_source::{ConnectionState, FrameSource, SourceMetricsSnapshot};
use crate::metrics::CameraStreamMetrics;
use crate::time::Clock;

/// Bounds imposed by the HLS session API.
pub const MIN_SESSION_SECONDS: u64 = 60;
pub const MAX_SESSION_SECONDS: u64 = 43_200;

/// Frame source configuration for one camera.
#[derive(Clone, Debug)]
pub struct HlsSourceConfig {
    pub camera_id: String,
    pub stream_name: String,
    pub region: String,
    /// Requested session validity, 60..=43200 seconds.
    pub session_seconds: u64,
    /// Refresh this many seconds before expiry; must be < session_seconds.
    pub refresh_margin: u64,
    /// Base reconnection delay.
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub backoff_multiplier: f64,
    /// Read failures tolerated before the source fails permanently.
    pub max_consecutive_errors: u32,
}

impl Default for HlsSourceConfig {
    fn default() -> Self {
        Self {
            camera_id: String::new(),
            stream_name: String::new(),
            region: "us-east-1".to_string(),
            session_seconds: 300,
            refresh_margin: 30,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_consecutive_errors: 10,
        }
    }
}

impl HlsSourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.camera_id.is_empty() {
            return Err(anyhow!("camera_id must not be empty"));
        }
        if self.stream_name.is_empty() {
            return Err(anyhow!("stream_name must not be empty"));
        }
        if !(MIN_SESSION_SECONDS..=MAX_SESSION_SECONDS).contains(&self.session_seconds) {
            return Err(anyhow!(
                "session_seconds {} outside [{}, {}]",
                self.session_seconds,
                MIN_SESSION_SECONDS,
                MAX_SESSION_SECONDS
            ));
        }
        if self.refresh_margin >= self.session_seconds {
            return Err(anyhow!(
                "refresh_margin {} must be smaller than session_seconds {}",
                self.refresh_margin,
                self.session_seconds
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow!(
                "backoff_multiplier {} must be >= 1.0",
                self.backoff_multiplier
            ));
        }
        if self.max_consecutive_errors == 0 {
            return Err(anyhow!("max_consecutive_errors must be positive"));
        }
        Ok(())
    }
}

/// HLS frame source: session acquisition, refresh, reconnection.
pub struct KvsHlsSource {
    config: HlsSourceConfig,
    provider: Box<dyn StreamingSessionProvider>,
    decoder: Box<dyn VideoDecoder>,
    clock: Arc<dyn Clock>,
    prom: Option<CameraStreamMetrics>,

    state: ConnectionState,
    reader: Option<Box<dyn VideoReader>>,
    url_acquired_at: Option<Duration>,
    running: bool,
    fatal: bool,
    ever_connected: bool,
    consecutive_errors: u32,

    reconnects_total: u64,
    frames_total: u64,
    last_frame_timestamp_ms: Option<i64>,
    url_refreshes_total: u64,
    read_errors_total: u64,
}

impl KvsHlsSource {
    pub fn new(
        config: HlsSourceConfig,
        provider: Box<dyn StreamingSessionProvider>,
        decoder: Box<dyn VideoDecoder>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            provider,
            decoder,
            clock,
            prom: None,
            state: ConnectionState::Disconnected,
            reader: None,
            url_acquired_at: None,
            running: false,
            fatal: false,
            ever_connected: false,
            consecutive_errors: 0,
            reconnects_total: 0,
            frames_total: 0,
            last_frame_timestamp_ms: None,
            url_refreshes_total: 0,
            read_errors_total: 0,
        })
    }

    /// Attach per-camera Prometheus handles.
    pub fn with_stream_metrics(mut self, metrics: CameraStreamMetrics) -> Self {
        metrics.set_connection_state(self.state);
        self.prom = Some(metrics);
        self
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Connected and below the error cap.
    pub fn is_healthy(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.consecutive_errors < self.config.max_consecutive_errors
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        log::info!(
            "[{}] connection state {} -> {}",
            self.config.camera_id,
            self.state,
            next
        );
        self.state = next;
        if let Some(prom) = &self.prom {
            prom.set_connection_state(next);
        }
    }

    /// Two-step session acquisition against the control plane.
    fn acquire_url(&mut self) -> Result<String, ControlPlaneError> {
        let endpoint = self
            .provider
            .get_data_endpoint(&self.config.stream_name, HLS_API_NAME)?;
        let request = HlsSessionRequest::live(&self.config.stream_name, self.config.session_seconds);
        let url = self
            .provider
            .get_hls_streaming_session_url(&endpoint, &request)?;

        self.url_refreshes_total += 1;
        if let Some(prom) = &self.prom {
            prom.url_refreshes.inc();
        }
        log::debug!(
            "[{}] acquired HLS session url (refresh #{}, expires {}s)",
            self.config.camera_id,
            self.url_refreshes_total,
            self.config.session_seconds
        );
        Ok(url)
    }

    /// Tear down the reader (if any) and reopen against a fresh URL.
    /// On success the state is Connected; on failure it is Error.
    fn open_stream(&mut self) -> bool {
        self.reader = None;

        let url = match self.acquire_url() {
            Ok(url) => url,
            Err(err) => {
                match &err {
                    ControlPlaneError::ResourceNotFound { stream } => {
                        log::error!(
                            "[{}] stream '{}' not found while acquiring session url",
                            self.config.camera_id,
                            stream
                        );
                    }
                    other => {
                        log::error!(
                            "[{}] failed to acquire session url: {}",
                            self.config.camera_id,
                            other
                        );
                    }
                }
                self.set_state(ConnectionState::Error);
                return false;
            }
        };

        match self.decoder.open(&url) {
            Ok(reader) => {
                self.reader = Some(reader);
                self.url_acquired_at = Some(self.clock.monotonic());
                self.ever_connected = true;
                self.set_state(ConnectionState::Connected);
                true
            }
            Err(err) => {
                log::error!(
                    "[{}] failed to open decoder on session url: {}",
                    self.config.camera_id,
                    err
                );
                self.set_state(ConnectionState::Error);
                false
            }
        }
    }

    /// Stale iff held for at least `session_seconds - refresh_margin`.
    fn url_is_stale(&self) -> bool {
        match self.url_acquired_at {
            None => true,
            Some(acquired) => {
                let held = self.clock.monotonic().saturating_sub(acquired);
                held >= Duration::from_secs(self.config.session_seconds - self.config.refresh_margin)
            }
        }
    }

    /// Backoff for the n-th consecutive failure (n >= 1):
    /// `min(base * multiplier^(n-1), max) * U(0.8, 1.2)`.
    fn backoff_delay(&self, failure_count: u32) -> Duration {
        let base = self.config.reconnect_delay.as_secs_f64();
        let exponent = failure_count.saturating_sub(1).min(63) as i32;
        let raw = base * self.config.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.config.max_reconnect_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_secs_f64(capped * jitter)
    }

    /// Read-failure path: count, back off, then either fail permanently or
    /// attempt one reconnect. The sleep runs before the fatal check so the
    /// failure that hits the cap still pays the final backoff.
    fn handle_read_failure(&mut self) {
        self.consecutive_errors += 1;
        let failures = self.consecutive_errors;

        let delay = self.backoff_delay(failures);
        log::warn!(
            "[{}] frame read failed ({}/{} consecutive), backing off {:.1}s",
            self.config.camera_id,
            failures,
            self.config.max_consecutive_errors,
            delay.as_secs_f64()
        );
        self.clock.sleep(delay);

        if failures >= self.config.max_consecutive_errors {
            log::error!(
                "[{}] giving up after {} consecutive read failures",
                self.config.camera_id,
                failures
            );
            self.fatal = true;
            self.set_state(ConnectionState::Error);
            return;
        }

        self.set_state(ConnectionState::Reconnecting);
        self.reconnects_total += 1;
        if let Some(prom) = &self.prom {
            prom.reconnects.inc();
        }
        self.open_stream();
    }
}

impl FrameSource for KvsHlsSource {
    fn camera_id(&self) -> &str {
        &self.config.camera_id
    }

    fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.running = true;
        self.set_state(ConnectionState::Connecting);
        if self.open_stream() {
            Ok(())
        } else {
            // Leave running; read_frame drives reconnection from here.
            Err(anyhow!(
                "initial connect failed for camera '{}' (stream '{}')",
                self.config.camera_id,
                self.config.stream_name
            ))
        }
    }

    fn read_frame(&mut self) -> Option<(Frame, i64)> {
        if !self.running || self.fatal {
            return None;
        }

        // Refresh the session before touching the decoder.
        if self.reader.is_some() && self.url_is_stale() {
            log::info!(
                "[{}] session url stale, refreshing before read",
                self.config.camera_id
            );
            self.set_state(ConnectionState::Reconnecting);
            if !self.open_stream() {
                self.handle_read_failure();
                return None;
            }
        }

        if self.reader.is_none() {
            self.set_state(if self.ever_connected {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });
            if !self.open_stream() {
                self.handle_read_failure();
                return None;
            }
        }

        let frame = self
            .reader
            .as_mut()
            .and_then(|reader| reader.read());

        match frame {
            Some(frame) => {
                self.consecutive_errors = 0;
                self.frames_total += 1;
                let ts_ms = self.clock.wall_ms();
                self.last_frame_timestamp_ms = Some(ts_ms);
                if let Some(prom) = &self.prom {
                    prom.frames.inc();
                    prom.last_frame_timestamp.set(ts_ms as f64);
                }
                Some((frame, ts_ms))
            }
            None => {
                self.read_errors_total += 1;
                if let Some(prom) = &self.prom {
                    prom.read_errors.inc();
                }
                self.set_state(ConnectionState::Error);
                self.handle_read_failure();
                None
            }
        }
    }

    fn is_fatal(&self) -> bool {
        self.fatal
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn release(&mut self) {
        self.running = false;
        self.reader = None;
        self.url_acquired_at = None;
        self.set_state(ConnectionState::Disconnected);
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
    }

    fn metrics(&self) -> SourceMetricsSnapshot {
        SourceMetricsSnapshot {
            camera_id: self.config.camera_id.clone(),
            reconnects_total: self.reconnects_total,
            frames_total: self.frames_total,
            last_frame_timestamp_ms: self.last_frame_timestamp_ms,
            url_refreshes_total: self.url_refreshes_total,
            read_errors_total: self.read_errors_total,
        }
    }
}
