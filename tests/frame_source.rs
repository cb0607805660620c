//! HLS frame source behaviour: URL refresh, backoff, fatal cap.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use kvs_infer::frame::Frame;
use kvs_infer::frame_source::{
    ConnectionState, ControlPlaneError, FrameSource, HlsSessionRequest, HlsSourceConfig,
    KvsHlsSource, StreamingSessionProvider, StubSessionProvider, VideoDecoder, VideoReader,
};
use kvs_infer::time::{Clock, StubClock};

/// Decoder whose readers pop scripted read outcomes; once the script is
/// exhausted every read yields `default_outcome`.
struct ScriptedDecoder {
    outcomes: Arc<Mutex<VecDeque<bool>>>,
    opens: Arc<AtomicUsize>,
    default_outcome: bool,
}

impl ScriptedDecoder {
    fn new(outcomes: Vec<bool>, default_outcome: bool) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes.into())),
            opens: Arc::new(AtomicUsize::new(0)),
            default_outcome,
        }
    }

    fn opens_handle(&self) -> Arc<AtomicUsize> {
        self.opens.clone()
    }
}

struct ScriptedReader {
    outcomes: Arc<Mutex<VecDeque<bool>>>,
    default_outcome: bool,
}

impl VideoDecoder for ScriptedDecoder {
    fn open(&mut self, _url: &str) -> Result<Box<dyn VideoReader>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedReader {
            outcomes: self.outcomes.clone(),
            default_outcome: self.default_outcome,
        }))
    }
}

impl VideoReader for ScriptedReader {
    fn read(&mut self) -> Option<Frame> {
        let ok = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_outcome);
        ok.then(|| Frame::filled(16, 16, [0, 0, 0]))
    }
}

fn config(session_seconds: u64, refresh_margin: u64, max_errors: u32) -> HlsSourceConfig {
    HlsSourceConfig {
        camera_id: "cam-a".to_string(),
        stream_name: "front-gate".to_string(),
        session_seconds,
        refresh_margin,
        reconnect_delay: Duration::from_secs(1),
        max_reconnect_delay: Duration::from_secs(10),
        backoff_multiplier: 2.0,
        max_consecutive_errors: max_errors,
        ..HlsSourceConfig::default()
    }
}

struct Fixture {
    source: KvsHlsSource,
    clock: Arc<StubClock>,
    opens: Arc<AtomicUsize>,
    session_calls: Arc<StubSessionProvider>,
}

fn fixture(config: HlsSourceConfig, decoder: ScriptedDecoder) -> Fixture {
    let clock = Arc::new(StubClock::new());
    clock.set_wall_ms(1_700_000_000_000);
    let provider = Arc::new(StubSessionProvider::new());
    let opens = decoder.opens_handle();

    // The source owns its own provider handle; the Arc in the fixture is
    // only for counting calls.
    struct SharedProvider(Arc<StubSessionProvider>);
    impl StreamingSessionProvider for SharedProvider {
        fn get_data_endpoint(
            &self,
            stream_name: &str,
            api_name: &str,
        ) -> Result<String, ControlPlaneError> {
            self.0.get_data_endpoint(stream_name, api_name)
        }

        fn get_hls_streaming_session_url(
            &self,
            endpoint: &str,
            request: &HlsSessionRequest,
        ) -> Result<String, ControlPlaneError> {
            self.0.get_hls_streaming_session_url(endpoint, request)
        }
    }

    let source = KvsHlsSource::new(
        config,
        Box::new(SharedProvider(provider.clone())),
        Box::new(decoder),
        clock.clone() as Arc<dyn Clock>,
    )
    .unwrap();

    Fixture {
        source,
        clock,
        opens,
        session_calls: provider,
    }
}

/// The session URL refreshes exactly when it goes stale, and the
/// decoder is reopened on refresh.
#[test]
fn url_refreshes_only_after_margin_expires() {
    let mut fx = fixture(config(120, 30, 10), ScriptedDecoder::new(vec![], true));

    fx.source.start().unwrap();
    assert_eq!(fx.session_calls.session_calls(), 1);
    assert_eq!(fx.opens.load(Ordering::SeqCst), 1);

    // t = 89s: held 89 < 90, no refresh on read.
    fx.clock.advance(Duration::from_secs(89));
    assert!(fx.source.read_frame().is_some());
    assert_eq!(fx.session_calls.session_calls(), 1);
    assert_eq!(fx.opens.load(Ordering::SeqCst), 1);

    // t = 91s: stale; exactly one refresh and the decoder is reopened.
    fx.clock.advance(Duration::from_secs(2));
    assert!(fx.source.read_frame().is_some());
    assert_eq!(fx.session_calls.session_calls(), 2);
    assert_eq!(fx.opens.load(Ordering::SeqCst), 2);
    assert_eq!(fx.source.metrics().url_refreshes_total, 2);
    assert_eq!(fx.source.connection_state(), ConnectionState::Connected);

    // Another immediate read: fresh URL, no further refresh.
    assert!(fx.source.read_frame().is_some());
    assert_eq!(fx.session_calls.session_calls(), 2);
}

/// Backoff envelope, and the fatal transition when the error cap hits.
#[test]
fn reconnect_backoff_is_jittered_exponential_then_fatal() {
    let mut fx = fixture(config(300, 30, 3), ScriptedDecoder::new(vec![], false));
    fx.source.start().unwrap();

    for _ in 0..3 {
        assert!(fx.source.read_frame().is_none());
    }

    let sleeps = fx.clock.recorded_sleeps();
    assert_eq!(sleeps.len(), 3);
    let ranges = [(0.8, 1.2), (1.6, 2.4), (3.2, 4.8)];
    for (sleep, (lo, hi)) in sleeps.iter().zip(ranges) {
        let secs = sleep.as_secs_f64();
        assert!(
            (lo..=hi).contains(&secs),
            "sleep {}s outside [{}, {}]",
            secs,
            lo,
            hi
        );
    }

    // Fatal now; subsequent reads yield none without sleeping again.
    assert!(fx.source.is_fatal());
    assert_eq!(fx.source.connection_state(), ConnectionState::Error);
    assert!(fx.source.read_frame().is_none());
    assert_eq!(fx.clock.recorded_sleeps().len(), 3);
}

/// One successful read resets the consecutive-error counter.
#[test]
fn successful_read_resets_error_counter() {
    // fail, fail, ok, then default fail.
    let decoder = ScriptedDecoder::new(vec![false, false, true], false);
    let mut fx = fixture(config(300, 30, 10), decoder);
    fx.source.start().unwrap();

    assert!(fx.source.read_frame().is_none());
    assert!(fx.source.read_frame().is_none());
    assert_eq!(fx.source.consecutive_errors(), 2);

    assert!(fx.source.read_frame().is_some());
    assert_eq!(fx.source.consecutive_errors(), 0);
    assert!(fx.source.is_healthy());

    // The next failure starts the backoff ladder from the base again.
    assert!(fx.source.read_frame().is_none());
    assert_eq!(fx.source.consecutive_errors(), 1);
    let last_sleep = *fx.clock.recorded_sleeps().last().unwrap();
    assert!((0.8..=1.2).contains(&last_sleep.as_secs_f64()));
}

#[test]
fn metrics_snapshot_tracks_reads_and_errors() {
    let decoder = ScriptedDecoder::new(vec![true, false, true], true);
    let mut fx = fixture(config(300, 30, 10), decoder);
    fx.source.start().unwrap();

    assert!(fx.source.read_frame().is_some());
    assert!(fx.source.read_frame().is_none());
    assert!(fx.source.read_frame().is_some());

    let snapshot = fx.source.metrics();
    assert_eq!(snapshot.camera_id, "cam-a");
    assert_eq!(snapshot.frames_total, 2);
    assert_eq!(snapshot.read_errors_total, 1);
    assert_eq!(snapshot.reconnects_total, 1);
    assert!(snapshot.last_frame_timestamp_ms.is_some());
}

#[test]
fn stopped_source_reads_none_and_release_disconnects() {
    let mut fx = fixture(config(300, 30, 10), ScriptedDecoder::new(vec![], true));
    fx.source.start().unwrap();
    assert!(fx.source.read_frame().is_some());

    fx.source.stop();
    assert!(fx.source.read_frame().is_none());
    assert!(!fx.source.is_fatal());

    fx.source.release();
    assert_eq!(fx.source.connection_state(), ConnectionState::Disconnected);
}
