//! Frame sources.
//!
//! A frame source produces decoded (frame, timestamp) pairs for exactly
//! one camera and is owned by exactly one worker. The only production
//! source is the KVS HLS source; its collaborators (control plane,
//! decoder) are trait seams with in-tree stubs.

pub mod control;
pub mod decoder;
pub mod kvs_hls;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::frame::Frame;

pub use control::{
    ControlPlaneError, HlsSessionRequest, StreamingSessionProvider, StubSessionProvider,
    HLS_API_NAME,
};
pub use decoder::{SyntheticDecoder, VideoDecoder, VideoReader};
pub use kvs_hls::{HlsSourceConfig, KvsHlsSource, MAX_SESSION_SECONDS, MIN_SESSION_SECONDS};

/// Connection status of a frame source. Exported as a gauge
/// (0=disconnected, 1=connecting, 2=connected, 3=reconnecting, 4=error).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_gauge_value(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Error => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters a frame source exposes to its worker.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceMetricsSnapshot {
    pub camera_id: String,
    pub reconnects_total: u64,
    pub frames_total: u64,
    pub last_frame_timestamp_ms: Option<i64>,
    pub url_refreshes_total: u64,
    pub read_errors_total: u64,
}

/// The interface the camera worker drives.
///
/// `read_frame` returning `None` is either a transient failure (caller
/// keeps looping), a stop, or a terminal condition; `is_fatal`
/// distinguishes the terminal case.
pub trait FrameSource: Send {
    fn camera_id(&self) -> &str;
    fn start(&mut self) -> Result<()>;
    fn read_frame(&mut self) -> Option<(Frame, i64)>;
    fn is_fatal(&self) -> bool;
    fn stop(&mut self);
    fn release(&mut self);
    fn connection_state(&self) -> ConnectionState;
    fn metrics(&self) -> SourceMetricsSnapshot;
}
