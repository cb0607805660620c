//! Control-plane seam for HLS session acquisition.
//!
//! The cloud video-streams control plane is an external collaborator: the
//! source only ever performs the two-step endpoint/session-URL dance, so
//! that is the whole trait. Production bindings implement
//! [`StreamingSessionProvider`] against their SDK; tests and the demo wire
//! the in-tree stub.

use std::sync::Mutex;

use thiserror::Error;

/// API name passed to `get_data_endpoint` for HLS playback.
pub const HLS_API_NAME: &str = "GET_HLS_STREAMING_SESSION_URL";

/// Control-plane error taxonomy, as the reconnection logic needs it.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// The named stream does not exist (ResourceNotFoundException).
    #[error("stream '{stream}' not found")]
    ResourceNotFound { stream: String },

    /// Credentials missing or the role is not allowed to read the stream.
    #[error("access denied for stream '{stream}': {message}")]
    AccessDenied { stream: String, message: String },

    /// Anything transient on the wire.
    #[error("control plane transport error: {0}")]
    Transport(String),
}

/// Request parameters for `get_hls_streaming_session_url`.
///
/// The pipeline always asks for LIVE playback over fragmented MP4 with
/// ALWAYS discontinuity and display timestamps, so only the stream name
/// and expiry vary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HlsSessionRequest {
    pub stream_name: String,
    pub playback_mode: &'static str,
    pub container_format: &'static str,
    pub discontinuity_mode: &'static str,
    pub display_fragment_timestamp: &'static str,
    pub expires_seconds: u64,
}

impl HlsSessionRequest {
    pub fn live(stream_name: &str, expires_seconds: u64) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            playback_mode: "LIVE",
            container_format: "FRAGMENTED_MP4",
            discontinuity_mode: "ALWAYS",
            display_fragment_timestamp: "ALWAYS",
            expires_seconds,
        }
    }
}

/// The two control-plane operations the frame source consumes.
pub trait StreamingSessionProvider: Send {
    /// Resolve the data endpoint serving `api_name` for the named stream.
    fn get_data_endpoint(
        &self,
        stream_name: &str,
        api_name: &str,
    ) -> Result<String, ControlPlaneError>;

    /// Obtain a time-limited HLS session URL from the data endpoint.
    fn get_hls_streaming_session_url(
        &self,
        endpoint: &str,
        request: &HlsSessionRequest,
    ) -> Result<String, ControlPlaneError>;
}

/// Deterministic in-process provider.
///
/// Hands out numbered session URLs and counts calls; tests use it to
/// assert refresh behaviour, and the demo wiring uses it when no cloud
/// binding is compiled in.
pub struct StubSessionProvider {
    inner: Mutex<StubState>,
}

struct StubState {
    endpoint_calls: u64,
    session_calls: u64,
    fail_with: Option<fn(&str) -> ControlPlaneError>,
}

impl StubSessionProvider {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StubState {
                endpoint_calls: 0,
                session_calls: 0,
                fail_with: None,
            }),
        }
    }

    /// Make every subsequent call fail with the given error constructor.
    pub fn fail_with(&self, make: fn(&str) -> ControlPlaneError) {
        self.inner.lock().unwrap().fail_with = Some(make);
    }

    pub fn clear_failure(&self) {
        self.inner.lock().unwrap().fail_with = None;
    }

    pub fn endpoint_calls(&self) -> u64 {
        self.inner.lock().unwrap().endpoint_calls
    }

    /// Number of session URLs issued so far.
    pub fn session_calls(&self) -> u64 {
        self.inner.lock().unwrap().session_calls
    }
}

impl Default for StubSessionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingSessionProvider for StubSessionProvider {
    fn get_data_endpoint(
        &self,
        stream_name: &str,
        _api_name: &str,
    ) -> Result<String, ControlPlaneError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(make) = state.fail_with {
            return Err(make(stream_name));
        }
        state.endpoint_calls += 1;
        Ok(format!("https://stub-endpoint.local/{}", stream_name))
    }

    fn get_hls_streaming_session_url(
        &self,
        endpoint: &str,
        request: &HlsSessionRequest,
    ) -> Result<String, ControlPlaneError> {
        let mut state = self.inner.lock().unwrap();
        if let Some(make) = state.fail_with {
            return Err(make(&request.stream_name));
        }
        state.session_calls += 1;
        Ok(format!(
            "{}/hls/{}/session-{}.m3u8?expires={}",
            endpoint, request.stream_name, state.session_calls, request.expires_seconds
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_issues_numbered_session_urls() {
        let provider = StubSessionProvider::new();
        let endpoint = provider.get_data_endpoint("front-gate", HLS_API_NAME).unwrap();
        let request = HlsSessionRequest::live("front-gate", 300);
        let first = provider
            .get_hls_streaming_session_url(&endpoint, &request)
            .unwrap();
        let second = provider
            .get_hls_streaming_session_url(&endpoint, &request)
            .unwrap();
        assert!(first.contains("session-1"));
        assert!(second.contains("session-2"));
        assert_eq!(provider.session_calls(), 2);
    }

    #[test]
    fn stub_failure_mode_surfaces_errors() {
        let provider = StubSessionProvider::new();
        provider.fail_with(|stream| ControlPlaneError::ResourceNotFound {
            stream: stream.to_string(),
        });
        let err = provider
            .get_data_endpoint("missing", HLS_API_NAME)
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::ResourceNotFound { .. }));
    }

    #[test]
    fn live_request_pins_the_fixed_parameters() {
        let request = HlsSessionRequest::live("cam", 120);
        assert_eq!(request.playback_mode, "LIVE");
        assert_eq!(request.container_format, "FRAGMENTED_MP4");
        assert_eq!(request.discontinuity_mode, "ALWAYS");
        assert_eq!(request.expires_seconds, 120);
    }
}
