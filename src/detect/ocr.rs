//! OCR seam for plate recognition.
//!
//! The ALPR detector treats OCR as a pluggable `image -> (text, confidence)`
//! function. Engine names from configuration resolve here; names without a
//! compiled-in implementation abort detector construction.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::frame::Frame;

pub trait OcrEngine: Send {
    fn name(&self) -> &str;

    /// Recognise text in a cropped plate image. An empty string with zero
    /// confidence means "nothing readable" and is not an error.
    fn recognize(&mut self, image: &Frame) -> Result<(String, f32)>;
}

/// Resolve an engine selector from configuration.
pub fn build_ocr_engine(engine: &str, _lang: &str) -> Result<Box<dyn OcrEngine>> {
    match engine {
        "stub" => Ok(Box::new(StubOcrEngine::empty())),
        other => Err(anyhow!(
            "ocr engine '{}' is not available in this build",
            other
        )),
    }
}

/// Scripted OCR engine: replays queued (text, confidence) responses, then
/// reports nothing readable. Shared handle so tests can keep feeding
/// responses after the detector owns the engine.
pub struct StubOcrEngine {
    responses: Arc<Mutex<VecDeque<(String, f32)>>>,
}

impl StubOcrEngine {
    pub fn empty() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn with_responses(responses: Vec<(String, f32)>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
        }
    }

    pub fn response_handle(&self) -> OcrResponseHandle {
        OcrResponseHandle {
            responses: self.responses.clone(),
        }
    }
}

#[derive(Clone)]
pub struct OcrResponseHandle {
    responses: Arc<Mutex<VecDeque<(String, f32)>>>,
}

impl OcrResponseHandle {
    pub fn push(&self, text: &str, confidence: f32) {
        self.responses
            .lock()
            .unwrap()
            .push_back((text.to_string(), confidence));
    }
}

impl OcrEngine for StubOcrEngine {
    fn name(&self) -> &str {
        "stub"
    }

    fn recognize(&mut self, _image: &Frame) -> Result<(String, f32)> {
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| (String::new(), 0.0)))
    }
}
