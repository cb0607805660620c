//! Inference backend seam.
//!
//! Detectors treat the model runtime as a pluggable function
//! `frame -> detections at a low threshold`. The default build ships the
//! scripted backend only; ONNX inference via tract lives behind the
//! `backend-tract` feature.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Deserialize;

use crate::event::Detection;
use crate::frame::Frame;

pub trait InferenceBackend: Send {
    fn name(&self) -> &'static str;

    /// Run the model and return detections with confidence >= `conf_threshold`.
    fn infer(&mut self, frame: &Frame, conf_threshold: f32) -> Result<Vec<Detection>>;
}

/// Backend selection parsed from the detector `params` mapping. Lives
/// alongside the detector's own config keys in the same map.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BackendParams {
    pub backend: String,
    pub model_path: Option<String>,
    pub input_width: u32,
    pub input_height: u32,
}

impl Default for BackendParams {
    fn default() -> Self {
        Self {
            backend: "scripted".to_string(),
            model_path: None,
            input_width: 640,
            input_height: 640,
        }
    }
}

/// Build the configured backend. `class_names` maps model class indices to
/// labels for runtimes that report numeric classes.
#[cfg_attr(not(feature = "backend-tract"), allow(unused_variables))]
pub fn build_backend(
    params: &BackendParams,
    class_names: &[String],
) -> Result<Box<dyn InferenceBackend>> {
    match params.backend.as_str() {
        "scripted" => Ok(Box::new(ScriptedBackend::empty())),
        #[cfg(feature = "backend-tract")]
        "tract" => {
            let model_path = params.model_path.as_deref().ok_or_else(|| {
                anyhow::anyhow!("tract backend requires 'model_path' in detector params")
            })?;
            let backend = crate::detect::tract::TractBackend::new(
                model_path,
                params.input_width,
                params.input_height,
                class_names.to_vec(),
            )?;
            Ok(Box::new(backend))
        }
        other => Err(anyhow::anyhow!(
            "inference backend '{}' is not available in this build",
            other
        )),
    }
}

/// Deterministic backend fed a per-frame script of detections.
///
/// Each `infer` call consumes the next scripted frame; once the script is
/// exhausted the backend reports no detections. The script handle is
/// shared so tests can keep feeding frames after handing the backend to a
/// detector.
pub struct ScriptedBackend {
    script: Arc<Mutex<VecDeque<Vec<Detection>>>>,
}

impl ScriptedBackend {
    pub fn empty() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn with_script(frames: Vec<Vec<Detection>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(frames.into())),
        }
    }

    /// Handle for appending frames to the script after construction.
    pub fn script_handle(&self) -> ScriptHandle {
        ScriptHandle {
            script: self.script.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ScriptHandle {
    script: Arc<Mutex<VecDeque<Vec<Detection>>>>,
}

impl ScriptHandle {
    pub fn push_frame(&self, detections: Vec<Detection>) {
        self.script.lock().unwrap().push_back(detections);
    }
}

impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn infer(&mut self, _frame: &Frame, conf_threshold: f32) -> Result<Vec<Detection>> {
        let next = self.script.lock().unwrap().pop_front().unwrap_or_default();
        Ok(next
            .into_iter()
            .filter(|d| d.conf >= conf_threshold)
            .collect())
    }
}
