#![cfg(feature = "backend-tract")]

//! ONNX inference via tract.
//!
//! Loads a local model file and runs it on BGR frames. Expects a combined
//! post-NMS output tensor of shape `[N, 6]` or `[1, N, 6]` with rows
//! `x1, y1, x2, y2, confidence, class_id`. Box coordinates may be
//! normalised (0..1) or absolute pixels; both are handled.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::infer::InferenceBackend;
use crate::event::Detection;
use crate::frame::Frame;
use crate::geometry::BBox;

/// Coordinates at or below this are treated as normalised.
const ABSOLUTE_COORD_THRESHOLD: f32 = 1.5;

pub struct TractBackend {
    model: TypedSimplePlan<TypedModel>,
    input_width: u32,
    input_height: u32,
    class_names: Vec<String>,
}

impl TractBackend {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_width: u32,
        input_height: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_height as usize, input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_width,
            input_height,
            class_names,
        })
    }

    /// NCHW f32 RGB tensor from a BGR frame, nearest-neighbour resampled
    /// to the model input size when dimensions differ.
    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let (in_w, in_h) = (self.input_width as usize, self.input_height as usize);
        let (src_w, src_h) = (frame.width() as usize, frame.height() as usize);
        if src_w == 0 || src_h == 0 {
            return Err(anyhow!("frame has zero extent"));
        }
        let data = frame.data();

        let input =
            tract_ndarray::Array4::from_shape_fn((1, 3, in_h, in_w), |(_, channel, y, x)| {
                let src_x = x * src_w / in_w;
                let src_y = y * src_h / in_h;
                let idx = (src_y * src_w + src_x) * 3;
                // BGR byte order in the frame; the model wants RGB.
                let byte = match channel {
                    0 => data[idx + 2],
                    1 => data[idx + 1],
                    _ => data[idx],
                };
                byte as f32 / 255.0
            });
        Ok(input.into_tensor())
    }

    fn class_name(&self, class_id: i64) -> String {
        if class_id >= 0 {
            if let Some(name) = self.class_names.get(class_id as usize) {
                return name.clone();
            }
        }
        format!("class_{}", class_id)
    }

    fn to_frame_bbox(&self, raw: [f32; 4], frame_width: u32, frame_height: u32) -> Option<BBox> {
        let normalised = raw.iter().all(|v| *v <= ABSOLUTE_COORD_THRESHOLD);
        let (sx, sy) = if normalised {
            (frame_width as f32, frame_height as f32)
        } else {
            // Absolute in model-input space; rescale to the frame.
            (
                frame_width as f32 / self.input_width as f32,
                frame_height as f32 / self.input_height as f32,
            )
        };
        let bbox = BBox::new(raw[0] * sx, raw[1] * sy, raw[2] * sx, raw[3] * sy);
        bbox.is_well_formed().then_some(bbox)
    }

    fn parse_combined_output(
        &self,
        output: &Tensor,
        frame_width: u32,
        frame_height: u32,
        conf_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let shape = output.shape().to_vec();
        let view = output
            .to_array_view::<f32>()
            .context("output tensor was not f32")?;
        let data = view
            .as_slice()
            .ok_or_else(|| anyhow!("output tensor is not contiguous"))?;

        let rows = match shape.as_slice() {
            [1, n, 6] => *n,
            [n, 6] => *n,
            _ => {
                return Err(anyhow!(
                    "output tensor must have shape [N,6] or [1,N,6], got {:?}",
                    shape
                ))
            }
        };
        if data.len() != rows.saturating_mul(6) {
            return Err(anyhow!(
                "output tensor has {} values, expected {}",
                data.len(),
                rows.saturating_mul(6)
            ));
        }

        let mut detections = Vec::new();
        for chunk in data.chunks(6) {
            let confidence = chunk[4];
            if !confidence.is_finite() {
                return Err(anyhow!("model confidence was not finite"));
            }
            if confidence < conf_threshold {
                continue;
            }
            let class_id = chunk[5].round() as i64;
            if let Some(bbox) =
                self.to_frame_bbox([chunk[0], chunk[1], chunk[2], chunk[3]], frame_width, frame_height)
            {
                detections.push(Detection::new(self.class_name(class_id), confidence, bbox));
            }
        }
        Ok(detections)
    }
}

impl InferenceBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, frame: &Frame, conf_threshold: f32) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("model execution failed")?;
        if outputs.is_empty() {
            return Err(anyhow!("model produced no outputs"));
        }
        self.parse_combined_output(&outputs[0], frame.width(), frame.height(), conf_threshold)
    }
}
