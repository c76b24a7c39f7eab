#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::InferenceModel;
use crate::detect::decoder::RawTensor;
use crate::frame::PreprocessedFrame;

/// Tract-based backend for ONNX inference.
///
/// Loads a local YOLO-style export and runs it on preprocessed CHW frames.
pub struct TractModel {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
}

impl TractModel {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
        })
    }

    fn build_input(&self, input: &PreprocessedFrame) -> Result<Tensor> {
        if input.width != self.width || input.height != self.height {
            return Err(anyhow!(
                "input size {}x{} does not match model input {}x{}",
                input.width,
                input.height,
                self.width,
                self.height
            ));
        }
        let array = tract_ndarray::Array4::from_shape_vec(input.shape(), input.data.clone())
            .context("preprocessed tensor does not match its declared shape")?;
        Ok(array.into_tensor())
    }
}

impl InferenceModel for TractModel {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn infer(&mut self, input: &PreprocessedFrame) -> Result<Vec<RawTensor>> {
        let tensor = self.build_input(input)?;
        let outputs = self
            .model
            .run(tvec!(tensor.into()))
            .context("ONNX inference failed")?;

        outputs
            .iter()
            .map(|output| {
                let view = output
                    .to_array_view::<f32>()
                    .context("model output tensor was not f32")?;
                Ok(RawTensor::new(
                    view.shape().to_vec(),
                    view.iter().copied().collect(),
                ))
            })
            .collect()
    }

    fn warm_up(&mut self) -> Result<()> {
        let (w, h) = (self.width as usize, self.height as usize);
        let blank = PreprocessedFrame {
            data: vec![0.0; 3 * w * h],
            width: self.width,
            height: self.height,
            source_width: self.width,
            source_height: self.height,
            captured_at: 0.0,
        };
        self.infer(&blank).map(|_| ())
    }
}
