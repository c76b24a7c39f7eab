use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::detect::backend::InferenceModel;
use crate::detect::decoder::RawTensor;
use crate::frame::PreprocessedFrame;

#[derive(Deserialize)]
struct ScriptedTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Replays scripted model outputs, one entry per inferred frame.
///
/// Used for tests, demos and bench replays without an ONNX model. Once the
/// script runs out, every frame yields an empty output (no anchors).
pub struct ReplayModel {
    width: u32,
    height: u32,
    attrs: usize,
    script: VecDeque<Vec<RawTensor>>,
    frames_seen: u64,
}

impl ReplayModel {
    /// `attrs` is the per-anchor attribute count used for empty outputs.
    pub fn new(width: u32, height: u32, attrs: usize, script: Vec<Vec<RawTensor>>) -> Self {
        Self {
            width,
            height,
            attrs,
            script: script.into(),
            frames_seen: 0,
        }
    }

    /// A model that never detects anything.
    pub fn empty(width: u32, height: u32, attrs: usize) -> Self {
        Self::new(width, height, attrs, Vec::new())
    }

    /// Load a JSON script: an array (one per frame) of arrays of
    /// `{ "shape": [...], "data": [...] }` tensors.
    pub fn from_file<P: AsRef<Path>>(path: P, width: u32, height: u32, attrs: usize) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read replay script {}", path.display()))?;
        let frames: Vec<Vec<ScriptedTensor>> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse replay script {}", path.display()))?;
        let script = frames
            .into_iter()
            .map(|tensors| {
                tensors
                    .into_iter()
                    .map(|t| RawTensor::new(t.shape, t.data))
                    .collect()
            })
            .collect();
        Ok(Self::new(width, height, attrs, script))
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl InferenceModel for ReplayModel {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn infer(&mut self, _input: &PreprocessedFrame) -> Result<Vec<RawTensor>> {
        self.frames_seen += 1;
        Ok(self
            .script
            .pop_front()
            .unwrap_or_else(|| vec![RawTensor::empty(self.attrs)]))
    }
}
