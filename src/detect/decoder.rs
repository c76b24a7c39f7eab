//! Raw model output to deduplicated detections.
//!
//! The decoder is configured once per deployment (tensor layout, activation,
//! class list, thresholds) and is stateless across frames: the same tensor with
//! the same configuration always yields the same detections.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use super::nms::{non_max_suppression, NmsPolicy};
use super::result::{BoundingBox, ClassLabel, Detection};

/// Number of box parameters (cx, cy, w, h) before objectness.
const BOX_PARAMS: usize = 4;
/// Offset of the objectness channel.
const OBJECTNESS: usize = 4;
/// Offset of the first class score channel.
const FIRST_CLASS: usize = 5;

/// Configuration errors raised by the decoder. These are not retried.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("model output has rank {rank} (shape {shape:?}); expected [N, C] or [1, C, N]/[1, N, C]")]
    BadRank { rank: usize, shape: Vec<usize> },
    #[error("model output batch dimension is {0}; only batch size 1 is supported")]
    BadBatch(usize),
    #[error("model output has {found} attributes per anchor; expected {expected} (4 box + 1 objectness + {classes} class scores)")]
    AttributeMismatch {
        found: usize,
        expected: usize,
        classes: usize,
    },
    #[error("model output data length {found} does not match shape {shape:?}")]
    DataLength { found: usize, shape: Vec<usize> },
    #[error("invalid decoder configuration: {0}")]
    Config(String),
}

/// Whether score channels are raw logits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Objectness and class channels are logits; apply sigmoid.
    Sigmoid,
    /// Channels are already probabilities.
    #[default]
    None,
}

/// Axis order of the per-anchor output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// `[1, 5+K, N]` (Ultralytics-style export).
    #[default]
    ChannelsFirst,
    /// `[1, N, 5+K]`.
    AnchorsFirst,
}

/// Raw model output tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct RawTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl RawTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    /// Build a `[1, N, C]` tensor from per-anchor rows.
    pub fn from_anchor_rows(rows: &[Vec<f32>]) -> Self {
        let attrs = rows.first().map(Vec::len).unwrap_or(0);
        let data = rows.iter().flatten().copied().collect();
        Self {
            shape: vec![1, rows.len(), attrs],
            data,
        }
    }

    /// An output with zero anchors.
    pub fn empty(attrs: usize) -> Self {
        Self {
            shape: vec![1, attrs, 0],
            data: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DecoderConfig {
    /// Model input size the box coordinates are expressed in.
    pub input_width: u32,
    pub input_height: u32,
    pub confidence_threshold: f32,
    /// Per-class overrides. An override below the global threshold has no effect.
    pub class_thresholds: HashMap<ClassLabel, f32>,
    pub iou_threshold: f32,
    pub activation: Activation,
    pub layout: TensorLayout,
    pub nms_policy: NmsPolicy,
    /// Model class index -> label.
    pub classes: Vec<ClassLabel>,
    pub max_detections: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            input_width: 640,
            input_height: 640,
            confidence_threshold: 0.25,
            class_thresholds: HashMap::new(),
            iou_threshold: 0.45,
            activation: Activation::None,
            layout: TensorLayout::ChannelsFirst,
            nms_policy: NmsPolicy::ClassAware,
            classes: vec![ClassLabel::NorwayRat, ClassLabel::RoofRat],
            max_detections: 100,
        }
    }
}

/// Resolved view over a tensor: anchor count plus attribute accessor.
struct AnchorView<'a> {
    data: &'a [f32],
    anchors: usize,
    attrs: usize,
    layout: TensorLayout,
}

impl AnchorView<'_> {
    fn get(&self, anchor: usize, attr: usize) -> f32 {
        match self.layout {
            TensorLayout::AnchorsFirst => self.data[anchor * self.attrs + attr],
            TensorLayout::ChannelsFirst => self.data[attr * self.anchors + anchor],
        }
    }
}

pub struct DetectionDecoder {
    cfg: DecoderConfig,
}

impl DetectionDecoder {
    pub fn new(cfg: DecoderConfig) -> Result<Self, DecodeError> {
        if cfg.classes.is_empty() {
            return Err(DecodeError::Config("class list is empty".to_string()));
        }
        if cfg.input_width == 0 || cfg.input_height == 0 {
            return Err(DecodeError::Config("model input size must be non-zero".to_string()));
        }
        if !(cfg.confidence_threshold > 0.0 && cfg.confidence_threshold <= 1.0) {
            return Err(DecodeError::Config(format!(
                "confidence threshold {} outside (0, 1]",
                cfg.confidence_threshold
            )));
        }
        if !(cfg.iou_threshold > 0.0 && cfg.iou_threshold <= 1.0) {
            return Err(DecodeError::Config(format!(
                "IoU threshold {} outside (0, 1]",
                cfg.iou_threshold
            )));
        }
        if cfg.max_detections == 0 {
            return Err(DecodeError::Config("max_detections must be > 0".to_string()));
        }
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.cfg
    }

    /// Threshold that applies to `label` after per-class overrides.
    pub fn threshold_for(&self, label: ClassLabel) -> f32 {
        let global = self.cfg.confidence_threshold;
        self.cfg
            .class_thresholds
            .get(&label)
            .map_or(global, |t| t.max(global))
    }

    /// Decode one output tensor for a frame of `frame_width` x `frame_height`.
    ///
    /// Zero surviving anchors is an empty result, not an error. Shape problems
    /// are configuration errors.
    pub fn decode(
        &self,
        tensor: &RawTensor,
        frame_width: u32,
        frame_height: u32,
        frame_timestamp: f64,
    ) -> Result<Vec<Detection>, DecodeError> {
        let view = self.anchor_view(tensor)?;
        let binary = self.is_binary(view.attrs);

        let scale_x = frame_width as f32 / self.cfg.input_width as f32;
        let scale_y = frame_height as f32 / self.cfg.input_height as f32;
        let in_w = self.cfg.input_width as f32;
        let in_h = self.cfg.input_height as f32;

        let mut candidates = Vec::new();
        for anchor in 0..view.anchors {
            let objectness = self.activate(view.get(anchor, OBJECTNESS));
            if !(objectness > self.cfg.confidence_threshold) {
                continue;
            }

            let (class_index, class_score) = if binary {
                let positive = self.activate(view.get(anchor, FIRST_CLASS));
                let negative = 1.0 - positive;
                if negative > positive {
                    (1, negative)
                } else {
                    (0, positive)
                }
            } else {
                let mut best = (0usize, f32::NEG_INFINITY);
                for c in 0..(view.attrs - FIRST_CLASS) {
                    let score = self.activate(view.get(anchor, FIRST_CLASS + c));
                    if score > best.1 {
                        best = (c, score);
                    }
                }
                best
            };

            let class_label = self.cfg.classes[class_index];
            let confidence = objectness * class_score;
            if !(confidence >= self.threshold_for(class_label)) {
                continue;
            }

            let cx = view.get(anchor, 0);
            let cy = view.get(anchor, 1);
            let w = view.get(anchor, 2);
            let h = view.get(anchor, 3);

            let x1 = (cx - w / 2.0).clamp(0.0, in_w) * scale_x;
            let y1 = (cy - h / 2.0).clamp(0.0, in_h) * scale_y;
            let x2 = (cx + w / 2.0).clamp(0.0, in_w) * scale_x;
            let y2 = (cy + h / 2.0).clamp(0.0, in_h) * scale_y;

            let Some(bounding_box) = BoundingBox::new(
                x1.round() as i32,
                y1.round() as i32,
                x2.round() as i32,
                y2.round() as i32,
            ) else {
                continue;
            };

            candidates.push(Detection {
                class_label,
                confidence,
                bounding_box,
                frame_timestamp,
            });
        }

        Ok(non_max_suppression(
            candidates,
            self.cfg.iou_threshold,
            self.cfg.nms_policy,
            self.cfg.max_detections,
        ))
    }

    /// A single score channel with a two-label class list is a binary
    /// positive/negative model.
    fn is_binary(&self, attrs: usize) -> bool {
        attrs == FIRST_CLASS + 1 && self.cfg.classes.len() == 2
    }

    fn activate(&self, value: f32) -> f32 {
        match self.cfg.activation {
            Activation::Sigmoid => sigmoid(value),
            Activation::None => value,
        }
    }

    fn anchor_view<'a>(&self, tensor: &'a RawTensor) -> Result<AnchorView<'a>, DecodeError> {
        let shape = &tensor.shape;
        let (d0, d1) = match shape.as_slice() {
            [batch, d0, d1] => {
                if *batch != 1 {
                    return Err(DecodeError::BadBatch(*batch));
                }
                (*d0, *d1)
            }
            [d0, d1] => (*d0, *d1),
            _ => {
                return Err(DecodeError::BadRank {
                    rank: shape.len(),
                    shape: shape.clone(),
                })
            }
        };

        let classes = self.cfg.classes.len();
        let expected = BOX_PARAMS + 1 + classes;

        let valid = |attrs: usize| attrs == expected || self.is_binary(attrs);

        // No anchors, whichever axis is empty; the other must still be a
        // valid attribute count.
        if (d0 == 0 || d1 == 0) && tensor.data.is_empty() {
            let attrs = d0.max(d1);
            if !valid(attrs) {
                return Err(DecodeError::AttributeMismatch {
                    found: attrs,
                    expected,
                    classes,
                });
            }
            return Ok(AnchorView {
                data: &tensor.data,
                anchors: 0,
                attrs,
                layout: self.cfg.layout,
            });
        }

        let (attrs, anchors) = match self.cfg.layout {
            TensorLayout::ChannelsFirst => (d0, d1),
            TensorLayout::AnchorsFirst => (d1, d0),
        };
        if !valid(attrs) {
            return Err(DecodeError::AttributeMismatch {
                found: attrs,
                expected,
                classes,
            });
        }

        if tensor.data.len() != attrs * anchors {
            return Err(DecodeError::DataLength {
                found: tensor.data.len(),
                shape: shape.clone(),
            });
        }

        Ok(AnchorView {
            data: &tensor.data,
            anchors,
            attrs,
            layout: self.cfg.layout,
        })
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
