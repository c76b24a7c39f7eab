mod backend;
mod backends;
mod decoder;
mod nms;
mod result;

use anyhow::{anyhow, Result};

use crate::frame::SampledFrame;

pub use backend::InferenceModel;
pub use backends::ReplayModel;
#[cfg(feature = "backend-tract")]
pub use backends::TractModel;
pub use decoder::{
    sigmoid, Activation, DecodeError, DecoderConfig, DetectionDecoder, RawTensor, TensorLayout,
};
pub use nms::{iou, non_max_suppression, NmsPolicy};
pub use result::{BoundingBox, ClassLabel, Detection};

/// Infer and decode in one call.
///
/// `DecodeError`s surface unchanged inside the returned `anyhow::Error` so the
/// caller can tell configuration faults (fatal) from per-frame failures.
pub struct RodentDetector {
    model: Box<dyn InferenceModel>,
    decoder: DetectionDecoder,
}

impl RodentDetector {
    pub fn new(model: Box<dyn InferenceModel>, decoder: DetectionDecoder) -> Result<Self> {
        let cfg = decoder.config();
        let (w, h) = model.input_size();
        if (w, h) != (cfg.input_width, cfg.input_height) {
            return Err(anyhow!(
                "model '{}' expects {}x{} input but decoder is configured for {}x{}",
                model.name(),
                w,
                h,
                cfg.input_width,
                cfg.input_height
            ));
        }
        Ok(Self { model, decoder })
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    pub fn warm_up(&mut self) -> Result<()> {
        self.model.warm_up()
    }

    pub fn decoder(&self) -> &DetectionDecoder {
        &self.decoder
    }

    /// Run detection on one sampled frame. Detections carry the frame's
    /// capture time and original-frame coordinates.
    pub fn detect(&mut self, sampled: &SampledFrame) -> Result<Vec<Detection>> {
        let outputs = self.model.infer(&sampled.input)?;
        let Some(primary) = outputs.first() else {
            return Err(anyhow!("model '{}' produced no outputs", self.model.name()));
        };
        let frame = &sampled.frame;
        let detections =
            self.decoder
                .decode(primary, frame.width(), frame.height(), frame.captured_at)?;
        Ok(detections)
    }
}

/// True when `err` is a decoder configuration fault rather than a transient
/// per-frame failure.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<DecodeError>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::ingest::{ChannelOrder, Preprocessor};
    use image::RgbImage;

    fn frame(w: u32, h: u32) -> SampledFrame {
        let frame = Frame::new(RgbImage::new(w, h), 42.0, 0, "test");
        let input = Preprocessor::new(640, 640, ChannelOrder::Rgb).preprocess(&frame);
        SampledFrame { frame, input }
    }

    #[test]
    fn detects_and_rescales_to_frame_size() -> Result<()> {
        let tensor =
            RawTensor::from_anchor_rows(&[vec![320.0, 320.0, 100.0, 80.0, 0.9, 0.8, 0.1]]);
        let model = ReplayModel::new(640, 640, 7, vec![vec![tensor]]);
        let decoder = DetectionDecoder::new(DecoderConfig {
            layout: TensorLayout::AnchorsFirst,
            ..DecoderConfig::default()
        })?;
        let mut detector = RodentDetector::new(Box::new(model), decoder)?;

        let dets = detector.detect(&frame(1280, 1280))?;
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bounding_box.as_array(), [540, 560, 740, 720]);
        assert_eq!(dets[0].frame_timestamp, 42.0);

        assert!(detector.detect(&frame(1280, 1280))?.is_empty());
        Ok(())
    }

    #[test]
    fn decode_errors_are_fatal() -> Result<()> {
        let bad = RawTensor::new(vec![1, 1, 9], vec![0.0; 9]);
        let model = ReplayModel::new(640, 640, 7, vec![vec![bad]]);
        let decoder = DetectionDecoder::new(DecoderConfig {
            layout: TensorLayout::AnchorsFirst,
            ..DecoderConfig::default()
        })?;
        let mut detector = RodentDetector::new(Box::new(model), decoder)?;
        let err = detector.detect(&frame(64, 64)).unwrap_err();
        assert!(is_fatal(&err));
        assert!(!is_fatal(&anyhow!("camera hiccup")));
        Ok(())
    }

    #[test]
    fn rejects_mismatched_input_size() -> Result<()> {
        let model = ReplayModel::empty(320, 320, 7);
        let decoder = DetectionDecoder::new(DecoderConfig::default())?;
        assert!(RodentDetector::new(Box::new(model), decoder).is_err());
        Ok(())
    }
}
