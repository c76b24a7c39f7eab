use anyhow::Result;

use crate::frame::PreprocessedFrame;

use super::decoder::RawTensor;

/// Inference backend trait.
///
/// A backend turns a preprocessed frame into raw output tensors. Decoding,
/// thresholding and suppression happen in `DetectionDecoder`, so every backend
/// shares one interpretation of the output format.
///
/// Backends do not write to disk or make network requests.
pub trait InferenceModel: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Model input size as (width, height).
    fn input_size(&self) -> (u32, u32);

    /// Run inference on one frame.
    fn infer(&mut self, input: &PreprocessedFrame) -> Result<Vec<RawTensor>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
