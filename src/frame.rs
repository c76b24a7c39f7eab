//! Frame types that flow from ingestion through detection.
//!
//! - `Frame`: decoded RGB image plus capture metadata, produced by a source.
//! - `PreprocessedFrame`: model-ready CHW float tensor derived from a `Frame`.
//!
//! Frames are consumed by the pipeline in order and dropped after detection;
//! only annotated snapshots of frames with detections ever reach disk.

use image::RgbImage;

/// One decoded image from a video source.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Capture time, epoch seconds. Monotonic non-decreasing within a source.
    pub captured_at: f64,
    /// Position in the source stream, counting every decoded frame (sampled or not).
    pub sequence: u64,
    /// Where the frame came from (stream URL or file path), for logs.
    pub origin: String,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: f64, sequence: u64, origin: impl Into<String>) -> Self {
        Self {
            image,
            captured_at,
            sequence,
            origin: origin.into(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

/// Model-ready input: `[1, 3, H, W]` float tensor in `[0, 1]`.
#[derive(Clone, Debug)]
pub struct PreprocessedFrame {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
    /// Dimensions of the frame the tensor was derived from.
    pub source_width: u32,
    pub source_height: u32,
    pub captured_at: f64,
}

impl PreprocessedFrame {
    pub fn shape(&self) -> [usize; 4] {
        [1, 3, self.height as usize, self.width as usize]
    }
}

/// A frame admitted by the sampling policy, paired with its model input.
///
/// The original frame is kept for box rescaling and snapshot annotation.
#[derive(Clone, Debug)]
pub struct SampledFrame {
    pub frame: Frame,
    pub input: PreprocessedFrame,
}

impl SampledFrame {
    pub fn captured_at(&self) -> f64 {
        self.frame.captured_at
    }
}
