//! Deterministic frame preprocessing.
//!
//! Every frame goes through the same transform: plain (non-letterboxed) resize
//! to the model input size, optional RGB->BGR swap, scaling to `[0, 1]`, and
//! HWC->CHW reordering. The decoder's independent x/y rescale undoes exactly
//! this resize.

use image::imageops::{self, FilterType};
use serde::Deserialize;

use crate::frame::{Frame, PreprocessedFrame};

/// Channel order the model was trained on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

#[derive(Clone, Copy, Debug)]
pub struct Preprocessor {
    width: u32,
    height: u32,
    channel_order: ChannelOrder,
}

impl Preprocessor {
    pub fn new(width: u32, height: u32, channel_order: ChannelOrder) -> Self {
        Self {
            width,
            height,
            channel_order,
        }
    }

    pub fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn preprocess(&self, frame: &Frame) -> PreprocessedFrame {
        let source = frame.image();
        let resized;
        let image = if source.dimensions() == (self.width, self.height) {
            source
        } else {
            resized = imageops::resize(source, self.width, self.height, FilterType::Triangle);
            &resized
        };

        let plane = (self.width as usize) * (self.height as usize);
        let mut data = vec![0.0f32; plane * 3];
        let channels = match self.channel_order {
            ChannelOrder::Rgb => [0usize, 1, 2],
            ChannelOrder::Bgr => [2usize, 1, 0],
        };
        for (idx, pixel) in image.pixels().enumerate() {
            for (out_channel, &src_channel) in channels.iter().enumerate() {
                data[out_channel * plane + idx] = f32::from(pixel.0[src_channel]) / 255.0;
            }
        }

        PreprocessedFrame {
            data,
            width: self.width,
            height: self.height,
            source_width: frame.width(),
            source_height: frame.height(),
            captured_at: frame.captured_at,
        }
    }
}
