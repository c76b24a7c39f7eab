//! FFmpeg decoding for `FileSource`: demux the best video stream, decode,
//! and convert each picture to packed RGB.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use image::RgbImage;

pub(crate) struct FfmpegClip {
    input: ffmpeg::format::context::Input,
    stream: usize,
    decoder: ffmpeg::codec::decoder::Video,
    to_rgb: ffmpeg::software::scaling::Context,
    declared_fps: Option<f64>,
    flushed: bool,
}

impl FfmpegClip {
    pub(crate) fn open(path: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path).with_context(|| format!("open {}", path))?;
        let video = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video stream", path))?;
        let stream = video.index();
        let rate = f64::from(video.avg_frame_rate());
        let declared_fps = (rate.is_finite() && rate > 0.0).then_some(rate);

        let decoder = ffmpeg::codec::context::Context::from_parameters(video.parameters())
            .context("read decoder parameters")?
            .decoder()
            .video()
            .context("open video decoder")?;
        let to_rgb = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .context("create RGB converter")?;

        Ok(Self {
            input,
            stream,
            decoder,
            to_rgb,
            declared_fps,
            flushed: false,
        })
    }

    pub(crate) fn declared_fps(&self) -> Option<f64> {
        self.declared_fps
    }

    /// Next decoded picture, or `None` once the decoder is drained.
    pub(crate) fn next_image(&mut self) -> Result<Option<RgbImage>> {
        let mut picture = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut picture).is_ok() {
                return self.convert(&picture).map(Some);
            }
            if self.flushed {
                return Ok(None);
            }
            match self.next_packet() {
                Some(packet) => self
                    .decoder
                    .send_packet(&packet)
                    .context("decode packet")?,
                None => {
                    self.decoder.send_eof().context("flush decoder")?;
                    self.flushed = true;
                }
            }
        }
    }

    fn next_packet(&mut self) -> Option<ffmpeg::Packet> {
        let stream = self.stream;
        self.input
            .packets()
            .find(|(s, _)| s.index() == stream)
            .map(|(_, packet)| packet)
    }

    fn convert(&mut self, picture: &ffmpeg::frame::Video) -> Result<RgbImage> {
        let mut rgb = ffmpeg::frame::Video::empty();
        self.to_rgb.run(picture, &mut rgb).context("convert to RGB")?;
        let (width, height) = (rgb.width(), rgb.height());
        let row_bytes = width as usize * 3;
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in rgb.data(0).chunks(rgb.stride(0)).take(height as usize) {
            pixels.extend_from_slice(row.get(..row_bytes).context("short decoded row")?);
        }
        RgbImage::from_raw(width, height, pixels).context("decoded frame is truncated")
    }
}
