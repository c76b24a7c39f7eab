//! Local video file source.
//!
//! Recordings are decoded with FFmpeg (feature `ingest-file-ffmpeg`);
//! `stub://` paths play a short synthetic clip. A file ends: `next_frame`
//! returns `SourceEvent::Ended` once the last frame has been delivered.
//!
//! Capture time is the moment the file was opened plus the frame's offset in
//! the recording, so sampling intervals follow video time rather than decode
//! speed.

use anyhow::{bail, Result};
use image::{Rgb, RgbImage};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegClip;
use super::{FrameSource, SourceEvent, SourceStats};
use crate::clock::epoch_now;
use crate::frame::Frame;

/// Length of the `stub://` clip.
const STUB_CLIP_FRAMES: u64 = 300;

#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local path, or `stub://<name>`.
    pub path: String,
    /// Used when the container does not declare a frame rate.
    pub fallback_fps: f64,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            fallback_fps: 30.0,
        }
    }
}

pub struct FileSource {
    path: String,
    clip: Clip,
    fps: f64,
    opened_at: Option<f64>,
    frames_captured: u64,
    finished: bool,
}

enum Clip {
    Stub,
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegClip),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        let path = config.path.trim().to_string();
        if path.is_empty() {
            bail!("file source needs a path");
        }
        let (clip, fps) = if path.starts_with("stub://") {
            (Clip::Stub, config.fallback_fps)
        } else if path.contains("://") {
            bail!("file source only reads local paths, got '{}'", path);
        } else {
            open_ffmpeg(&path, config.fallback_fps)?
        };
        if !(fps.is_finite() && fps > 0.0) {
            bail!("file source frame rate must be positive, got {}", fps);
        }
        Ok(Self {
            path,
            clip,
            fps,
            opened_at: None,
            frames_captured: 0,
            finished: false,
        })
    }
}

fn stub_frame(index: u64) -> Option<RgbImage> {
    if index >= STUB_CLIP_FRAMES {
        return None;
    }
    let tick = index as u32;
    Some(RgbImage::from_fn(320, 240, |x, y| {
        Rgb([(x + tick) as u8, (y + tick) as u8, 96])
    }))
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_ffmpeg(path: &str, fallback_fps: f64) -> Result<(Clip, f64)> {
    let clip = FfmpegClip::open(path)?;
    let fps = clip.declared_fps().unwrap_or(fallback_fps);
    Ok((Clip::Ffmpeg(clip), fps))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_ffmpeg(_path: &str, _fallback_fps: f64) -> Result<(Clip, f64)> {
    bail!("video files require the ingest-file-ffmpeg feature")
}

impl FrameSource for FileSource {
    /// Reconnecting resumes where the file left off.
    fn connect(&mut self) -> Result<()> {
        if self.opened_at.is_none() {
            self.opened_at = Some(epoch_now());
            log::info!("opened {} ({:.2} fps)", self.path, self.fps);
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Result<SourceEvent> {
        let Some(opened_at) = self.opened_at else {
            bail!("file source {} is not open", self.path);
        };
        if self.finished {
            return Ok(SourceEvent::Ended);
        }
        let image = match &mut self.clip {
            Clip::Stub => stub_frame(self.frames_captured),
            #[cfg(feature = "ingest-file-ffmpeg")]
            Clip::Ffmpeg(clip) => clip.next_image()?,
        };
        let Some(image) = image else {
            self.finished = true;
            log::info!("{} finished after {} frames", self.path, self.frames_captured);
            return Ok(SourceEvent::Ended);
        };

        let sequence = self.frames_captured;
        self.frames_captured += 1;
        let captured_at = opened_at + sequence as f64 / self.fps;
        Ok(SourceEvent::Frame(Frame::new(
            image,
            captured_at,
            sequence,
            self.path.clone(),
        )))
    }

    fn is_healthy(&self) -> bool {
        self.opened_at.is_some()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            origin: self.path.clone(),
        }
    }
}
