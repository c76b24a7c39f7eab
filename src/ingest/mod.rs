//! Frame ingestion sources.
//!
//! This module provides different sources of decoded frames:
//! - RTSP streams (IP cameras; feature: rtsp-gstreamer)
//! - Local video files (feature: ingest-file-ffmpeg)
//! - Directory polling (SD card / snapshot folders)
//! - `stub://` synthetic sources (testing, demos)
//!
//! Sources produce `Frame`s; `FramePipeline` adds sampling, preprocessing and
//! reconnect handling on top of any source.

pub mod directory;
pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod pipeline;
pub mod preprocess;
pub mod rtsp;
pub mod sampling;

use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::config::{CameraConfig, SourceKind};
use crate::frame::Frame;

pub use directory::{DirectoryConfig, DirectorySource};
pub use file::{FileConfig, FileSource};
pub use pipeline::{FramePipeline, PipelineStats, ReconnectBackoff};
pub use preprocess::{ChannelOrder, Preprocessor};
pub use rtsp::{redact_url, RtspConfig, RtspSource};
pub use sampling::{Sampler, SamplingPolicy};

/// Outcome of one `FrameSource::next_frame` call.
#[derive(Debug)]
pub enum SourceEvent {
    Frame(Frame),
    /// Nothing available yet; poll again after the given delay.
    Idle(Duration),
    /// A finite source has been fully consumed.
    Ended,
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub origin: String,
}

/// A source of frames in capture order.
///
/// Errors from `next_frame` are treated as a lost connection: the pipeline
/// calls `connect` again after a backoff.
pub trait FrameSource {
    fn connect(&mut self) -> Result<()>;
    fn next_frame(&mut self) -> Result<SourceEvent>;
    fn is_healthy(&self) -> bool;
    fn stats(&self) -> SourceStats;
}

/// Build the configured camera source.
pub fn open_source(camera: &CameraConfig) -> Result<Box<dyn FrameSource>> {
    match camera.source {
        SourceKind::Rtsp => Ok(Box::new(RtspSource::new(RtspConfig {
            url: camera.url.clone(),
            ..RtspConfig::default()
        })?)),
        SourceKind::File => {
            let path = camera
                .path
                .as_ref()
                .ok_or_else(|| anyhow!("camera.path is required for the file source"))?;
            Ok(Box::new(FileSource::new(FileConfig {
                path: path.display().to_string(),
                ..FileConfig::default()
            })?))
        }
        SourceKind::Directory => {
            let path = camera
                .path
                .clone()
                .ok_or_else(|| anyhow!("camera.path is required for the directory source"))?;
            Ok(Box::new(DirectorySource::new(DirectoryConfig {
                path,
                poll_interval: Duration::from_secs(camera.poll_interval_secs.max(1)),
            })))
        }
    }
}
