//! Directory polling source.
//!
//! Some cameras only write motion clips and stills to an SD card or a network
//! share. This source walks a directory tree (the camera's `record/` folder
//! included) for still images and video clips, hands them out oldest-first by
//! modification time, and never hands out the same path twice. Clips are
//! decoded frame by frame with FFmpeg (feature `ingest-file-ffmpeg`); without
//! it they are logged and skipped. When nothing new is present it reports
//! `Idle` so the pipeline can sleep until the next poll.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegClip;
use super::{FrameSource, SourceEvent, SourceStats};
use crate::frame::Frame;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const CLIP_EXTENSIONS: [&str; 3] = ["mp4", "avi", "mov"];

/// Used when a clip does not declare a frame rate.
#[cfg(feature = "ingest-file-ffmpeg")]
const CLIP_FALLBACK_FPS: f64 = 15.0;

#[derive(Clone, Debug)]
pub struct DirectoryConfig {
    pub path: PathBuf,
    pub poll_interval: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Media {
    Still,
    Clip,
}

struct Pending {
    mtime: f64,
    path: PathBuf,
    media: Media,
}

/// Clip being decoded; frames are stamped from its modification time.
#[cfg(feature = "ingest-file-ffmpeg")]
struct OpenClip {
    clip: FfmpegClip,
    path: PathBuf,
    start: f64,
    fps: f64,
    frames: u64,
}

pub struct DirectorySource {
    config: DirectoryConfig,
    processed: HashSet<PathBuf>,
    queue: VecDeque<Pending>,
    #[cfg(feature = "ingest-file-ffmpeg")]
    current: Option<OpenClip>,
    frame_count: u64,
    last_scan_ok: bool,
    skipped: u64,
}

impl DirectorySource {
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            config,
            processed: HashSet::new(),
            queue: VecDeque::new(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            current: None,
            frame_count: 0,
            last_scan_ok: false,
            skipped: 0,
        }
    }

    /// Files that could not be decoded and were skipped.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn scan(&mut self) {
        if !self.config.path.is_dir() {
            if self.last_scan_ok {
                log::warn!(
                    "DirectorySource: {} is not available",
                    self.config.path.display()
                );
            }
            self.last_scan_ok = false;
            return;
        }
        self.last_scan_ok = true;

        let mut found = Vec::new();
        collect_media(&self.config.path, &mut found);
        found.retain(|p| !self.processed.contains(&p.path));
        found.sort_by(|a, b| {
            a.mtime
                .partial_cmp(&b.mtime)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        for pending in found {
            self.processed.insert(pending.path.clone());
            self.queue.push_back(pending);
        }
    }

    fn emit(&mut self, image: image::RgbImage, captured_at: f64, path: &Path) -> SourceEvent {
        let sequence = self.frame_count;
        self.frame_count += 1;
        SourceEvent::Frame(Frame::new(image, captured_at, sequence, path.display().to_string()))
    }

    #[cfg(feature = "ingest-file-ffmpeg")]
    fn open_clip(&mut self, pending: &Pending) -> Result<()> {
        let clip = FfmpegClip::open(&pending.path.display().to_string())?;
        let fps = clip.declared_fps().unwrap_or(CLIP_FALLBACK_FPS);
        log::info!(
            "DirectorySource: decoding clip {} ({:.2} fps)",
            pending.path.display(),
            fps
        );
        self.current = Some(OpenClip {
            clip,
            path: pending.path.clone(),
            start: pending.mtime,
            fps,
            frames: 0,
        });
        Ok(())
    }

    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    fn open_clip(&mut self, _pending: &Pending) -> Result<()> {
        anyhow::bail!("video clips require the ingest-file-ffmpeg feature")
    }

    /// Next frame of the open clip; closes it when exhausted or broken.
    #[cfg(feature = "ingest-file-ffmpeg")]
    fn next_clip_frame(&mut self) -> Option<SourceEvent> {
        let open = self.current.as_mut()?;
        match open.clip.next_image() {
            Ok(Some(image)) => {
                let captured_at = open.start + open.frames as f64 / open.fps;
                open.frames += 1;
                let path = open.path.clone();
                Some(self.emit(image, captured_at, &path))
            }
            Ok(None) => {
                log::info!(
                    "DirectorySource: {} finished after {} frames",
                    open.path.display(),
                    open.frames
                );
                self.current = None;
                None
            }
            Err(err) => {
                log::warn!("DirectorySource: abandoning {}: {:#}", open.path.display(), err);
                self.current = None;
                None
            }
        }
    }

    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    fn next_clip_frame(&mut self) -> Option<SourceEvent> {
        None
    }
}

impl FrameSource for DirectorySource {
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "DirectorySource: watching {} every {:?}",
            self.config.path.display(),
            self.config.poll_interval
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<SourceEvent> {
        if let Some(event) = self.next_clip_frame() {
            return Ok(event);
        }
        if self.queue.is_empty() {
            self.scan();
        }
        while let Some(pending) = self.queue.pop_front() {
            let outcome = match pending.media {
                Media::Still => {
                    load_image(&pending.path).map(|image| Some(self.emit(image, pending.mtime, &pending.path)))
                }
                Media::Clip => self.open_clip(&pending).map(|()| self.next_clip_frame()),
            };
            match outcome {
                Ok(Some(event)) => return Ok(event),
                Ok(None) => {}
                Err(err) => {
                    self.skipped += 1;
                    log::warn!("DirectorySource: skipping {}: {:#}", pending.path.display(), err);
                }
            }
        }
        Ok(SourceEvent::Idle(self.config.poll_interval))
    }

    fn is_healthy(&self) -> bool {
        self.last_scan_ok
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            origin: self.config.path.display().to_string(),
        }
    }
}

fn collect_media(dir: &Path, out: &mut Vec<Pending>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::debug!("DirectorySource: cannot read {}: {}", dir.display(), err);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            collect_media(&path, out);
            continue;
        }
        let Some(media) = media_kind(&path) else {
            continue;
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        out.push(Pending { mtime, path, media });
    }
}

fn media_kind(path: &Path) -> Option<Media> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(Media::Still)
    } else if CLIP_EXTENSIONS.contains(&ext.as_str()) {
        Some(Media::Clip)
    } else {
        None
    }
}

fn load_image(path: &Path) -> Result<image::RgbImage> {
    let image = image::open(path).with_context(|| format!("decode {}", path.display()))?;
    Ok(image.to_rgb8())
}
