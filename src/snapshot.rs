//! Annotated snapshots: one JPEG per frame with detections, boxes drawn in
//! the class colour.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use image::codecs::jpeg::JpegEncoder;
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::Detection;
use crate::frame::Frame;

const JPEG_QUALITY: u8 = 85;
const BOX_THICKNESS: i32 = 2;

pub struct SnapshotWriter {
    dir: PathBuf,
    counter: AtomicU64,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("create snapshot dir {}", dir.display()))?;
        Ok(Self {
            dir,
            counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Draw every detection onto a copy of the frame and write it as JPEG.
    pub fn write(&self, frame: &Frame, detections: &[Detection]) -> Result<PathBuf> {
        let mut canvas = frame.image().clone();
        let (w, h) = canvas.dimensions();
        for detection in detections {
            let bbox = detection.bounding_box;
            let color = Rgb(detection.class_label.color());
            for inset in 0..BOX_THICKNESS {
                let x = bbox.x1() + inset;
                let y = bbox.y1() + inset;
                let bw = bbox.width() as i32 - 2 * inset;
                let bh = bbox.height() as i32 - 2 * inset;
                if bw <= 0 || bh <= 0 || x >= w as i32 || y >= h as i32 {
                    break;
                }
                draw_hollow_rect_mut(&mut canvas, Rect::at(x, y).of_size(bw as u32, bh as u32), color);
            }
        }

        let path = self.dir.join(self.file_name(frame.captured_at));
        let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
            .encode_image(&canvas)
            .with_context(|| format!("encode {}", path.display()))?;
        log::debug!("snapshot written to {}", path.display());
        Ok(path)
    }

    fn file_name(&self, captured_at: f64) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let stamp = Local
            .timestamp_opt(captured_at.floor() as i64, 0)
            .single()
            .map(|dt| dt.format("%Y%m%d_%H%M%S").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!("detection_{}_{:06}.jpg", stamp, seq)
    }
}
