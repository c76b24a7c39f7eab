use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Species / object categories the detector can report.
///
/// The set is closed: model class indices are mapped onto these labels by the
/// `detection.classes` configuration list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassLabel {
    NorwayRat,
    RoofRat,
    Mouse,
}

impl ClassLabel {
    pub const ALL: [ClassLabel; 3] = [ClassLabel::NorwayRat, ClassLabel::RoofRat, ClassLabel::Mouse];

    /// Stable identifier used in configuration and storage.
    pub fn as_str(self) -> &'static str {
        match self {
            ClassLabel::NorwayRat => "norway_rat",
            ClassLabel::RoofRat => "roof_rat",
            ClassLabel::Mouse => "mouse",
        }
    }

    /// Human-readable name used in notification text.
    pub fn display_name(self) -> &'static str {
        match self {
            ClassLabel::NorwayRat => "Norway Rat",
            ClassLabel::RoofRat => "Roof Rat",
            ClassLabel::Mouse => "Mouse",
        }
    }

    /// Box colour for annotated snapshots (RGB).
    pub fn color(self) -> [u8; 3] {
        match self {
            ClassLabel::NorwayRat => [0, 0, 255],
            ClassLabel::RoofRat => [255, 0, 0],
            ClassLabel::Mouse => [0, 255, 0],
        }
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "norway_rat" => Ok(ClassLabel::NorwayRat),
            "roof_rat" => Ok(ClassLabel::RoofRat),
            "mouse" => Ok(ClassLabel::Mouse),
            other => Err(anyhow!("unknown class label '{}'", other)),
        }
    }
}

/// Axis-aligned box in original-frame pixel coordinates.
///
/// Construction guarantees `x2 > x1` and `y2 > y1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
}

impl BoundingBox {
    /// Returns `None` for degenerate boxes.
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Option<Self> {
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Self { x1, y1, x2, y2 })
    }

    pub fn x1(&self) -> i32 {
        self.x1
    }

    pub fn y1(&self) -> i32 {
        self.y1
    }

    pub fn x2(&self) -> i32 {
        self.x2
    }

    pub fn y2(&self) -> i32 {
        self.y2
    }

    pub fn width(&self) -> u32 {
        (self.x2 - self.x1) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y2 - self.y1) as u32
    }

    pub fn area(&self) -> f64 {
        f64::from(self.width()) * f64::from(self.height())
    }

    pub fn as_array(&self) -> [i32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        super::nms::iou(self, other)
    }
}

/// One localized, classified object instance in one frame. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_label: ClassLabel,
    /// objectness x class probability, in [0, 1].
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    /// Capture time of the source frame, epoch seconds.
    pub frame_timestamp: f64,
}
