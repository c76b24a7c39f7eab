use serde::Deserialize;

use super::result::{BoundingBox, Detection};

/// Which boxes compete with each other during suppression.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NmsPolicy {
    /// Boxes only suppress boxes of the same class. Co-located detections of
    /// different species both survive.
    #[default]
    ClassAware,
    /// Any overlapping box suppresses any other.
    ClassAgnostic,
}

/// Intersection area over union area of two axis-aligned rectangles.
///
/// No overlap, or a non-positive union, yields 0.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let ix1 = a.x1().max(b.x1());
    let iy1 = a.y1().max(b.y1());
    let ix2 = a.x2().min(b.x2());
    let iy2 = a.y2().min(b.y2());

    let iw = f64::from((ix2 - ix1).max(0));
    let ih = f64::from((iy2 - iy1).max(0));
    let inter = iw * ih;
    if inter <= 0.0 {
        return 0.0;
    }
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        0.0
    } else {
        (inter / union) as f32
    }
}

/// Greedy non-maximum suppression.
///
/// Sorts by confidence (descending, stable), keeps the best remaining box and
/// drops every later box whose IoU with a kept box reaches `iou_threshold`.
/// Every kept pair therefore has IoU strictly below the threshold (or differs
/// in class under `ClassAware`).
pub fn non_max_suppression(
    mut detections: Vec<Detection>,
    iou_threshold: f32,
    policy: NmsPolicy,
    max_detections: usize,
) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::new();
    'outer: for candidate in detections {
        for k in &kept {
            if policy == NmsPolicy::ClassAware && k.class_label != candidate.class_label {
                continue;
            }
            if iou(&k.bounding_box, &candidate.bounding_box) >= iou_threshold {
                continue 'outer;
            }
        }
        kept.push(candidate);
        if kept.len() >= max_detections {
            break;
        }
    }
    kept
}
