use std::path::PathBuf;

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::Serialize;

use crate::alert::AlertEvent;
use crate::detect::ClassLabel;

/// Human-readable alert, shared by every channel.
#[derive(Clone, Debug, Serialize)]
pub struct AlertMessage {
    pub alert_id: u64,
    pub class_label: ClassLabel,
    pub display_name: String,
    pub confidence: f32,
    pub bounding_box: [i32; 4],
    /// Capture time of the triggering frame, epoch seconds.
    pub detected_at: f64,
    pub detected_at_iso: String,
    pub title: String,
    pub body: String,
    pub image_path: Option<PathBuf>,
}

impl AlertMessage {
    /// Render with the host's local time zone.
    pub fn from_event(event: &AlertEvent) -> Self {
        Self::from_event_in(event, &Local)
    }

    pub fn from_event_in<Tz: TimeZone>(event: &AlertEvent, tz: &Tz) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        let detection = &event.detection;
        let display_name = detection.class_label.display_name().to_string();
        let utc = epoch_to_utc(detection.frame_timestamp);
        let local = utc.with_timezone(tz);

        let title = format!("Rodent Alert: {} Detected", display_name);
        let body = format!(
            "RODENT ALERT! {} detected at {} with {:.0}% confidence.",
            display_name,
            local.format("%I:%M %p"),
            detection.confidence * 100.0
        );

        Self {
            alert_id: event.id,
            class_label: detection.class_label,
            display_name,
            confidence: detection.confidence,
            bounding_box: detection.bounding_box.as_array(),
            detected_at: detection.frame_timestamp,
            detected_at_iso: local.to_rfc3339(),
            title,
            body,
            image_path: event.image_path.clone(),
        }
    }
}

fn epoch_to_utc(ts: f64) -> DateTime<Utc> {
    let secs = ts.floor() as i64;
    let nanos = ((ts - ts.floor()) * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_default()
}
