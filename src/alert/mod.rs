//! Alert coordination.
//!
//! Turns a stream of detections into rate-limited alert events. Cooldown is
//! tracked per class, so a Norway rat sighting never suppresses a roof rat
//! alert. Created events are queued for the dispatch loop, which reports the
//! outcome back through `mark_sent` / `mark_failed`.

mod cooldown;
mod coordinator;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::detect::Detection;

pub use cooldown::CooldownState;
pub use coordinator::AlertCoordinator;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Sent,
    Failed,
}

/// A candidate notification triggered by one detection.
#[derive(Clone, Debug, Serialize)]
pub struct AlertEvent {
    /// Process-local sequence number.
    pub id: u64,
    pub detection: Detection,
    /// Store id of the detection record, when it was persisted.
    pub record_id: Option<i64>,
    /// Annotated snapshot of the triggering frame.
    pub image_path: Option<PathBuf>,
    pub created_at: f64,
    pub delivery_state: DeliveryState,
    /// Set only on the transition to `Sent`.
    pub sent_at: Option<f64>,
    /// Dispatch rounds made so far.
    pub attempts: u32,
    /// Outcome of the last dispatch round, by channel name.
    pub channel_results: BTreeMap<String, bool>,
}

impl AlertEvent {
    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }
}

/// Read-only view over alert history and cooldown state.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AlertStatistics {
    /// Alerts delivered on at least one channel and still in history.
    pub total_alerts: usize,
    pub alerts_by_class: BTreeMap<String, usize>,
    pub alerts_last_24h: usize,
    /// Seconds until each class may alert again.
    pub cooldown_status: BTreeMap<String, f64>,
    pub alerts_created: u64,
    pub alerts_failed: u64,
    pub pending: usize,
}
