use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use super::{AlertEvent, AlertStatistics, CooldownState, DeliveryState};
use crate::clock::Clock;
use crate::detect::{ClassLabel, Detection};

const DAY_SECS: f64 = 86_400.0;

struct CoordinatorState {
    cooldown: CooldownState,
    /// Delivered alerts, oldest first.
    history: Vec<AlertEvent>,
    next_id: u64,
    created: u64,
    failed: u64,
}

/// Per-class cooldown state machine plus the pending-alert queue.
///
/// All cooldown checks and updates happen under one lock, so two detections
/// of the same class racing each other can never both create an alert.
pub struct AlertCoordinator {
    cooldown_window: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<CoordinatorState>,
    queue_tx: Sender<AlertEvent>,
    queue_rx: Mutex<Receiver<AlertEvent>>,
    queued: AtomicUsize,
}

impl AlertCoordinator {
    pub fn new(cooldown_window: Duration, clock: Arc<dyn Clock>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel();
        Self {
            cooldown_window,
            clock,
            state: Mutex::new(CoordinatorState {
                cooldown: CooldownState::new(),
                history: Vec::new(),
                next_id: 1,
                created: 0,
                failed: 0,
            }),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            queued: AtomicUsize::new(0),
        }
    }

    pub fn cooldown_window(&self) -> Duration {
        self.cooldown_window
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, CoordinatorState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("alert coordinator lock poisoned"))
    }

    /// Decide whether `detection` becomes an alert.
    ///
    /// Returns `Ok(None)` while the class is cooling; that is the normal path
    /// under sustained presence and has no side effects. Otherwise the class
    /// enters cooling, a `Pending` event is queued for dispatch, and a copy is
    /// returned.
    pub fn process_detection(
        &self,
        detection: &Detection,
        image_path: Option<PathBuf>,
        record_id: Option<i64>,
    ) -> Result<Option<AlertEvent>> {
        let now = self.clock.now();
        let mut state = self.lock_state()?;
        let class = detection.class_label;

        if !state.cooldown.try_acquire(class, now, self.cooldown_window) {
            log::debug!(
                "cooldown active for {} ({:.0}s remaining), not alerting",
                class,
                state.cooldown.remaining(class, now, self.cooldown_window)
            );
            return Ok(None);
        }

        let event = AlertEvent {
            id: state.next_id,
            detection: detection.clone(),
            record_id,
            image_path,
            created_at: now,
            delivery_state: DeliveryState::Pending,
            sent_at: None,
            attempts: 0,
            channel_results: BTreeMap::new(),
        };
        state.next_id += 1;
        state.created += 1;

        // Enqueue under the lock so queue order matches creation order.
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.queue_tx.send(event.clone()).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            bail!("pending alert queue is closed");
        }
        log::info!(
            "alert #{} queued: {} ({:.0}% confidence)",
            event.id,
            class.display_name(),
            detection.confidence * 100.0
        );
        Ok(Some(event))
    }

    /// Wait up to `timeout` for the next pending alert.
    pub fn next_pending(&self, timeout: Duration) -> Result<Option<AlertEvent>> {
        let rx = self
            .queue_rx
            .lock()
            .map_err(|_| anyhow!("pending alert queue lock poisoned"))?;
        match rx.recv_timeout(timeout) {
            Ok(event) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(event))
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    /// Take every queued alert without waiting.
    pub fn drain_pending(&self) -> Result<Vec<AlertEvent>> {
        let rx = self
            .queue_rx
            .lock()
            .map_err(|_| anyhow!("pending alert queue lock poisoned"))?;
        let drained: Vec<AlertEvent> = rx.try_iter().collect();
        self.queued.fetch_sub(drained.len(), Ordering::SeqCst);
        Ok(drained)
    }

    pub fn pending_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Pending -> Sent. Records channel outcomes and appends to history.
    pub fn mark_sent(
        &self,
        mut event: AlertEvent,
        channel_results: BTreeMap<String, bool>,
    ) -> Result<AlertEvent> {
        if !event.is_pending() {
            bail!(
                "alert #{} already {:?}; delivery state changes once",
                event.id,
                event.delivery_state
            );
        }
        event.delivery_state = DeliveryState::Sent;
        event.sent_at = Some(self.clock.now());
        event.channel_results = channel_results;

        let mut state = self.lock_state()?;
        state.history.push(event.clone());
        Ok(event)
    }

    /// Pending -> Failed, after every delivery attempt failed or was abandoned.
    pub fn mark_failed(
        &self,
        mut event: AlertEvent,
        channel_results: BTreeMap<String, bool>,
    ) -> Result<AlertEvent> {
        if !event.is_pending() {
            bail!(
                "alert #{} already {:?}; delivery state changes once",
                event.id,
                event.delivery_state
            );
        }
        event.delivery_state = DeliveryState::Failed;
        event.channel_results = channel_results;

        let mut state = self.lock_state()?;
        state.failed += 1;
        Ok(event)
    }

    pub fn statistics(&self) -> Result<AlertStatistics> {
        let now = self.clock.now();
        let state = self.lock_state()?;

        let mut alerts_by_class = BTreeMap::new();
        for event in &state.history {
            *alerts_by_class
                .entry(event.detection.class_label.to_string())
                .or_insert(0) += 1;
        }
        let alerts_last_24h = state
            .history
            .iter()
            .filter(|e| e.created_at >= now - DAY_SECS)
            .count();
        let cooldown_status = state
            .cooldown
            .classes()
            .map(|class| {
                (
                    class.to_string(),
                    state.cooldown.remaining(class, now, self.cooldown_window),
                )
            })
            .collect();

        Ok(AlertStatistics {
            total_alerts: state.history.len(),
            alerts_by_class,
            alerts_last_24h,
            cooldown_status,
            alerts_created: state.created,
            alerts_failed: state.failed,
            pending: self.pending_count(),
        })
    }

    /// Drop history entries created more than `retention_days` ago. Cooldown
    /// state is untouched.
    pub fn cleanup_old_alerts(&self, retention_days: u32) -> Result<usize> {
        let cutoff = self.clock.now() - f64::from(retention_days) * DAY_SECS;
        let mut state = self.lock_state()?;
        let before = state.history.len();
        state.history.retain(|e| e.created_at >= cutoff);
        Ok(before - state.history.len())
    }

    /// Seed cooldowns from previously persisted alert times.
    pub fn restore_cooldowns(&self, last_alerts: &HashMap<ClassLabel, f64>) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.lock_state()?;
        for (class, at) in last_alerts {
            state.cooldown.seed(*class, *at);
            let remaining = state.cooldown.remaining(*class, now, self.cooldown_window);
            if remaining > 0.0 {
                log::info!(
                    "restored cooldown for {}: {:.0}s remaining",
                    class,
                    remaining
                );
            }
        }
        Ok(())
    }

    pub fn cooldown_remaining(&self, class: ClassLabel) -> Result<f64> {
        let now = self.clock.now();
        let state = self.lock_state()?;
        Ok(state.cooldown.remaining(class, now, self.cooldown_window))
    }

    pub fn history(&self) -> Result<Vec<AlertEvent>> {
        Ok(self.lock_state()?.history.clone())
    }
}
