//! Background loops: alert dispatch, retention maintenance, health logging.
//!
//! Each loop owns clones of the shared handles and exits when the shutdown
//! signal fires.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use super::{with_store, SharedStore};
use crate::alert::{AlertCoordinator, AlertEvent};
use crate::clock::epoch_now;
use crate::ingest::PipelineStats;
use crate::notify::NotificationDispatcher;
use crate::shutdown::Shutdown;
use crate::storage::AlertAttempt;

const QUEUE_POLL: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct DispatchContext {
    pub coordinator: Arc<AlertCoordinator>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub store: SharedStore,
    pub shutdown: Shutdown,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub drain_on_shutdown: bool,
}

/// Consume pending alerts until shutdown, then drain or abandon the rest.
pub fn dispatch_loop(ctx: DispatchContext) {
    log::info!(
        "dispatch loop started (channels: {:?})",
        ctx.dispatcher.active_channels()
    );
    while !ctx.shutdown.is_triggered() {
        match ctx.coordinator.next_pending(QUEUE_POLL) {
            Ok(Some(event)) => {
                if let Err(err) = deliver_alert(&ctx, event, ctx.max_attempts) {
                    log::error!("dispatch: {:#}", err);
                }
            }
            Ok(None) => {}
            Err(err) => {
                log::error!("dispatch: {:#}", err);
                break;
            }
        }
    }

    drain_queue(&ctx);
    log::info!("dispatch loop stopped");
}

/// Deliver once, or abandon, every alert still queued.
///
/// Called when the dispatch loop stops and again by the runtime once the
/// frame loop can no longer queue alerts.
pub fn drain_queue(ctx: &DispatchContext) -> usize {
    let remaining = match ctx.coordinator.drain_pending() {
        Ok(events) => events,
        Err(err) => {
            log::error!("dispatch: could not drain pending alerts: {:#}", err);
            return 0;
        }
    };
    let count = remaining.len();
    for event in remaining {
        let result = if ctx.drain_on_shutdown {
            deliver_alert(ctx, event, 1).map(|_| ())
        } else {
            log::warn!(
                "alert #{} ({}) abandoned at shutdown",
                event.id,
                event.detection.class_label
            );
            ctx.coordinator.mark_failed(event, BTreeMap::new()).map(|_| ())
        };
        if let Err(err) = result {
            log::error!("dispatch: {:#}", err);
        }
    }
    count
}

/// Attempt delivery up to `max_attempts` times with linear backoff.
///
/// The alert is marked Sent as soon as any channel succeeds, otherwise Failed
/// after the last attempt. Every attempt is recorded in the store.
pub fn deliver_alert(ctx: &DispatchContext, mut event: AlertEvent, max_attempts: u32) -> Result<AlertEvent> {
    let max_attempts = max_attempts.max(1);
    let mut last_results = BTreeMap::new();

    for attempt in 1..=max_attempts {
        event.attempts = attempt;
        let results = ctx.dispatcher.send_alert(&event);
        let delivered = results.values().any(|ok| *ok);

        let record = AlertAttempt {
            alert_id: event.id,
            record_id: event.record_id,
            class_label: event.detection.class_label,
            attempt,
            attempted_at: epoch_now(),
            channel_results: results.clone(),
        };
        if let Err(err) = with_store(&ctx.store, |store| store.record_alert_attempt(&record)) {
            log::warn!("alert #{}: failed to record attempt: {:#}", event.id, err);
        }

        if delivered {
            let succeeded = results.values().filter(|ok| **ok).count();
            let sent = ctx.coordinator.mark_sent(event, results)?;
            log::info!(
                "alert #{} sent ({}/{} channels, attempt {})",
                sent.id,
                succeeded,
                sent.channel_results.len(),
                attempt
            );
            if let Some(record_id) = sent.record_id {
                let sent_at = sent.sent_at.unwrap_or_else(epoch_now);
                if let Err(err) = with_store(&ctx.store, |store| store.mark_alert_sent(record_id, sent_at)) {
                    log::warn!("alert #{}: failed to flag record {}: {:#}", sent.id, record_id, err);
                }
            }
            return Ok(sent);
        }

        last_results = results;
        // Nothing to retry when no channel is enabled.
        if last_results.is_empty() || attempt == max_attempts {
            break;
        }
        let delay = ctx.retry_backoff * attempt;
        log::warn!(
            "alert #{}: every channel failed on attempt {}/{}, retrying in {:?}",
            event.id,
            attempt,
            max_attempts,
            delay
        );
        if ctx.shutdown.wait_timeout(delay) {
            log::warn!("alert #{}: retry interrupted by shutdown", event.id);
            break;
        }
    }

    let failed = ctx.coordinator.mark_failed(event, last_results)?;
    if failed.channel_results.is_empty() {
        log::warn!("alert #{} recorded without delivery: no channels enabled", failed.id);
    } else {
        log::error!(
            "alert #{} failed on all channels after {} attempt(s)",
            failed.id,
            failed.attempts
        );
    }
    Ok(failed)
}

/// One retention pass over the store and the in-memory history.
pub fn run_maintenance(coordinator: &AlertCoordinator, store: &SharedStore, retention_days: u32) -> Result<()> {
    let report = with_store(store, |store| store.cleanup_old_records(retention_days))?;
    let alerts = coordinator.cleanup_old_alerts(retention_days)?;
    log::info!(
        "retention cleanup: {} records, {} delivery attempts, {} snapshots, {} alerts from history",
        report.records_deleted,
        report.attempts_deleted,
        report.images_deleted,
        alerts
    );
    Ok(())
}

pub fn maintenance_loop(
    coordinator: Arc<AlertCoordinator>,
    store: SharedStore,
    retention_days: u32,
    interval: Duration,
    shutdown: Shutdown,
) {
    while !shutdown.wait_timeout(interval) {
        if let Err(err) = run_maintenance(&coordinator, &store, retention_days) {
            log::warn!("maintenance failed: {:#}", err);
        }
    }
}

pub fn log_health(
    coordinator: &AlertCoordinator,
    dispatcher: &NotificationDispatcher,
    store: &SharedStore,
    pipeline: &Mutex<PipelineStats>,
) {
    let pipeline = pipeline.lock().map(|s| s.clone()).unwrap_or_default();
    log::info!(
        "health: source_healthy={} frames_read={} sampled={} reconnects={} last_error={}",
        pipeline.source_healthy,
        pipeline.frames_read,
        pipeline.frames_sampled,
        pipeline.reconnects,
        pipeline.last_error.as_deref().unwrap_or("-")
    );

    match coordinator.statistics() {
        Ok(stats) => log::info!(
            "health: alerts sent={} failed={} pending={} last_24h={} cooldowns={:?}",
            stats.total_alerts,
            stats.alerts_failed,
            stats.pending,
            stats.alerts_last_24h,
            stats.cooldown_status
        ),
        Err(err) => log::warn!("health: alert statistics unavailable: {:#}", err),
    }

    match with_store(store, |store| store.get_detection_statistics()) {
        Ok(stats) => log::info!(
            "health: detections total={} last_24h={} by_class={:?}",
            stats.total_detections,
            stats.detections_last_24h,
            stats.detections_by_class
        ),
        Err(err) => log::warn!("health: store statistics unavailable: {:#}", err),
    }

    for (name, health) in dispatcher.health() {
        if health.consecutive_failures > 0 {
            log::warn!(
                "health: channel {} failing ({} consecutive, last error: {})",
                name,
                health.consecutive_failures,
                health.last_error.as_deref().unwrap_or("-")
            );
        } else {
            log::info!(
                "health: channel {} ok ({}/{} delivered)",
                name,
                health.successes,
                health.attempts
            );
        }
    }
}

pub fn health_loop(
    coordinator: Arc<AlertCoordinator>,
    dispatcher: Arc<NotificationDispatcher>,
    store: SharedStore,
    pipeline: Arc<Mutex<PipelineStats>>,
    interval: Duration,
    shutdown: Shutdown,
) {
    while !shutdown.wait_timeout(interval) {
        log_health(&coordinator, &dispatcher, &store, &pipeline);
    }
}
