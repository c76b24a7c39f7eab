use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use image::RgbImage;

use rodent_sentry::clock::epoch_now;
use rodent_sentry::detect::{
    DetectionDecoder, RawTensor, ReplayModel, RodentDetector, TensorLayout,
};
use rodent_sentry::ingest::{ChannelOrder, PipelineStats, Preprocessor};
use rodent_sentry::notify::AlertMessage;
use rodent_sentry::runtime::{shared_store, with_store, SharedStore};
use rodent_sentry::snapshot::SnapshotWriter;
use rodent_sentry::storage::DetectionQuery;
use rodent_sentry::{
    ClassLabel, DeliveryState, Frame, ManualClock, NotificationChannel, NotificationDispatcher,
    SampledFrame, Sentry, SentryConfig, Shutdown, SqliteDetectionStore,
};

struct RecordingChannel {
    fail: bool,
    delivered: Mutex<Vec<(u64, ClassLabel)>>,
    calls: AtomicUsize,
}

impl RecordingChannel {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail,
            delivered: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }
}

impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn deliver(&self, message: &AlertMessage) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("gateway unavailable"));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((message.alert_id, message.class_label));
        Ok(())
    }
}

// cx, cy, w, h, objectness, norway, roof
fn norway_rat() -> Vec<f32> {
    vec![320.0, 320.0, 100.0, 80.0, 0.9, 0.8, 0.1]
}

fn roof_rat() -> Vec<f32> {
    vec![200.0, 180.0, 60.0, 40.0, 0.85, 0.1, 0.9]
}

fn config(dir: &std::path::Path) -> SentryConfig {
    let mut config = SentryConfig::default();
    config.detection.layout = TensorLayout::AnchorsFirst;
    config.alerts.retry_backoff = Duration::from_millis(10);
    config.alerts.max_delivery_attempts = 2;
    config.storage.database_path = dir.join("detections.db");
    config.storage.images_path = dir.join("images");
    config
}

fn open_store(config: &SentryConfig) -> Result<SharedStore> {
    let path = config.storage.database_path.to_string_lossy().into_owned();
    Ok(shared_store(Box::new(SqliteDetectionStore::open(&path)?)))
}

fn build(
    config: SentryConfig,
    script: Vec<Vec<RawTensor>>,
    channel: Arc<RecordingChannel>,
    clock: Arc<ManualClock>,
) -> Result<Sentry> {
    let decoder = DetectionDecoder::new(config.detection.decoder_config(&config.video))?;
    let detector = RodentDetector::new(Box::new(ReplayModel::new(640, 640, 7, script)), decoder)?;
    let dispatcher = NotificationDispatcher::new(
        vec![channel as Arc<dyn NotificationChannel>],
        Duration::from_secs(2),
    );
    let store = open_store(&config)?;
    let snapshots = SnapshotWriter::new(config.storage.images_path.clone())?;
    Sentry::assemble(
        config,
        detector,
        dispatcher,
        store,
        Some(snapshots),
        clock,
        Shutdown::new(),
    )
}

fn frames(start: f64, count: u64) -> Vec<SampledFrame> {
    let preprocessor = Preprocessor::new(640, 640, ChannelOrder::Rgb);
    (0..count)
        .map(|seq| {
            let frame = Frame::new(RgbImage::new(640, 480), start + seq as f64, seq, "test");
            let input = preprocessor.preprocess(&frame);
            SampledFrame { frame, input }
        })
        .collect()
}

fn stats() -> Arc<Mutex<PipelineStats>> {
    Arc::new(Mutex::new(PipelineStats::default()))
}

#[test]
fn detections_are_persisted_and_alerts_respect_cooldown() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let now = epoch_now().floor();
    let clock = Arc::new(ManualClock::new(now));
    let channel = RecordingChannel::new(false);
    let script = vec![
        vec![RawTensor::from_anchor_rows(&[norway_rat()])],
        vec![RawTensor::from_anchor_rows(&[norway_rat()])],
        vec![RawTensor::from_anchor_rows(&[roof_rat()])],
    ];
    let mut sentry = build(config(dir.path()), script, channel.clone(), clock)?;

    let summary = sentry.run(frames(now, 3), stats())?;
    assert_eq!(summary.frames_processed, 3);
    assert_eq!(summary.detections, 3);
    // The second Norway rat falls inside the cooldown window.
    assert_eq!(summary.alerts, 2);

    let delivered = channel.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().any(|(_, c)| *c == ClassLabel::NorwayRat));
    assert!(delivered.iter().any(|(_, c)| *c == ClassLabel::RoofRat));

    let history = sentry.coordinator().history()?;
    assert_eq!(history.len(), 2);
    assert!(history
        .iter()
        .all(|e| e.delivery_state == DeliveryState::Sent && e.channel_results["recorder"]));

    let store = sentry.store();
    let records = with_store(store, |s| s.query_detections(&DetectionQuery::default()))?;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.image_path.as_ref().map_or(false, |p| p.exists())));
    assert_eq!(records.iter().filter(|r| r.alert_sent).count(), 2);

    let stats = with_store(store, |s| s.get_detection_statistics())?;
    assert_eq!(stats.total_detections, 3);
    assert_eq!(stats.detections_last_24h, 3);
    assert_eq!(stats.detections_by_class["norway_rat"], 2);
    assert_eq!(stats.detections_by_class["roof_rat"], 1);
    assert_eq!(stats.alerts_sent, 2);
    assert_eq!(stats.delivery_attempts, 2);
    assert_eq!(stats.failed_attempts, 0);
    assert_eq!(stats.channels["recorder"].successes, 2);

    let health = sentry.dispatcher().health();
    assert_eq!(health["recorder"].successes, 2);
    Ok(())
}

#[test]
fn cooldown_survives_a_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let now = epoch_now().floor();

    let first_clock = Arc::new(ManualClock::new(now));
    let script = vec![vec![RawTensor::from_anchor_rows(&[norway_rat()])]];
    let mut first = build(config(dir.path()), script, RecordingChannel::new(false), first_clock)?;
    assert_eq!(first.run(frames(now, 1), stats())?.alerts, 1);
    drop(first);

    // Two minutes later the daemon restarts against the same database.
    let second_clock = Arc::new(ManualClock::new(now + 120.0));
    let channel = RecordingChannel::new(false);
    let script = vec![
        vec![RawTensor::from_anchor_rows(&[norway_rat()])],
        vec![RawTensor::from_anchor_rows(&[roof_rat()])],
    ];
    let mut second = build(config(dir.path()), script, channel.clone(), second_clock)?;
    let remaining = second.coordinator().cooldown_remaining(ClassLabel::NorwayRat)?;
    assert!((remaining - 480.0).abs() < 1e-6, "remaining {}", remaining);

    let summary = second.run(frames(now + 120.0, 2), stats())?;
    assert_eq!(summary.detections, 2);
    assert_eq!(summary.alerts, 1);
    let delivered = channel.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].1, ClassLabel::RoofRat);

    let records = with_store(second.store(), |s| s.query_detections(&DetectionQuery::default()))?;
    assert_eq!(records.len(), 3);
    Ok(())
}

#[test]
fn undeliverable_alerts_are_marked_failed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let now = epoch_now().floor();
    let channel = RecordingChannel::new(true);
    let script = vec![vec![RawTensor::from_anchor_rows(&[norway_rat()])]];
    let mut sentry = build(
        config(dir.path()),
        script,
        channel.clone(),
        Arc::new(ManualClock::new(now)),
    )?;

    let summary = sentry.run(frames(now, 1), stats())?;
    assert_eq!(summary.alerts, 1);
    assert!(channel.calls.load(Ordering::SeqCst) >= 1);

    let alert_stats = sentry.coordinator().statistics()?;
    assert_eq!(alert_stats.alerts_created, 1);
    assert_eq!(alert_stats.alerts_failed, 1);
    assert_eq!(alert_stats.total_alerts, 0);
    assert_eq!(alert_stats.pending, 0);

    let stats = with_store(sentry.store(), |s| s.get_detection_statistics())?;
    assert_eq!(stats.total_detections, 1);
    assert_eq!(stats.alerts_sent, 0);
    assert!(stats.failed_attempts >= 1);
    assert_eq!(stats.delivery_attempts, stats.failed_attempts);
    Ok(())
}
