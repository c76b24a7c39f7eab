//! Orchestrator: wires source, detector, coordinator, dispatcher and store,
//! runs the frame loop on the calling thread and the background loops on
//! their own threads.

mod loops;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};

pub use loops::{deliver_alert, dispatch_loop, drain_queue, log_health, run_maintenance, DispatchContext};

use crate::alert::{AlertCoordinator, AlertEvent};
use crate::clock::{Clock, SystemClock};
use crate::config::{BackendKind, SentryConfig};
use crate::detect::{self, Detection, DetectionDecoder, InferenceModel, ReplayModel, RodentDetector};
use crate::frame::SampledFrame;
use crate::ingest::{self, FramePipeline, Preprocessor, ReconnectBackoff, Sampler};
use crate::notify::NotificationDispatcher;
use crate::shutdown::Shutdown;
use crate::snapshot::SnapshotWriter;
use crate::storage::{DetectionStore, SqliteDetectionStore};

/// Store shared by the frame loop and the background loops.
pub type SharedStore = Arc<Mutex<Box<dyn DetectionStore>>>;

pub fn shared_store(store: Box<dyn DetectionStore>) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Run `f` with exclusive access to the store.
pub fn with_store<T>(store: &SharedStore, f: impl FnOnce(&mut dyn DetectionStore) -> Result<T>) -> Result<T> {
    let mut guard = store
        .lock()
        .map_err(|_| anyhow!("detection store lock poisoned"))?;
    f(&mut **guard)
}

/// What one frame produced.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub detections: Vec<Detection>,
    pub alerts: Vec<AlertEvent>,
    pub snapshot: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub detections: u64,
    pub alerts: u64,
}

pub struct Sentry {
    config: SentryConfig,
    detector: RodentDetector,
    coordinator: Arc<AlertCoordinator>,
    dispatcher: Arc<NotificationDispatcher>,
    store: SharedStore,
    snapshots: Option<SnapshotWriter>,
    shutdown: Shutdown,
}

impl Sentry {
    /// Build every component from configuration. Fails on configuration
    /// errors such as missing channel credentials or an unusable model.
    pub fn from_config(config: SentryConfig, shutdown: Shutdown) -> Result<Self> {
        let decoder = DetectionDecoder::new(config.detection.decoder_config(&config.video))?;
        let model = build_model(&config, &decoder)?;
        let detector = RodentDetector::new(model, decoder)?;
        let dispatcher = NotificationDispatcher::from_config(&config.alerts, &config.notifications)?;
        let db_path = config.storage.database_path.to_string_lossy().into_owned();
        let store: Box<dyn DetectionStore> = Box::new(SqliteDetectionStore::open(&db_path)?);
        let snapshots = SnapshotWriter::new(config.storage.images_path.clone())?;
        Self::assemble(
            config,
            detector,
            dispatcher,
            shared_store(store),
            Some(snapshots),
            Arc::new(SystemClock),
            shutdown,
        )
    }

    /// Wire pre-built components. Restores cooldowns from the store when
    /// `alerts.restore_cooldown` is set.
    pub fn assemble(
        config: SentryConfig,
        detector: RodentDetector,
        dispatcher: NotificationDispatcher,
        store: SharedStore,
        snapshots: Option<SnapshotWriter>,
        clock: Arc<dyn Clock>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let coordinator = Arc::new(AlertCoordinator::new(config.alerts.cooldown_window(), clock));
        if config.alerts.restore_cooldown {
            let last = with_store(&store, |s| s.last_alert_times())?;
            coordinator.restore_cooldowns(&last)?;
        }
        Ok(Self {
            config,
            detector,
            coordinator,
            dispatcher: Arc::new(dispatcher),
            store,
            snapshots,
            shutdown,
        })
    }

    pub fn coordinator(&self) -> &Arc<AlertCoordinator> {
        &self.coordinator
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Open the configured camera as a sampled, preprocessed frame stream.
    pub fn open_pipeline(&self) -> Result<FramePipeline> {
        let source = ingest::open_source(&self.config.camera)?;
        let video = &self.config.video;
        let system = &self.config.system;
        Ok(FramePipeline::new(
            source,
            Sampler::new(video.sampling_policy()),
            Preprocessor::new(video.input_width, video.input_height, video.channel_order),
            ReconnectBackoff::new(system.reconnect_initial, system.reconnect_max),
            self.shutdown.clone(),
        ))
    }

    pub fn dispatch_context(&self) -> DispatchContext {
        DispatchContext {
            coordinator: Arc::clone(&self.coordinator),
            dispatcher: Arc::clone(&self.dispatcher),
            store: Arc::clone(&self.store),
            shutdown: self.shutdown.clone(),
            max_attempts: self.config.alerts.max_delivery_attempts,
            retry_backoff: self.config.alerts.retry_backoff,
            drain_on_shutdown: self.config.alerts.drain_on_shutdown,
        }
    }

    /// Detect, snapshot, persist, then hand each detection to the coordinator.
    ///
    /// Storage and snapshot failures are logged and do not stop alerting.
    pub fn process_frame(&mut self, sampled: &SampledFrame) -> Result<FrameOutcome> {
        let detections = self.detector.detect(sampled)?;
        if detections.is_empty() {
            return Ok(FrameOutcome::default());
        }

        for d in &detections {
            log::info!(
                "detected {} ({:.0}%) at {:?}",
                d.class_label.display_name(),
                d.confidence * 100.0,
                d.bounding_box.as_array()
            );
        }

        let snapshot = match &self.snapshots {
            Some(writer) => match writer.write(&sampled.frame, &detections) {
                Ok(path) => Some(path),
                Err(err) => {
                    log::warn!("snapshot failed: {:#}", err);
                    None
                }
            },
            None => None,
        };

        let mut alerts = Vec::new();
        for detection in &detections {
            let record_id = match with_store(&self.store, |s| {
                s.save_detection(detection, snapshot.as_deref(), false)
            }) {
                Ok(id) => Some(id),
                Err(err) => {
                    log::warn!("failed to persist detection: {:#}", err);
                    None
                }
            };
            if let Some(event) = self
                .coordinator
                .process_detection(detection, snapshot.clone(), record_id)?
            {
                alerts.push(event);
            }
        }

        Ok(FrameOutcome {
            detections,
            alerts,
            snapshot,
        })
    }

    /// Run until the frame stream ends, shutdown is requested, or a
    /// configuration fault surfaces from the decoder.
    pub fn run<I>(&mut self, frames: I, pipeline_stats: Arc<Mutex<ingest::PipelineStats>>) -> Result<RunSummary>
    where
        I: IntoIterator<Item = SampledFrame>,
    {
        if let Err(err) = self.detector.warm_up() {
            log::warn!("model warm-up failed: {:#}", err);
        }
        log::info!(
            "rodent-sentry running: model={} cooldown={:?} channels={:?} db={}",
            self.detector.model_name(),
            self.config.alerts.cooldown_window(),
            self.dispatcher.active_channels(),
            self.config.storage.database_path.display()
        );

        let workers = self.spawn_loops(pipeline_stats)?;
        let mut summary = RunSummary::default();
        let mut fatal = None;

        for sampled in frames {
            if self.shutdown.is_triggered() {
                break;
            }
            match self.process_frame(&sampled) {
                Ok(outcome) => {
                    summary.frames_processed += 1;
                    summary.detections += outcome.detections.len() as u64;
                    summary.alerts += outcome.alerts.len() as u64;
                }
                Err(err) if detect::is_fatal(&err) => {
                    log::error!("detector configuration error, stopping: {:#}", err);
                    fatal = Some(err);
                    break;
                }
                Err(err) => {
                    summary.frames_failed += 1;
                    log::warn!("frame {} skipped: {:#}", sampled.frame.sequence, err);
                }
            }
        }

        self.shutdown.trigger();
        for worker in workers {
            if worker.join().is_err() {
                log::error!("background loop panicked");
            }
        }
        // A frame in flight when shutdown fired may have queued an alert
        // after the dispatch loop's own drain.
        let late = loops::drain_queue(&self.dispatch_context());
        if late > 0 {
            log::info!("{} alert(s) queued during shutdown handled", late);
        }
        log::info!(
            "rodent-sentry stopped: {} frames, {} detections, {} alerts",
            summary.frames_processed,
            summary.detections,
            summary.alerts
        );

        match fatal {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    fn spawn_loops(&self, pipeline_stats: Arc<Mutex<ingest::PipelineStats>>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        let ctx = self.dispatch_context();
        handles.push(
            std::thread::Builder::new()
                .name("dispatch".into())
                .spawn(move || dispatch_loop(ctx))
                .context("spawn dispatch loop")?,
        );

        let coordinator = Arc::clone(&self.coordinator);
        let store = Arc::clone(&self.store);
        let retention = self.config.storage.retention_days;
        let interval = self.config.system.maintenance_interval;
        let shutdown = self.shutdown.clone();
        handles.push(
            std::thread::Builder::new()
                .name("maintenance".into())
                .spawn(move || loops::maintenance_loop(coordinator, store, retention, interval, shutdown))
                .context("spawn maintenance loop")?,
        );

        let coordinator = Arc::clone(&self.coordinator);
        let dispatcher = Arc::clone(&self.dispatcher);
        let store = Arc::clone(&self.store);
        let interval = self.config.system.health_check_interval;
        let shutdown = self.shutdown.clone();
        handles.push(
            std::thread::Builder::new()
                .name("health".into())
                .spawn(move || {
                    loops::health_loop(coordinator, dispatcher, store, pipeline_stats, interval, shutdown)
                })
                .context("spawn health loop")?,
        );

        Ok(handles)
    }
}

fn build_model(config: &SentryConfig, decoder: &DetectionDecoder) -> Result<Box<dyn InferenceModel>> {
    let cfg = decoder.config();
    let (w, h) = (cfg.input_width, cfg.input_height);
    // 4 box coordinates + objectness + one score per class.
    let attrs = 5 + cfg.classes.len();
    match config.detection.backend {
        BackendKind::Replay => match &config.detection.model_path {
            Some(path) => Ok(Box::new(ReplayModel::from_file(path, w, h, attrs)?)),
            None => {
                log::warn!("replay backend without a script: no detections will be produced");
                Ok(Box::new(ReplayModel::empty(w, h, attrs)))
            }
        },
        BackendKind::Tract => {
            #[cfg(feature = "backend-tract")]
            {
                let path = config
                    .detection
                    .model_path
                    .as_ref()
                    .ok_or_else(|| anyhow!("detection.model_path is required for the tract backend"))?;
                Ok(Box::new(detect::TractModel::new(path, w, h)?))
            }
            #[cfg(not(feature = "backend-tract"))]
            {
                Err(anyhow!("the tract backend requires the backend-tract feature"))
            }
        }
    }
}
