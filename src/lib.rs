//! Rodent Sentry
//!
//! Camera rodent-detection daemon. Frames flow through a fixed chain:
//!
//! 1. `ingest`: a `FrameSource` (RTSP, video file, snapshot directory) wrapped
//!    in a `FramePipeline` that samples, preprocesses and reconnects.
//! 2. `detect`: an `InferenceModel` produces raw tensors; the decoder turns
//!    them into thresholded, NMS-filtered `Detection`s.
//! 3. `alert`: the `AlertCoordinator` applies per-class cooldown and queues
//!    `AlertEvent`s.
//! 4. `notify`: the dispatch loop fans each alert out to the enabled channels.
//! 5. `storage`: every detection and every delivery attempt is persisted.
//!
//! `runtime::Sentry` wires these together; `rodentd` is the daemon binary.

pub mod alert;
pub mod clock;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod runtime;
pub mod shutdown;
pub mod snapshot;
pub mod storage;

pub use alert::{AlertCoordinator, AlertEvent, AlertStatistics, DeliveryState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SentryConfig;
pub use detect::{BoundingBox, ClassLabel, Detection, DetectionDecoder, RawTensor};
pub use frame::{Frame, PreprocessedFrame, SampledFrame};
pub use ingest::{FramePipeline, FrameSource};
pub use notify::{NotificationChannel, NotificationDispatcher};
pub use runtime::Sentry;
pub use shutdown::Shutdown;
pub use storage::{DetectionStore, InMemoryDetectionStore, SqliteDetectionStore};
