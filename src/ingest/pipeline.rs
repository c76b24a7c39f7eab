//! Frame pipeline: source -> sampling -> preprocessing.
//!
//! `FramePipeline` is an iterator of `SampledFrame`s in capture order. It owns
//! the reconnect policy: any source error drops the connection and retries
//! with exponential backoff. The iterator ends only when shutdown is signalled
//! or a finite source (a video file) runs out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use super::preprocess::Preprocessor;
use super::sampling::Sampler;
use super::{FrameSource, SourceEvent, SourceStats};
use crate::frame::SampledFrame;
use crate::shutdown::Shutdown;

/// Exponential reconnect delay with jitter, capped at `max`.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay before the next attempt. Doubles each call until reset.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = (base.as_millis() as u64 / 10).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        (base + jitter).min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Counters shared with the health loop.
#[derive(Clone, Debug, Default)]
pub struct PipelineStats {
    pub frames_read: u64,
    pub frames_sampled: u64,
    pub reconnects: u64,
    pub source_healthy: bool,
    pub source: Option<SourceStats>,
    pub last_error: Option<String>,
}

pub struct FramePipeline {
    source: Box<dyn FrameSource>,
    sampler: Sampler,
    preprocessor: Preprocessor,
    backoff: ReconnectBackoff,
    shutdown: Shutdown,
    connected: bool,
    finished: bool,
    stats: Arc<Mutex<PipelineStats>>,
}

impl FramePipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        sampler: Sampler,
        preprocessor: Preprocessor,
        backoff: ReconnectBackoff,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            source,
            sampler,
            preprocessor,
            backoff,
            shutdown,
            connected: false,
            finished: false,
            stats: Arc::new(Mutex::new(PipelineStats::default())),
        }
    }

    pub fn stats_handle(&self) -> Arc<Mutex<PipelineStats>> {
        Arc::clone(&self.stats)
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn update_stats(&self, f: impl FnOnce(&mut PipelineStats)) {
        if let Ok(mut guard) = self.stats.lock() {
            f(&mut guard);
            guard.source_healthy = self.connected && self.source.is_healthy();
            guard.source = Some(self.source.stats());
        }
    }

    /// Wait out a backoff delay. Returns `false` when shutdown interrupted it.
    fn back_off(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        log::debug!("FramePipeline: retrying source in {:?}", delay);
        !self.shutdown.wait_timeout(delay)
    }
}

impl Iterator for FramePipeline {
    type Item = SampledFrame;

    fn next(&mut self) -> Option<SampledFrame> {
        loop {
            if self.finished || self.shutdown.is_triggered() {
                return None;
            }

            if !self.connected {
                match self.source.connect() {
                    Ok(()) => {
                        self.connected = true;
                        self.update_stats(|_| {});
                    }
                    Err(err) => {
                        log::warn!("FramePipeline: connect failed: {:#}", err);
                        self.update_stats(|s| s.last_error = Some(format!("{:#}", err)));
                        if !self.back_off() {
                            return None;
                        }
                        continue;
                    }
                }
            }

            match self.source.next_frame() {
                Ok(SourceEvent::Frame(frame)) => {
                    self.backoff.reset();
                    let admitted = self.sampler.admit(&frame);
                    self.update_stats(|s| {
                        s.frames_read += 1;
                        if admitted {
                            s.frames_sampled += 1;
                        }
                    });
                    if !admitted {
                        continue;
                    }
                    let input = self.preprocessor.preprocess(&frame);
                    return Some(SampledFrame { frame, input });
                }
                Ok(SourceEvent::Idle(wait)) => {
                    self.update_stats(|_| {});
                    if self.shutdown.wait_timeout(wait) {
                        return None;
                    }
                }
                Ok(SourceEvent::Ended) => {
                    log::info!("FramePipeline: source finished");
                    self.finished = true;
                    self.update_stats(|_| {});
                    return None;
                }
                Err(err) => {
                    log::warn!("FramePipeline: source error, reconnecting: {:#}", err);
                    self.connected = false;
                    self.update_stats(|s| {
                        s.reconnects += 1;
                        s.last_error = Some(format!("{:#}", err));
                    });
                    if !self.back_off() {
                        return None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::ingest::{ChannelOrder, SamplingPolicy};
    use anyhow::{anyhow, Result};
    use image::RgbImage;
    use std::collections::VecDeque;

    enum Step {
        Frame(f64),
        Fail,
        Idle,
        End,
    }

    struct ScriptedSource {
        steps: VecDeque<Step>,
        connects: Arc<Mutex<u32>>,
        failing_connects: u32,
        seq: u64,
    }

    impl FrameSource for ScriptedSource {
        fn connect(&mut self) -> Result<()> {
            let mut connects = self.connects.lock().unwrap();
            *connects += 1;
            if self.failing_connects > 0 {
                self.failing_connects -= 1;
                return Err(anyhow!("camera offline"));
            }
            Ok(())
        }

        fn next_frame(&mut self) -> Result<SourceEvent> {
            match self.steps.pop_front() {
                Some(Step::Frame(ts)) => {
                    let seq = self.seq;
                    self.seq += 1;
                    Ok(SourceEvent::Frame(Frame::new(RgbImage::new(8, 8), ts, seq, "scripted")))
                }
                Some(Step::Fail) => Err(anyhow!("stream dropped")),
                Some(Step::Idle) => Ok(SourceEvent::Idle(Duration::from_millis(1))),
                Some(Step::End) | None => Ok(SourceEvent::Ended),
            }
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: self.seq,
                origin: "scripted".to_string(),
            }
        }
    }

    fn pipeline(
        steps: Vec<Step>,
        failing_connects: u32,
        policy: SamplingPolicy,
        shutdown: Shutdown,
    ) -> (FramePipeline, Arc<Mutex<u32>>) {
        let connects = Arc::new(Mutex::new(0));
        let source = ScriptedSource {
            steps: steps.into(),
            connects: Arc::clone(&connects),
            failing_connects,
            seq: 0,
        };
        let pipeline = FramePipeline::new(
            Box::new(source),
            Sampler::new(policy),
            Preprocessor::new(4, 4, ChannelOrder::Rgb),
            ReconnectBackoff::new(Duration::from_millis(1), Duration::from_millis(4)),
            shutdown,
        );
        (pipeline, connects)
    }

    #[test]
    fn survives_disconnects_and_keeps_order() {
        let steps = vec![
            Step::Frame(1.0),
            Step::Fail,
            Step::Frame(2.0),
            Step::Idle,
            Step::Fail,
            Step::Frame(3.0),
            Step::End,
        ];
        let (pipeline, connects) = pipeline(steps, 2, SamplingPolicy::All, Shutdown::new());
        let stats = pipeline.stats_handle();
        let stamps: Vec<f64> = pipeline.map(|s| s.captured_at()).collect();
        assert_eq!(stamps, vec![1.0, 2.0, 3.0]);
        // Two failed connects up front, then one reconnect per stream drop.
        assert_eq!(*connects.lock().unwrap(), 5);
        let stats = stats.lock().unwrap();
        assert_eq!(stats.reconnects, 2);
        assert_eq!(stats.frames_read, 3);
    }

    #[test]
    fn sampling_skips_frames() {
        let steps = (0..10).map(|i| Step::Frame(i as f64 * 0.25)).collect();
        let (pipeline, _) = pipeline(
            steps,
            0,
            SamplingPolicy::Interval(Duration::from_secs(1)),
            Shutdown::new(),
        );
        let stats = pipeline.stats_handle();
        let stamps: Vec<f64> = pipeline.map(|s| s.captured_at()).collect();
        assert_eq!(stamps, vec![0.0, 1.0, 2.0]);
        let stats = stats.lock().unwrap();
        assert_eq!(stats.frames_read, 10);
        assert_eq!(stats.frames_sampled, 3);
    }

    #[test]
    fn shutdown_ends_the_sequence() {
        let shutdown = Shutdown::new();
        let steps = vec![Step::Frame(1.0), Step::Frame(2.0)];
        let (mut pipeline, _) = pipeline(steps, 0, SamplingPolicy::All, shutdown.clone());
        assert!(pipeline.next().is_some());
        shutdown.trigger();
        assert!(pipeline.next().is_none());
    }

    #[test]
    fn shutdown_interrupts_reconnect_backoff() {
        let shutdown = Shutdown::new();
        let connects = Arc::new(Mutex::new(0));
        let source = ScriptedSource {
            steps: VecDeque::new(),
            connects,
            failing_connects: u32::MAX,
            seq: 0,
        };
        let mut pipeline = FramePipeline::new(
            Box::new(source),
            Sampler::new(SamplingPolicy::All),
            Preprocessor::new(4, 4, ChannelOrder::Rgb),
            ReconnectBackoff::new(Duration::from_secs(60), Duration::from_secs(60)),
            shutdown.clone(),
        );
        let trigger = shutdown.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            trigger.trigger();
        });
        assert!(pipeline.next().is_none());
        handle.join().unwrap();
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = ReconnectBackoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(220));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(110));
    }
}
