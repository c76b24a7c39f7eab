use std::time::Duration;

use crate::frame::Frame;

/// Which decoded frames are run through inference.
///
/// Skipped frames are never evaluated; sampling bounds inference cost and has
/// no bearing on correctness.
#[derive(Clone, Debug, PartialEq)]
pub enum SamplingPolicy {
    /// Admit every frame.
    All,
    /// Admit the first frame and every Nth after it.
    EveryNth(u64),
    /// Admit a frame when at least this much capture time has passed since
    /// the last admitted frame.
    Interval(Duration),
}

#[derive(Debug)]
pub struct Sampler {
    policy: SamplingPolicy,
    seen: u64,
    last_admitted: Option<f64>,
}

impl Sampler {
    pub fn new(policy: SamplingPolicy) -> Self {
        Self {
            policy,
            seen: 0,
            last_admitted: None,
        }
    }

    pub fn policy(&self) -> &SamplingPolicy {
        &self.policy
    }

    pub fn admit(&mut self, frame: &Frame) -> bool {
        let index = self.seen;
        self.seen += 1;
        let admitted = match &self.policy {
            SamplingPolicy::All => true,
            SamplingPolicy::EveryNth(n) => *n <= 1 || index % n == 0,
            SamplingPolicy::Interval(interval) => match self.last_admitted {
                None => true,
                // A clock stepping backwards restarts the interval.
                Some(last) if frame.captured_at < last => true,
                Some(last) => frame.captured_at - last >= interval.as_secs_f64(),
            },
        };
        if admitted {
            self.last_admitted = Some(frame.captured_at);
        }
        admitted
    }
}
