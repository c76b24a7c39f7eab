use std::collections::HashMap;
use std::time::Duration;

use crate::detect::ClassLabel;

/// Per-class alert cooldown.
///
/// A class is *cooling* while `now - last_alert_time < window` and *cooled*
/// otherwise. Cooling -> cooled is purely a function of elapsed time; only
/// `try_acquire` moves a class back into cooling.
#[derive(Clone, Debug, Default)]
pub struct CooldownState {
    last_alert_time: HashMap<ClassLabel, f64>,
}

impl CooldownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cooling(&self, class: ClassLabel, now: f64, window: Duration) -> bool {
        self.remaining(class, now, window) > 0.0
    }

    /// Check-and-set: if `class` is cooled, record `now` as its last alert
    /// time and return `true`.
    pub fn try_acquire(&mut self, class: ClassLabel, now: f64, window: Duration) -> bool {
        if self.is_cooling(class, now, window) {
            return false;
        }
        self.last_alert_time.insert(class, now);
        true
    }

    /// Seconds until `class` cools down (0 when already cooled).
    pub fn remaining(&self, class: ClassLabel, now: f64, window: Duration) -> f64 {
        match self.last_alert_time.get(&class) {
            // A clock stepping backwards does not extend the window.
            Some(last) => (window.as_secs_f64() - (now - last).max(0.0)).max(0.0),
            None => 0.0,
        }
    }

    pub fn last_alert_time(&self, class: ClassLabel) -> Option<f64> {
        self.last_alert_time.get(&class).copied()
    }

    /// Seed a last-alert time, keeping the later of the existing and new value.
    pub fn seed(&mut self, class: ClassLabel, at: f64) {
        let entry = self.last_alert_time.entry(class).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    pub fn classes(&self) -> impl Iterator<Item = ClassLabel> + '_ {
        self.last_alert_time.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEN_MIN: Duration = Duration::from_secs(600);

    #[test]
    fn acquire_then_cooling_until_window_elapses() {
        let mut state = CooldownState::new();
        assert!(state.try_acquire(ClassLabel::NorwayRat, 0.0, TEN_MIN));
        assert!(!state.try_acquire(ClassLabel::NorwayRat, 599.9, TEN_MIN));
        assert_eq!(state.remaining(ClassLabel::NorwayRat, 300.0, TEN_MIN), 300.0);
        assert!(state.try_acquire(ClassLabel::NorwayRat, 600.0, TEN_MIN));
        assert_eq!(state.last_alert_time(ClassLabel::NorwayRat), Some(600.0));
    }

    #[test]
    fn classes_cool_independently() {
        let mut state = CooldownState::new();
        assert!(state.try_acquire(ClassLabel::NorwayRat, 0.0, TEN_MIN));
        assert!(state.try_acquire(ClassLabel::Mouse, 1.0, TEN_MIN));
        assert!(!state.is_cooling(ClassLabel::RoofRat, 1.0, TEN_MIN));
    }

    #[test]
    fn zero_window_never_cools() {
        let mut state = CooldownState::new();
        assert!(state.try_acquire(ClassLabel::Mouse, 5.0, Duration::ZERO));
        assert!(state.try_acquire(ClassLabel::Mouse, 5.0, Duration::ZERO));
    }

    #[test]
    fn seed_keeps_latest() {
        let mut state = CooldownState::new();
        state.seed(ClassLabel::RoofRat, 100.0);
        state.seed(ClassLabel::RoofRat, 50.0);
        assert_eq!(state.last_alert_time(ClassLabel::RoofRat), Some(100.0));
    }
}
