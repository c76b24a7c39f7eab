use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::Serialize;

use super::{
    AlertMessage, EmailChannel, MqttChannel, NotificationChannel, PushChannel, SmsChannel,
};
use crate::alert::AlertEvent;
use crate::clock::epoch_now;
use crate::config::{AlertsConfig, NotificationsConfig};

/// Running delivery counters for one channel.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ChannelHealth {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
    pub last_success_at: Option<f64>,
}

impl ChannelHealth {
    fn record(&mut self, outcome: &std::result::Result<(), String>) {
        self.attempts += 1;
        match outcome {
            Ok(()) => {
                self.successes += 1;
                self.consecutive_failures = 0;
                self.last_success_at = Some(epoch_now());
            }
            Err(err) => {
                self.failures += 1;
                self.consecutive_failures += 1;
                self.last_error = Some(err.clone());
            }
        }
    }
}

/// Fans one alert out to every enabled channel.
///
/// Channels run on their own threads. A channel that errors, panics or
/// overruns the timeout is reported as `false` without affecting the others.
pub struct NotificationDispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
    timeout: Duration,
    health: Arc<Mutex<BTreeMap<String, ChannelHealth>>>,
}

impl NotificationDispatcher {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>, timeout: Duration) -> Self {
        let health = channels
            .iter()
            .map(|c| (c.name().to_string(), ChannelHealth::default()))
            .collect();
        Self {
            channels,
            timeout,
            health: Arc::new(Mutex::new(health)),
        }
    }

    /// Build the channels named in `alerts.enabled_channels`. An enabled
    /// channel without a usable configuration section is an error.
    pub fn from_config(alerts: &AlertsConfig, notifications: &NotificationsConfig) -> Result<Self> {
        let timeout = alerts.channel_timeout;
        let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
        for name in &alerts.enabled_channels {
            let channel: Arc<dyn NotificationChannel> = match name.as_str() {
                "sms" => Arc::new(SmsChannel::new(
                    notifications
                        .sms
                        .as_ref()
                        .ok_or_else(|| missing_section("sms"))?,
                    timeout,
                )?),
                "email" => Arc::new(EmailChannel::new(
                    notifications
                        .email
                        .as_ref()
                        .ok_or_else(|| missing_section("email"))?,
                    timeout,
                )?),
                "push" => Arc::new(PushChannel::new(
                    notifications
                        .push
                        .as_ref()
                        .ok_or_else(|| missing_section("push"))?,
                    timeout,
                )?),
                "mqtt" => Arc::new(MqttChannel::new(
                    notifications
                        .mqtt
                        .as_ref()
                        .ok_or_else(|| missing_section("mqtt"))?,
                    timeout,
                )?),
                other => return Err(anyhow!("unknown notification channel '{}'", other)),
            };
            channels.push(channel);
        }
        if channels.is_empty() {
            log::warn!("no notification channels enabled; alerts will only be recorded");
        }
        Ok(Self::new(channels, timeout))
    }

    pub fn active_channels(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Snapshot of per-channel counters.
    pub fn health(&self) -> BTreeMap<String, ChannelHealth> {
        match self.health.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Deliver `event` on every channel and report per-channel success.
    ///
    /// Returns once every channel has answered or the timeout has elapsed,
    /// whichever comes first. With no channels the map is empty.
    pub fn send_alert(&self, event: &AlertEvent) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        if self.channels.is_empty() {
            return results;
        }

        let message = Arc::new(AlertMessage::from_event(event));
        let (tx, rx) = mpsc::channel::<(&'static str, std::result::Result<(), String>)>();
        for channel in &self.channels {
            let channel = Arc::clone(channel);
            let message = Arc::clone(&message);
            let tx = tx.clone();
            std::thread::spawn(move || {
                let name = channel.name();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| channel.deliver(&message)));
                let outcome = match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(format!("{:#}", err)),
                    Err(_) => Err("channel panicked".to_string()),
                };
                // Receiver is gone when the dispatcher already gave up on us.
                let _ = tx.send((name, outcome));
            });
        }
        drop(tx);

        let mut outcomes: BTreeMap<&'static str, std::result::Result<(), String>> = BTreeMap::new();
        let deadline = Instant::now() + self.timeout;
        while outcomes.len() < self.channels.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((name, outcome)) => {
                    outcomes.insert(name, outcome);
                }
                Err(_) => break,
            }
        }
        for channel in &self.channels {
            outcomes
                .entry(channel.name())
                .or_insert_with(|| Err(format!("timed out after {:?}", self.timeout)));
        }

        let mut health = match self.health.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (name, outcome) in &outcomes {
            match outcome {
                Ok(()) => log::debug!("alert {} delivered via {}", event.id, name),
                Err(err) => log::warn!("alert {}: {} delivery failed: {}", event.id, name, err),
            }
            health.entry(name.to_string()).or_default().record(outcome);
            results.insert(name.to_string(), outcome.is_ok());
        }
        results
    }
}

fn missing_section(channel: &str) -> anyhow::Error {
    anyhow!(
        "channel '{}' is enabled but notifications.{} is not configured",
        channel,
        channel
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::sample_event;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        ok: bool,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, ok: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                ok,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl NotificationChannel for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn deliver(&self, _message: &AlertMessage) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.ok {
                Ok(())
            } else {
                Err(anyhow!("{} is down", self.name))
            }
        }
    }

    struct Slow(&'static str);

    impl NotificationChannel for Slow {
        fn name(&self) -> &'static str {
            self.0
        }

        fn deliver(&self, _message: &AlertMessage) -> Result<()> {
            std::thread::sleep(Duration::from_secs(3));
            Ok(())
        }
    }

    struct Panics;

    impl NotificationChannel for Panics {
        fn name(&self) -> &'static str {
            "push"
        }

        fn deliver(&self, _message: &AlertMessage) -> Result<()> {
            panic!("boom");
        }
    }

    #[test]
    fn failure_on_one_channel_does_not_block_others() {
        let sms = Fixed::new("sms", false);
        let email = Fixed::new("email", true);
        let dispatcher = NotificationDispatcher::new(
            vec![sms.clone() as Arc<dyn NotificationChannel>, email.clone()],
            Duration::from_secs(2),
        );

        let results = dispatcher.send_alert(&sample_event());
        assert_eq!(results.get("sms"), Some(&false));
        assert_eq!(results.get("email"), Some(&true));
        assert_eq!(sms.calls.load(Ordering::SeqCst), 1);
        assert_eq!(email.calls.load(Ordering::SeqCst), 1);

        let health = dispatcher.health();
        assert_eq!(health["sms"].consecutive_failures, 1);
        assert_eq!(health["sms"].last_error.as_deref(), Some("sms is down"));
        assert_eq!(health["email"].successes, 1);
        assert!(health["email"].last_success_at.is_some());
    }

    #[test]
    fn slow_channels_time_out_without_stalling_the_rest() {
        let dispatcher = NotificationDispatcher::new(
            vec![
                Arc::new(Slow("sms")) as Arc<dyn NotificationChannel>,
                Arc::new(Slow("email")),
                Fixed::new("push", true),
            ],
            Duration::from_millis(200),
        );

        let started = Instant::now();
        let results = dispatcher.send_alert(&sample_event());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(results.len(), 3);
        assert_eq!(results["sms"], false);
        assert_eq!(results["email"], false);
        assert_eq!(results["push"], true);
        assert!(dispatcher.health()["sms"]
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("timed out"));
    }

    #[test]
    fn panicking_channel_is_isolated() {
        let email = Fixed::new("email", true);
        let dispatcher = NotificationDispatcher::new(
            vec![Arc::new(Panics) as Arc<dyn NotificationChannel>, email.clone()],
            Duration::from_secs(2),
        );
        let results = dispatcher.send_alert(&sample_event());
        assert_eq!(results["push"], false);
        assert_eq!(results["email"], true);
    }

    #[test]
    fn no_channels_yields_empty_map() {
        let dispatcher = NotificationDispatcher::new(Vec::new(), Duration::from_secs(1));
        assert!(dispatcher.send_alert(&sample_event()).is_empty());
        assert!(dispatcher.active_channels().is_empty());
    }

    #[test]
    fn from_config_requires_sections_for_enabled_channels() {
        let mut alerts = crate::config::SentryConfig::default().alerts;
        alerts.enabled_channels = vec!["email".to_string()];
        let notifications = NotificationsConfig::default();
        let err = NotificationDispatcher::from_config(&alerts, &notifications)
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("notifications.email"));

        alerts.enabled_channels.clear();
        let dispatcher = NotificationDispatcher::from_config(&alerts, &notifications).unwrap();
        assert!(dispatcher.active_channels().is_empty());
    }
}
