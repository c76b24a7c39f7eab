//! Notification channels and the dispatcher that fans alerts out to them.
//!
//! Every channel implements one capability: deliver an `AlertMessage` to its
//! configured recipients. Formatting and attachment handling stay inside the
//! channel.

mod dispatcher;
mod email;
mod message;
mod mqtt;
mod push;
mod sms;

use anyhow::{anyhow, Result};

pub use dispatcher::{ChannelHealth, NotificationDispatcher};
pub use email::EmailChannel;
pub use message::AlertMessage;
pub use mqtt::MqttChannel;
pub use push::PushChannel;
pub use sms::SmsChannel;

pub trait NotificationChannel: Send + Sync {
    /// Stable channel name used in result maps and statistics.
    fn name(&self) -> &'static str;

    /// Deliver to every configured recipient. Any recipient failing fails
    /// the delivery.
    fn deliver(&self, message: &AlertMessage) -> Result<()>;
}

/// Reject empty values and unexpanded `${VAR}` placeholders.
pub(crate) fn require_setting(channel: &str, field: &str, value: &str) -> Result<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("{} channel: {} is required", channel, field));
    }
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return Err(anyhow!(
            "{} channel: {} refers to unset environment variable {}",
            channel,
            field,
            trimmed
        ));
    }
    Ok(())
}

/// Map a ureq failure to an error that names the channel and HTTP status.
pub(crate) fn http_error(channel: &str, err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            anyhow!("{} API returned HTTP {}: {}", channel, code, snippet)
        }
        ureq::Error::Transport(transport) => {
            anyhow!("{} request failed: {}", channel, transport)
        }
    }
}
