use std::fs;
use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;

use super::{http_error, require_setting, AlertMessage, NotificationChannel};
use crate::config::PushConfig;

/// Pushover rejects attachments above 5 MB.
const MAX_ATTACHMENT_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Deserialize)]
struct PushoverResponse {
    status: i64,
    #[serde(default)]
    errors: Vec<String>,
}

/// Push notification through Pushover, with the snapshot attached.
pub struct PushChannel {
    agent: ureq::Agent,
    cfg: PushConfig,
}

impl PushChannel {
    pub fn new(cfg: &PushConfig, timeout: Duration) -> Result<Self> {
        require_setting("push", "api_token", &cfg.api_token)?;
        require_setting("push", "user_key", &cfg.user_key)?;
        if !(-2..=2).contains(&cfg.priority) {
            return Err(anyhow!(
                "push channel: priority must be between -2 and 2, got {}",
                cfg.priority
            ));
        }
        Ok(Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            cfg: cfg.clone(),
        })
    }

    fn attachment(message: &AlertMessage) -> Option<String> {
        let path = message.image_path.as_ref()?;
        let size = fs::metadata(path).ok()?.len();
        if size > MAX_ATTACHMENT_BYTES {
            log::debug!("push: snapshot {} too large to attach", path.display());
            return None;
        }
        fs::read(path).ok().map(|bytes| STANDARD.encode(bytes))
    }
}

impl NotificationChannel for PushChannel {
    fn name(&self) -> &'static str {
        "push"
    }

    fn deliver(&self, message: &AlertMessage) -> Result<()> {
        let priority = self.cfg.priority.to_string();
        let timestamp = (message.detected_at as i64).to_string();
        let attachment = Self::attachment(message);

        let mut form: Vec<(&str, &str)> = vec![
            ("token", &self.cfg.api_token),
            ("user", &self.cfg.user_key),
            ("title", &message.title),
            ("message", &message.body),
            ("priority", &priority),
            ("timestamp", &timestamp),
        ];
        if let Some(encoded) = &attachment {
            form.push(("attachment_base64", encoded));
            form.push(("attachment_type", "image/jpeg"));
        }

        let response = self
            .agent
            .post(&self.cfg.api_url)
            .send_form(&form)
            .map_err(|e| http_error("Pushover", e))?;
        let parsed: PushoverResponse = response
            .into_json()
            .map_err(|e| anyhow!("Pushover returned an unreadable response: {}", e))?;
        if parsed.status != 1 {
            return Err(anyhow!(
                "Pushover rejected the message: {}",
                parsed.errors.join(", ")
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::{fake_http_server, sample_event};
    use std::io::Write;

    fn config(api_url: String) -> PushConfig {
        PushConfig {
            api_token: "app-token".to_string(),
            user_key: "user-key".to_string(),
            priority: 1,
            api_url,
        }
    }

    #[test]
    fn posts_message_with_attachment() -> Result<()> {
        let mut snapshot = tempfile::NamedTempFile::new()?;
        snapshot.write_all(b"jpeg")?;

        let (base, server) = fake_http_server(vec![(200, r#"{"status":1,"request":"abc"}"#)]);
        let channel = PushChannel::new(&config(format!("{}/1/messages.json", base)), Duration::from_secs(5))?;
        let mut event = sample_event();
        event.image_path = Some(snapshot.path().to_path_buf());
        channel.deliver(&AlertMessage::from_event(&event))?;

        let requests = server.join().unwrap();
        let body = &requests[0].body;
        assert_eq!(requests[0].request_line, "POST /1/messages.json HTTP/1.1");
        assert!(body.contains("token=app-token"));
        assert!(body.contains("user=user-key"));
        assert!(body.contains("priority=1"));
        assert!(body.contains("attachment_base64=anBlZw%3D%3D"));
        assert!(body.contains("attachment_type=image%2Fjpeg"));
        Ok(())
    }

    #[test]
    fn api_level_rejection_is_a_failure() -> Result<()> {
        let (base, server) = fake_http_server(vec![(200, r#"{"status":0,"errors":["user key is invalid"]}"#)]);
        let channel = PushChannel::new(&config(base), Duration::from_secs(5))?;
        let err = channel
            .deliver(&AlertMessage::from_event(&sample_event()))
            .unwrap_err();
        assert!(format!("{err}").contains("user key is invalid"));
        server.join().unwrap();
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_priority() {
        let mut cfg = config("http://127.0.0.1:1".to_string());
        cfg.priority = 3;
        assert!(PushChannel::new(&cfg, Duration::from_secs(1)).is_err());
    }
}
