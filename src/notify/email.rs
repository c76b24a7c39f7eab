use std::fs;
use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;

use super::{http_error, require_setting, AlertMessage, NotificationChannel};
use crate::config::EmailConfig;

/// EmailJS caps template parameters; larger snapshots are sent as a path only.
const MAX_INLINE_IMAGE_BYTES: u64 = 48 * 1024;

/// Email through the EmailJS REST API, one request per recipient.
///
/// The template receives `to_email`, `subject`, `message`, `class_name`,
/// `confidence`, `detected_at` and, for small snapshots, `snapshot` as a
/// `data:` URL.
pub struct EmailChannel {
    agent: ureq::Agent,
    cfg: EmailConfig,
}

impl EmailChannel {
    pub fn new(cfg: &EmailConfig, timeout: Duration) -> Result<Self> {
        require_setting("email", "service_id", &cfg.service_id)?;
        require_setting("email", "template_id", &cfg.template_id)?;
        require_setting("email", "public_key", &cfg.public_key)?;
        if let Some(private_key) = &cfg.private_key {
            require_setting("email", "private_key", private_key)?;
        }
        if cfg.to_emails.is_empty() {
            return Err(anyhow!("email channel: to_emails must list at least one address"));
        }
        for address in &cfg.to_emails {
            if !address.contains('@') {
                return Err(anyhow!("email channel: invalid recipient '{}'", address));
            }
        }
        Ok(Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            cfg: cfg.clone(),
        })
    }

    fn snapshot_data_url(message: &AlertMessage) -> Option<String> {
        let path = message.image_path.as_ref()?;
        let size = fs::metadata(path).ok()?.len();
        if size > MAX_INLINE_IMAGE_BYTES {
            return None;
        }
        let bytes = fs::read(path).ok()?;
        Some(format!("data:image/jpeg;base64,{}", STANDARD.encode(bytes)))
    }
}

impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn deliver(&self, message: &AlertMessage) -> Result<()> {
        let snapshot = Self::snapshot_data_url(message);
        let image_ref = message
            .image_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let mut failed = Vec::new();
        for to in &self.cfg.to_emails {
            let mut payload = json!({
                "service_id": self.cfg.service_id,
                "template_id": self.cfg.template_id,
                "user_id": self.cfg.public_key,
                "template_params": {
                    "to_email": to,
                    "subject": message.title,
                    "message": message.body,
                    "class_name": message.display_name,
                    "confidence": format!("{:.0}%", message.confidence * 100.0),
                    "detected_at": message.detected_at_iso,
                    "image_path": image_ref,
                },
            });
            if let Some(private_key) = &self.cfg.private_key {
                payload["accessToken"] = json!(private_key);
            }
            if let Some(data_url) = &snapshot {
                payload["template_params"]["snapshot"] = json!(data_url);
            }

            if let Err(err) = self
                .agent
                .post(&self.cfg.api_url)
                .send_json(payload)
                .map_err(|e| http_error("EmailJS", e))
            {
                log::warn!("email: delivery to {} failed: {:#}", to, err);
                failed.push(format!("{}: {:#}", to, err));
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "{} of {} email recipients failed ({})",
                failed.len(),
                self.cfg.to_emails.len(),
                failed.join("; ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::{fake_http_server, sample_event};
    use std::io::Write;

    fn config(api_url: String) -> EmailConfig {
        EmailConfig {
            service_id: "service_x".to_string(),
            template_id: "template_y".to_string(),
            public_key: "pub".to_string(),
            private_key: Some("priv".to_string()),
            to_emails: vec!["owner@example.com".to_string()],
            api_url,
        }
    }

    #[test]
    fn sends_template_params_with_inline_snapshot() -> Result<()> {
        let mut snapshot = tempfile::NamedTempFile::new()?;
        snapshot.write_all(&[0xFF, 0xD8, 0xFF, 0xD9])?;

        let (base, server) = fake_http_server(vec![(200, "OK")]);
        let channel = EmailChannel::new(&config(format!("{}/api/v1.0/email/send", base)), Duration::from_secs(5))?;
        let mut event = sample_event();
        event.image_path = Some(snapshot.path().to_path_buf());
        channel.deliver(&AlertMessage::from_event(&event))?;

        let requests = server.join().unwrap();
        assert_eq!(requests[0].request_line, "POST /api/v1.0/email/send HTTP/1.1");
        let body: serde_json::Value = serde_json::from_str(&requests[0].body)?;
        assert_eq!(body["service_id"], "service_x");
        assert_eq!(body["user_id"], "pub");
        assert_eq!(body["accessToken"], "priv");
        assert_eq!(body["template_params"]["to_email"], "owner@example.com");
        assert_eq!(body["template_params"]["subject"], "Rodent Alert: Norway Rat Detected");
        assert_eq!(
            body["template_params"]["snapshot"],
            "data:image/jpeg;base64,/9j/2Q=="
        );
        Ok(())
    }

    #[test]
    fn http_error_fails_delivery() -> Result<()> {
        let (base, server) = fake_http_server(vec![(403, "forbidden")]);
        let channel = EmailChannel::new(&config(base), Duration::from_secs(5))?;
        let err = channel
            .deliver(&AlertMessage::from_event(&sample_event()))
            .unwrap_err();
        assert!(format!("{err:#}").contains("403"));
        server.join().unwrap();
        Ok(())
    }

    #[test]
    fn rejects_bad_recipients() {
        let mut cfg = config("http://127.0.0.1:1".to_string());
        cfg.to_emails = vec!["not-an-address".to_string()];
        assert!(EmailChannel::new(&cfg, Duration::from_secs(1)).is_err());
    }
}
