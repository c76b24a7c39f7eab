use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::{http_error, require_setting, AlertMessage, NotificationChannel};
use crate::config::SmsConfig;

/// SMS through the Twilio Messages REST API, one request per recipient.
pub struct SmsChannel {
    agent: ureq::Agent,
    messages_url: String,
    auth_header: String,
    from_number: String,
    to_numbers: Vec<String>,
}

impl SmsChannel {
    pub fn new(cfg: &SmsConfig, timeout: Duration) -> Result<Self> {
        require_setting("sms", "account_sid", &cfg.account_sid)?;
        require_setting("sms", "auth_token", &cfg.auth_token)?;
        require_setting("sms", "from_number", &cfg.from_number)?;
        if cfg.to_numbers.is_empty() {
            return Err(anyhow!("sms channel: to_numbers must list at least one number"));
        }
        for number in &cfg.to_numbers {
            require_setting("sms", "to_numbers", number)?;
        }

        let credentials = format!("{}:{}", cfg.account_sid, cfg.auth_token);
        Ok(Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            messages_url: format!(
                "{}/2010-04-01/Accounts/{}/Messages.json",
                cfg.api_base.trim_end_matches('/'),
                cfg.account_sid
            ),
            auth_header: format!("Basic {}", STANDARD.encode(credentials)),
            from_number: cfg.from_number.clone(),
            to_numbers: cfg.to_numbers.clone(),
        })
    }

    fn send_one(&self, to: &str, body: &str) -> Result<()> {
        self.agent
            .post(&self.messages_url)
            .set("Authorization", &self.auth_header)
            .send_form(&[("To", to), ("From", &self.from_number), ("Body", body)])
            .map_err(|e| http_error("Twilio", e))?;
        Ok(())
    }
}

impl NotificationChannel for SmsChannel {
    fn name(&self) -> &'static str {
        "sms"
    }

    fn deliver(&self, message: &AlertMessage) -> Result<()> {
        let mut failed = Vec::new();
        for to in &self.to_numbers {
            if let Err(err) = self.send_one(to, &message.body) {
                log::warn!("sms: delivery to {} failed: {:#}", mask_number(to), err);
                failed.push(format!("{}: {:#}", mask_number(to), err));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "{} of {} SMS recipients failed ({})",
                failed.len(),
                self.to_numbers.len(),
                failed.join("; ")
            ))
        }
    }
}

/// Keep only the last four digits of a phone number for logs.
fn mask_number(number: &str) -> String {
    let digits: Vec<char> = number.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("***{}", tail)
}
