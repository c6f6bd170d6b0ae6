//! Telegram Bot API alert channel.
//!
//! API: `https://api.telegram.org/bot{token}/sendMessage`

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::time::Duration;

use super::{AlertLevel, AlertSink};

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    disable_web_page_preview: bool,
}

pub struct TelegramSink {
    http: Client,
    base_url: String,
    bot_token: SecretString,
    chat_id: String,
    engine_name: String,
}

impl TelegramSink {
    pub fn new(bot_token: SecretString, chat_id: String, engine_name: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build Telegram HTTP client")?;
        Ok(Self {
            http,
            base_url: "https://api.telegram.org".to_string(),
            bot_token,
            chat_id,
            engine_name: engine_name.to_string(),
        })
    }

    fn format(&self, level: AlertLevel, message: &str) -> String {
        let icon = match level {
            AlertLevel::Info => "ℹ️",
            AlertLevel::Warning => "⚠️",
            AlertLevel::Error => "🚨",
        };
        format!("{icon} [{}] {level}: {message}", self.engine_name)
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    async fn send(&self, level: AlertLevel, message: &str) -> Result<()> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.base_url,
            self.bot_token.expose_secret()
        );
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: self.format(level, message),
            disable_web_page_preview: true,
        };

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Telegram request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("Telegram API error: {status}");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "telegram"
    }
}
