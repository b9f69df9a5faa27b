use async_trait::async_trait;
use reqwest::Client;

use crate::config::MonitorConfig;
use crate::error::{Result, WatchError};

/// Outbound alert channel.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}

pub struct TelegramBot {
    token: String,
    chat_id: String,
    client: Client,
}

impl TelegramBot {
    pub fn new(token: &str, chat_id: &str) -> Self {
        Self {
            token: token.to_string(),
            chat_id: chat_id.to_string(),
            client: Client::new(),
        }
    }

    /// `None` when either credential is missing; alerting is then disabled.
    pub fn from_config(config: &MonitorConfig) -> Option<Self> {
        match (&config.telegram_bot_token, &config.telegram_chat_id) {
            (Some(token), Some(chat_id)) => Some(Self::new(token, chat_id)),
            _ => None,
        }
    }
}

#[async_trait]
impl AlertSink for TelegramBot {
    async fn send(&self, message: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);

        let params = [("chat_id", self.chat_id.as_str()), ("text", message)];

        let resp = self
            .client
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| WatchError::Alert(e.without_url().to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err = resp.text().await.unwrap_or_default();
            return Err(WatchError::Alert(format!("Telegram API error {}: {}", status, err)));
        }

        Ok(())
    }
}
