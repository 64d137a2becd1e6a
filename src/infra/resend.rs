//! Resend 邮件通知

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::services::notify::{LogNotifier, MigrationEvent, Notifier};

const RESEND_URL: &str = "https://api.resend.com/emails";

/// 最大重试次数
const MAX_ATTEMPTS: u32 = 3;

/// 邮件通知器
pub struct ResendNotifier {
    client: Client,
    config: NotificationConfig,
}

impl ResendNotifier {
    pub fn new(config: NotificationConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self { client, config })
    }

    async fn send(&self, event: &MigrationEvent) -> Result<(), String> {
        let body = serde_json::json!({
            "from": self.config.from,
            "to": self.config.to,
            "subject": event.subject(),
            "text": event.body(),
        });
        let resp = self
            .client
            .post(RESEND_URL)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            Err(format!("{}: {}", status, text))
        }
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn notify(&self, event: &MigrationEvent) {
        // 日志始终保留一份
        LogNotifier.notify(event).await;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.send(event).await {
                Ok(()) => {
                    info!(event = event.kind(), recipients = self.config.to.len(), "Notification sent");
                    return;
                }
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!(event = event.kind(), attempt, error = %e, "Notification failed, retrying");
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(e) => {
                    warn!(event = event.kind(), error = %e, "Notification failed after all retries");
                }
            }
        }
    }
}
