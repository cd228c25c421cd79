//! Operator alert sinks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Alert, Alerter};

/// Writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn alert(&self, alert: Alert) {
        warn!(
            kind = %alert.kind,
            offers = ?alert.offer_ids,
            error = alert.error.as_deref().unwrap_or(""),
            failed_count = alert.failed_count,
            "{}",
            alert.text
        );
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    kind: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    offer_ids: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_count: Option<u32>,
}

/// Posts alerts as JSON to a webhook, and logs them too.
pub struct WebhookAlerter {
    http: Client,
    url: String,
    log: LogAlerter,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("offer-reconciler/0.1.0")
            .build()
            .context("Failed to build HTTP client for webhook alerts")?;

        Ok(Self {
            http,
            url: url.into(),
            log: LogAlerter,
        })
    }

    async fn post(&self, alert: &Alert) -> Result<()> {
        let payload = WebhookPayload {
            kind: alert.kind.as_str(),
            content: &alert.text,
            error: alert.error.as_deref(),
            offer_ids: alert.offer_ids.iter().map(|id| id.as_str()).collect(),
            failed_count: alert.failed_count,
        };

        let resp = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("Webhook request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Webhook error {status}: {body}");
        }
        Ok(())
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn alert(&self, alert: Alert) {
        self.log.alert(alert.clone()).await;
        match self.post(&alert).await {
            Ok(()) => debug!(kind = %alert.kind, "Alert delivered"),
            Err(e) => warn!(kind = %alert.kind, error = %e, "Failed to deliver alert"),
        }
    }
}

/// Keeps every alert in memory.
#[derive(Debug, Default)]
pub struct MemoryAlerter {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl Alerter for MemoryAlerter {
    async fn alert(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}
