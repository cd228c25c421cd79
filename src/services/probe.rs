//! Reachability probe against the community user-info API.
//!
//! Used before a self-restart: if this API is down as well, the problem is
//! most likely on the remote side and restarting would not help.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::ReachabilityProbe;
use crate::types::PartnerId;

pub const DEFAULT_PROBE_URL: &str = "https://api.backpack.tf/api/users/info/v1";

pub struct BackpackProbe {
    http: Client,
    url: String,
    api_key: Option<String>,
    /// Our own account id, sent as the `user-id` cookie.
    user_id: Option<String>,
}

impl BackpackProbe {
    pub fn new(url: impl Into<String>, api_key: Option<String>, user_id: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("offer-reconciler/0.1.0")
            .build()
            .context("Failed to build HTTP client for the reachability probe")?;

        Ok(Self {
            http,
            url: url.into(),
            api_key,
            user_id,
        })
    }

    fn request_url(&self, partner: &PartnerId) -> String {
        let mut url = format!("{}?steamids={}", self.url, urlencoding::encode(partner.as_str()));
        if let Some(key) = &self.api_key {
            url.push_str(&format!("&key={}", urlencoding::encode(key)));
        }
        url
    }
}

#[async_trait]
impl ReachabilityProbe for BackpackProbe {
    async fn probe(&self, partner: &PartnerId) -> Result<()> {
        let url = self.request_url(partner);
        debug!(partner = %partner, "Probing user-info API");

        let mut req = self.http.get(&url);
        if let Some(user_id) = &self.user_id {
            req = req.header(reqwest::header::COOKIE, format!("user-id={user_id}"));
        }

        let resp = req.send().await.context("Probe request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Probe error {status}: {body}");
        }
        Ok(())
    }
}
