//! HTTP bridge to the trading sidecar.
//!
//! The sidecar owns the remote session and wire protocol; this client speaks
//! a small JSON API to it and implements every collaborator interface the
//! engine needs.
//!
//! Endpoints (relative to the configured base URL):
//! - `GET  /offers?filter=active|all`, `GET /offers/{id}`, `POST /offers`
//! - `POST /offers/{id}/accept|decline|confirm`, `GET /offers/{id}/escrow`
//! - `POST /session/refresh`
//! - `GET  /inventory`, `GET /inventory/{partner}`
//! - `GET  /prices/{sku}`
//! - `POST /decide`
//!
//! Errors come back as `{"error": "...", "eresult": 16, "cause": "..."}`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{InventoryProvider, OfferHandler, PriceSource, TradeService};
use crate::error::{ResultCode, ServiceError};
use crate::types::{
    AcceptStatus, AssetId, EscrowDetails, InventorySnapshot, OfferFilter, OfferList, PartnerId,
    PriceEntry, Proposal, ProposalDraft, ProposalId, Sku, TradeItem, Verdict,
};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    eresult: Option<i32>,
    #[serde(default)]
    cause: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AcceptResponse {
    status: AcceptStatus,
}

#[derive(Debug, Serialize)]
struct DecideRequest<'a> {
    offer: &'a Proposal,
}

#[derive(Debug, Deserialize)]
struct DecideResponse {
    #[serde(default)]
    verdict: Option<Verdict>,
}

const NOT_LOGGED_IN: &str = "Not Logged In";
const NO_MATCH: [&str; 2] = ["NoMatch", "No matching offer found"];

/// Turn a non-success response into the matching `ServiceError`.
fn map_error(status: StatusCode, body: &str) -> ServiceError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_else(|_| ErrorBody {
        error: body.to_string(),
        ..ErrorBody::default()
    });
    let message = if parsed.error.is_empty() {
        format!("bridge returned {status}")
    } else {
        parsed.error
    };

    if message.contains(NOT_LOGGED_IN) || status == StatusCode::UNAUTHORIZED {
        return ServiceError::NotLoggedIn;
    }
    if NO_MATCH.iter().any(|m| message.contains(m)) || status == StatusCode::NOT_FOUND {
        return ServiceError::NoMatch;
    }
    if let Some(cause) = parsed.cause {
        return ServiceError::Cause { cause, message };
    }
    if let Some(code) = parsed.eresult {
        return ServiceError::rejected(ResultCode::from_code(code), message);
    }
    if status.is_server_error() {
        return ServiceError::Transport(format!("{status}: {message}"));
    }
    ServiceError::Other(message)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct BridgeClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    inventory: Mutex<InventorySnapshot>,
}

impl BridgeClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("offer-reconciler/0.1.0")
            .build()
            .context("Failed to build HTTP client for the trading bridge")?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            inventory: Mutex::new(InventorySnapshot::default()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Send a request and decode its JSON body.
    async fn call<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ServiceError> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_error(status, &body));
        }

        resp.json::<T>()
            .await
            .map_err(|e| ServiceError::Other(format!("Failed to parse bridge response: {e}")))
    }

    /// Send a request whose response body is ignored.
    async fn call_empty(&self, req: RequestBuilder) -> Result<(), ServiceError> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_error(status, &body));
        }
        Ok(())
    }

    fn offer_path(id: &ProposalId, action: &str) -> String {
        format!("/offers/{}/{action}", urlencoding::encode(id.as_str()))
    }
}

// ---------------------------------------------------------------------------
// TradeService
// ---------------------------------------------------------------------------

#[async_trait]
impl TradeService for BridgeClient {
    async fn get_offer(&self, id: &ProposalId) -> Result<Proposal, ServiceError> {
        let url = self.url(&format!("/offers/{}", urlencoding::encode(id.as_str())));
        self.call(self.http.get(url)).await
    }

    async fn get_offers(&self, filter: OfferFilter) -> Result<OfferList, ServiceError> {
        let filter = match filter {
            OfferFilter::ActiveOnly => "active",
            OfferFilter::All => "all",
        };
        let url = self.url(&format!("/offers?filter={filter}"));
        self.call(self.http.get(url)).await
    }

    async fn accept(&self, id: &ProposalId) -> Result<AcceptStatus, ServiceError> {
        let url = self.url(&Self::offer_path(id, "accept"));
        let resp: AcceptResponse = self.call(self.http.post(url)).await?;
        Ok(resp.status)
    }

    async fn decline(&self, id: &ProposalId) -> Result<(), ServiceError> {
        let url = self.url(&Self::offer_path(id, "decline"));
        self.call_empty(self.http.post(url)).await
    }

    async fn send(&self, draft: &ProposalDraft) -> Result<Proposal, ServiceError> {
        let url = self.url("/offers");
        debug!(partner = %draft.partner, "Sending offer through bridge");
        self.call(self.http.post(url).json(draft)).await
    }

    async fn confirm(&self, id: &ProposalId) -> Result<(), ServiceError> {
        let url = self.url(&Self::offer_path(id, "confirm"));
        self.call_empty(self.http.post(url)).await
    }

    async fn escrow_details(&self, id: &ProposalId) -> Result<EscrowDetails, ServiceError> {
        let url = self.url(&Self::offer_path(id, "escrow"));
        self.call(self.http.get(url)).await
    }

    async fn refresh_session(&self) -> Result<(), ServiceError> {
        info!("Asking bridge to re-establish the session");
        let url = self.url("/session/refresh");
        self.call_empty(self.http.post(url)).await
    }
}

// ---------------------------------------------------------------------------
// Inventory, prices, decisions
// ---------------------------------------------------------------------------

#[async_trait]
impl InventoryProvider for BridgeClient {
    async fn refresh(&self) -> Result<()> {
        let items: Vec<TradeItem> = self
            .call(self.http.get(self.url("/inventory")))
            .await
            .context("Failed to fetch inventory from bridge")?;
        let snapshot = InventorySnapshot::from_items(&items);
        debug!(items = snapshot.len(), "Inventory refreshed");
        *self.inventory.lock() = snapshot;
        Ok(())
    }

    fn snapshot(&self) -> InventorySnapshot {
        self.inventory.lock().clone()
    }

    fn remove_item(&self, asset_id: &AssetId) {
        self.inventory.lock().remove_item(asset_id);
    }

    async fn fetch_partner(&self, partner: &PartnerId) -> Result<InventorySnapshot> {
        let url = self.url(&format!("/inventory/{}", urlencoding::encode(partner.as_str())));
        let items: Vec<TradeItem> = self
            .call(self.http.get(url))
            .await
            .with_context(|| format!("Failed to fetch inventory of {partner}"))?;
        Ok(InventorySnapshot::from_items(&items))
    }
}

#[async_trait]
impl PriceSource for BridgeClient {
    async fn price_for(&self, sku: &Sku) -> Option<PriceEntry> {
        let url = self.url(&format!("/prices/{}", urlencoding::encode(sku.as_str())));
        match self.call::<PriceEntry>(self.http.get(url)).await {
            Ok(price) => Some(price),
            Err(ServiceError::NoMatch) => None,
            Err(e) => {
                debug!(sku = %sku, error = %e, "Price lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl OfferHandler for BridgeClient {
    async fn decide(&self, proposal: &Proposal) -> Result<Option<Verdict>> {
        let resp: DecideResponse = self
            .call(self.http.post(self.url("/decide")).json(&DecideRequest { offer: proposal }))
            .await
            .with_context(|| format!("Bridge failed to decide on offer #{}", proposal.id))?;
        Ok(resp.verdict)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
