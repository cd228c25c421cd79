//! Collaborator interfaces.
//!
//! The engine talks to the outside world only through these traits:
//! - `TradeService`: the remote negotiation service (wire protocol owned by
//!   the implementor)
//! - `OfferHandler`: the decision callback
//! - `InventoryProvider`, `PriceSource`: our holdings and the price list
//! - `Alerter`, `ProcessSupervisor`, `ReachabilityProbe`: operator alerts,
//!   self-restart and the health probe used before restarting
//!
//! Implementations:
//! - `bridge`: HTTP/JSON client for a sidecar that owns the wire protocol
//! - `paper`: in-memory collaborators for offline runs and tests
//! - `probe`, `supervisor`, `alerts`: concrete probe, supervisor and alert sinks

pub mod alerts;
pub mod bridge;
pub mod paper;
pub mod probe;
pub mod supervisor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ServiceError;
use crate::types::{
    AcceptStatus, Action, AssetId, EscrowDetails, InventorySnapshot, OfferFilter, OfferList,
    OfferState, PartnerId, PriceEntry, Proposal, ProposalDraft, ProposalId, Sku, Verdict,
};

// ---------------------------------------------------------------------------
// Remote negotiation service
// ---------------------------------------------------------------------------

/// The remote service that owns proposals.
///
/// Calls are single attempts; retry and backoff live in the engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeService: Send + Sync {
    async fn get_offer(&self, id: &ProposalId) -> Result<Proposal, ServiceError>;

    async fn get_offers(&self, filter: OfferFilter) -> Result<OfferList, ServiceError>;

    async fn accept(&self, id: &ProposalId) -> Result<AcceptStatus, ServiceError>;

    async fn decline(&self, id: &ProposalId) -> Result<(), ServiceError>;

    /// Create a proposal. The returned copy carries the remote id and a
    /// state of `Active` or `NeedsConfirmation`.
    async fn send(&self, draft: &ProposalDraft) -> Result<Proposal, ServiceError>;

    /// Approve the mobile confirmation for a proposal.
    async fn confirm(&self, id: &ProposalId) -> Result<(), ServiceError>;

    /// Hold details for the counterparty of a proposal.
    async fn escrow_details(&self, id: &ProposalId) -> Result<EscrowDetails, ServiceError>;

    /// Re-establish the web session after a `NotLoggedIn` failure.
    async fn refresh_session(&self) -> Result<(), ServiceError>;
}

// ---------------------------------------------------------------------------
// Decision callback
// ---------------------------------------------------------------------------

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OfferHandler: Send + Sync {
    /// Decide what to do with a received proposal. `None` leaves it alone.
    async fn decide(&self, proposal: &Proposal) -> anyhow::Result<Option<Verdict>>;

    /// Called right before an action is applied.
    fn on_action(&self, _proposal: &Proposal, _action: Action, _reason: &str) {}

    /// Called after a state change has been reconciled.
    fn on_offer_changed(&self, _proposal: &Proposal, _old_state: OfferState, _time_taken_ms: Option<i64>) {}
}

// ---------------------------------------------------------------------------
// Inventory & prices
// ---------------------------------------------------------------------------

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    /// Re-fetch our own inventory.
    async fn refresh(&self) -> anyhow::Result<()>;

    /// Last fetched copy of our inventory.
    fn snapshot(&self) -> InventorySnapshot;

    /// Forget an item that just left our inventory.
    fn remove_item(&self, asset_id: &AssetId);

    /// Fetch a counterparty's inventory.
    async fn fetch_partner(&self, partner: &PartnerId) -> anyhow::Result<InventorySnapshot>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Current buy/sell price of a kind, or `None` when it is not listed.
    async fn price_for(&self, sku: &Sku) -> Option<PriceEntry>;
}

// ---------------------------------------------------------------------------
// Alerts, supervisor, probe
// ---------------------------------------------------------------------------

/// Alert categories understood by the operator tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    FailedAccept,
    FailedDecline,
    FailedCounter,
    ErrorAccept,
    EscrowProbeDown,
    EscrowMaintenance,
    EscrowRestart,
    FailedSupervisor,
    FailedRestartError,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::FailedAccept => "failed-accept",
            AlertKind::FailedDecline => "failed-decline",
            AlertKind::FailedCounter => "failed-counter",
            AlertKind::ErrorAccept => "error-accept",
            AlertKind::EscrowProbeDown => "escrow-check-failed-not-restart-probe-down",
            AlertKind::EscrowMaintenance => "escrow-check-failed-not-restart-maintenance",
            AlertKind::EscrowRestart => "escrow-check-failed-perform-restart",
            AlertKind::FailedSupervisor => "failed-supervisor",
            AlertKind::FailedRestartError => "failed-restart-error",
        }
    }

    /// Failure category for a failed action.
    pub fn for_failed(action: Action) -> Option<Self> {
        match action {
            Action::Accept => Some(AlertKind::FailedAccept),
            Action::Decline => Some(AlertKind::FailedDecline),
            Action::Counter => Some(AlertKind::FailedCounter),
            Action::Skip => None,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operator notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub text: String,
    /// Underlying error, if any.
    pub error: Option<String>,
    pub offer_ids: Vec<ProposalId>,
    /// Consecutive escrow-check failures at the time of the alert.
    pub failed_count: Option<u32>,
}

impl Alert {
    pub fn new(kind: AlertKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            error: None,
            offer_ids: Vec::new(),
            failed_count: None,
        }
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_offer(mut self, id: &ProposalId) -> Self {
        self.offer_ids.push(id.clone());
        self
    }

    pub fn with_failed_count(mut self, count: u32) -> Self {
        self.failed_count = Some(count);
        self
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Alerter: Send + Sync {
    /// Deliver an alert. Delivery problems are the sink's to log.
    async fn alert(&self, alert: Alert);
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Ask the process manager to restart us. `Ok(false)` means no process
    /// manager is available.
    async fn restart(&self) -> anyhow::Result<bool>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Succeeds when the external dependency answers.
    async fn probe(&self, partner: &PartnerId) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
