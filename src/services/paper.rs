//! In-memory collaborators.
//!
//! Used for offline (paper) runs and by the integration tests. Everything is
//! deterministic and controllable: offers are seeded by hand, failures are
//! injected per operation, and every call is counted.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::{InventoryProvider, OfferHandler, PriceSource, TradeService};
use crate::error::{ResultCode, ServiceError};
use crate::types::{
    AcceptStatus, Action, AssetId, Direction, EscrowDetails, InventorySnapshot, OfferFilter,
    OfferList, OfferState, PartnerId, PriceEntry, PriceSnapshot, Proposal, ProposalDraft,
    ProposalId, Sku, TradeItem, Verdict,
};

// ---------------------------------------------------------------------------
// Trade service
// ---------------------------------------------------------------------------

/// Remote operations that can be counted and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    GetOffer,
    GetOffers,
    Accept,
    Decline,
    Send,
    Confirm,
    Escrow,
    RefreshSession,
}

#[derive(Default)]
struct PaperState {
    offers: BTreeMap<ProposalId, Proposal>,
    failures: HashMap<PaperOp, VecDeque<ServiceError>>,
    calls: HashMap<PaperOp, usize>,
    /// Accept/decline/send in the order they succeeded.
    actions: Vec<(PaperOp, ProposalId)>,
    escrow_days: HashMap<PartnerId, u32>,
    accept_status: Option<AcceptStatus>,
    send_needs_confirmation: bool,
    next_id: u64,
}

/// In-memory negotiation service.
#[derive(Default)]
pub struct PaperTradeService {
    state: Mutex<PaperState>,
}

impl PaperTradeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_offer(&self, proposal: Proposal) {
        self.state.lock().offers.insert(proposal.id.clone(), proposal);
    }

    pub fn offer(&self, id: &ProposalId) -> Option<Proposal> {
        self.state.lock().offers.get(id).cloned()
    }

    pub fn set_state(&self, id: &ProposalId, new_state: OfferState) {
        if let Some(offer) = self.state.lock().offers.get_mut(id) {
            offer.state = new_state;
            offer.updated_at = Utc::now();
        }
    }

    /// Make the next call of `op` fail with `err`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, op: PaperOp, err: ServiceError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn fail_times(&self, op: PaperOp, times: usize, err: ServiceError) {
        for _ in 0..times {
            self.fail_next(op, err.clone());
        }
    }

    pub fn calls(&self, op: PaperOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn actions(&self) -> Vec<(PaperOp, ProposalId)> {
        self.state.lock().actions.clone()
    }

    /// Sent proposals in the order they were created.
    pub fn sent_offers(&self) -> Vec<Proposal> {
        let state = self.state.lock();
        state
            .actions
            .iter()
            .filter(|(op, _)| *op == PaperOp::Send)
            .filter_map(|(_, id)| state.offers.get(id).cloned())
            .collect()
    }

    pub fn set_escrow_days(&self, partner: &PartnerId, days: u32) {
        self.state.lock().escrow_days.insert(partner.clone(), days);
    }

    pub fn set_accept_status(&self, status: AcceptStatus) {
        self.state.lock().accept_status = Some(status);
    }

    pub fn set_send_needs_confirmation(&self, needs: bool) {
        self.state.lock().send_needs_confirmation = needs;
    }

    /// Count the call and pop an injected failure, if any.
    fn enter(&self, op: PaperOp) -> Result<(), ServiceError> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn transition(&self, op: PaperOp, id: &ProposalId, to: OfferState) -> Result<(), ServiceError> {
        let mut state = self.state.lock();
        let offer = state.offers.get_mut(id).ok_or(ServiceError::NoMatch)?;
        if !offer.state.is_open() {
            return Err(ServiceError::rejected(
                ResultCode::InvalidState,
                format!("Trade offer #{id} is not active, so it may not be accepted"),
            ));
        }
        offer.state = to;
        offer.updated_at = Utc::now();
        state.actions.push((op, id.clone()));
        Ok(())
    }
}

#[async_trait]
impl TradeService for PaperTradeService {
    async fn get_offer(&self, id: &ProposalId) -> Result<Proposal, ServiceError> {
        self.enter(PaperOp::GetOffer)?;
        self.offer(id).ok_or(ServiceError::NoMatch)
    }

    async fn get_offers(&self, filter: OfferFilter) -> Result<OfferList, ServiceError> {
        self.enter(PaperOp::GetOffers)?;
        let state = self.state.lock();
        let mut list = OfferList::default();
        for offer in state.offers.values() {
            if filter == OfferFilter::ActiveOnly && !offer.state.holds_items() {
                continue;
            }
            match offer.direction {
                Direction::Sent => list.sent.push(offer.clone()),
                Direction::Received => list.received.push(offer.clone()),
            }
        }
        Ok(list)
    }

    async fn accept(&self, id: &ProposalId) -> Result<AcceptStatus, ServiceError> {
        self.enter(PaperOp::Accept)?;
        let status = self.state.lock().accept_status.unwrap_or(AcceptStatus::Accepted);
        let to = match status {
            AcceptStatus::Accepted => OfferState::Accepted,
            AcceptStatus::Pending => OfferState::Active,
        };
        self.transition(PaperOp::Accept, id, to)?;
        Ok(status)
    }

    async fn decline(&self, id: &ProposalId) -> Result<(), ServiceError> {
        self.enter(PaperOp::Decline)?;
        self.transition(PaperOp::Decline, id, OfferState::Declined)
    }

    async fn send(&self, draft: &ProposalDraft) -> Result<Proposal, ServiceError> {
        self.enter(PaperOp::Send)?;
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = ProposalId::new(format!("sent-{}", state.next_id));
        let now = Utc::now();
        let proposal = Proposal {
            id: id.clone(),
            partner: draft.partner.clone(),
            direction: Direction::Sent,
            state: if state.send_needs_confirmation {
                OfferState::NeedsConfirmation
            } else {
                OfferState::Active
            },
            items_to_give: draft.items_to_give.clone(),
            items_to_receive: draft.items_to_receive.clone(),
            message: draft.message.clone(),
            is_glitched: false,
            created_at: now,
            updated_at: now,
        };

        if let Some(original) = draft.countering.as_ref().and_then(|o| state.offers.get_mut(o)) {
            original.state = OfferState::Countered;
            original.updated_at = now;
        }
        state.offers.insert(id.clone(), proposal.clone());
        state.actions.push((PaperOp::Send, id));
        Ok(proposal)
    }

    async fn confirm(&self, id: &ProposalId) -> Result<(), ServiceError> {
        self.enter(PaperOp::Confirm)?;
        let mut state = self.state.lock();
        let offer = state
            .offers
            .get_mut(id)
            .ok_or_else(|| ServiceError::Other("Could not find confirmation for object".into()))?;
        offer.state = match (offer.direction, offer.state) {
            (Direction::Sent, OfferState::NeedsConfirmation) => OfferState::Active,
            (Direction::Received, OfferState::Active) => OfferState::Accepted,
            (_, other) => other,
        };
        Ok(())
    }

    async fn escrow_details(&self, id: &ProposalId) -> Result<EscrowDetails, ServiceError> {
        self.enter(PaperOp::Escrow)?;
        let state = self.state.lock();
        let offer = state.offers.get(id).ok_or(ServiceError::NoMatch)?;
        Ok(EscrowDetails {
            their_escrow_days: state.escrow_days.get(&offer.partner).copied().unwrap_or(0),
        })
    }

    async fn refresh_session(&self) -> Result<(), ServiceError> {
        self.enter(PaperOp::RefreshSession)
    }
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

/// Our inventory plus partner inventories, all in memory.
#[derive(Default)]
pub struct PaperInventory {
    ours: Mutex<InventorySnapshot>,
    partners: Mutex<HashMap<PartnerId, InventorySnapshot>>,
    removed: Mutex<Vec<AssetId>>,
    refresh_failures: AtomicU32,
    refresh_calls: AtomicUsize,
}

impl PaperInventory {
    pub fn new(items: &[TradeItem]) -> Self {
        Self {
            ours: Mutex::new(InventorySnapshot::from_items(items)),
            ..Self::default()
        }
    }

    pub fn set_partner(&self, partner: &PartnerId, items: &[TradeItem]) {
        self.partners
            .lock()
            .insert(partner.clone(), InventorySnapshot::from_items(items));
    }

    /// Make the next `count` refreshes fail.
    pub fn fail_refreshes(&self, count: u32) {
        self.refresh_failures.store(count, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<AssetId> {
        self.removed.lock().clone()
    }
}

#[async_trait]
impl InventoryProvider for PaperInventory {
    async fn refresh(&self) -> Result<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .refresh_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow!("inventory service unavailable"));
        }
        Ok(())
    }

    fn snapshot(&self) -> InventorySnapshot {
        self.ours.lock().clone()
    }

    fn remove_item(&self, asset_id: &AssetId) {
        if self.ours.lock().remove_item(asset_id) {
            self.removed.lock().push(asset_id.clone());
        }
    }

    async fn fetch_partner(&self, partner: &PartnerId) -> Result<InventorySnapshot> {
        self.partners
            .lock()
            .get(partner)
            .cloned()
            .ok_or_else(|| anyhow!("inventory of {partner} is private"))
    }
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

/// Fixed price list.
#[derive(Debug, Clone, Default)]
pub struct StaticPrices {
    prices: PriceSnapshot,
}

impl StaticPrices {
    pub fn new(prices: PriceSnapshot) -> Self {
        Self { prices }
    }
}

#[async_trait]
impl PriceSource for StaticPrices {
    async fn price_for(&self, sku: &Sku) -> Option<PriceEntry> {
        self.prices.get(sku).copied()
    }
}

// ---------------------------------------------------------------------------
// Decision handler
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    verdicts: HashMap<ProposalId, Verdict>,
    default: Option<Verdict>,
    failing: HashSet<ProposalId>,
    decided: Vec<ProposalId>,
    actions: Vec<(ProposalId, Action, String)>,
    changes: Vec<(ProposalId, OfferState, OfferState)>,
}

/// Decision handler that returns pre-programmed verdicts and records what
/// the engine reported back.
#[derive(Default)]
pub struct ScriptedHandler {
    script: Mutex<Script>,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_verdict(&self, id: &ProposalId, verdict: Verdict) {
        self.script.lock().verdicts.insert(id.clone(), verdict);
    }

    /// Verdict for proposals without a scripted one. `None` leaves them
    /// alone.
    pub fn set_default(&self, verdict: Option<Verdict>) {
        self.script.lock().default = verdict;
    }

    pub fn fail_on(&self, id: &ProposalId) {
        self.script.lock().failing.insert(id.clone());
    }

    /// Proposals `decide` was called for, in call order.
    pub fn decided(&self) -> Vec<ProposalId> {
        self.script.lock().decided.clone()
    }

    pub fn actions(&self) -> Vec<(ProposalId, Action, String)> {
        self.script.lock().actions.clone()
    }

    /// `(id, old, new)` for every reconciled state change.
    pub fn changes(&self) -> Vec<(ProposalId, OfferState, OfferState)> {
        self.script.lock().changes.clone()
    }
}

#[async_trait]
impl OfferHandler for ScriptedHandler {
    async fn decide(&self, proposal: &Proposal) -> Result<Option<Verdict>> {
        let mut script = self.script.lock();
        script.decided.push(proposal.id.clone());
        if script.failing.contains(&proposal.id) {
            return Err(anyhow!("scripted failure for offer #{}", proposal.id));
        }
        Ok(script
            .verdicts
            .get(&proposal.id)
            .cloned()
            .or_else(|| script.default.clone()))
    }

    fn on_action(&self, proposal: &Proposal, action: Action, reason: &str) {
        self.script
            .lock()
            .actions
            .push((proposal.id.clone(), action, reason.to_string()));
    }

    fn on_offer_changed(&self, proposal: &Proposal, old_state: OfferState, _time_taken_ms: Option<i64>) {
        self.script
            .lock()
            .changes
            .push((proposal.id.clone(), old_state, proposal.state));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
