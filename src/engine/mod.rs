//! Reconciliation engine.
//!
//! Owns the intake queue, the ownership tracker and the poll data, and ties
//! them to the collaborators:
//!
//! intake → dispatcher → fetch → decide → apply (accept / decline / skip /
//! counter) → state-change reconciliation
//!
//! All mutable state sits behind one mutex that is never held across an
//! await point. The dispatcher is a single spawned task woken by `Notify`,
//! so exactly one proposal is in flight at a time.

pub mod escrow;
pub mod executor;
pub mod ownership;
pub mod poller;
pub mod queue;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::balance::{Balancer, CounterInput};
use crate::error::{ErrorClass, ServiceError, TradeError};
use crate::services::{
    Alert, AlertKind, Alerter, InventoryProvider, OfferHandler, PriceSource, TradeService,
};
use crate::types::{
    AcceptStatus, Action, AppliedAction, AssetId, Direction, OfferFilter, OfferMeta, OfferState,
    OfferValuation, PartnerId, PollData, PriceSnapshot, Proposal, ProposalDraft, ProposalId,
    Verdict, VerdictMeta, REASON_AUTO_RETRY, REASON_COUNTERED, REASON_COUNTER_FAILED,
    REASON_ESCROW, REASON_ESCROW_CHECK_FAILED, REASON_MANUAL_FORCE,
};

pub use escrow::{EscrowMonitor, EscrowSettings, HealthSnapshot, MaintenanceWindow, RestartDecision};
pub use executor::{ActionExecutor, RetryPolicy};
pub use ownership::OwnershipTracker;
pub use poller::{PollSummary, Poller};
pub use queue::{EnqueueOutcome, OfferQueue};

// ---------------------------------------------------------------------------
// Settings & collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    /// Delay before a failed accept/decline is retried automatically.
    pub action_retry_delay: Duration,
    /// How long the auto-retry markers live before they are cleared.
    pub retry_marker_ttl: Duration,
    /// Interval between inventory refresh attempts after a failure.
    pub inventory_retry_delay: Duration,
    pub poll_interval: Duration,
    /// Poll time between two verbose offer-list summaries.
    pub poll_summary_interval: Duration,
    /// Message attached to counter proposals.
    pub counter_message: String,
    pub dry_run: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            action_retry_delay: Duration::from_secs(30),
            retry_marker_ttl: Duration::from_secs(2 * 60),
            inventory_retry_delay: Duration::from_secs(30),
            poll_interval: Duration::from_secs(30),
            poll_summary_interval: Duration::from_secs(10 * 60),
            counter_message: "Your offer was countered so both sides are equal in value.".into(),
            dry_run: false,
        }
    }
}

/// Everything the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub service: Arc<dyn TradeService>,
    pub handler: Arc<dyn OfferHandler>,
    pub inventory: Arc<dyn InventoryProvider>,
    pub prices: Arc<dyn PriceSource>,
    pub alerts: Arc<dyn Alerter>,
}

/// What `apply_action` ended up doing.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Skipped,
    Accepted(AcceptStatus),
    Declined,
    /// Counter proposal sent under the given id.
    Countered(ProposalId),
    /// Counter could not be built or sent; the original was declined.
    CounterFailedDeclined,
    Failed {
        action: Action,
        class: ErrorClass,
        error: String,
    },
}

/// Point-in-time view of the engine for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub queue_len: usize,
    pub processing: bool,
    pub items_in_trade: usize,
    pub known_sent: usize,
    pub known_received: usize,
    pub pending_retries: usize,
    pub dry_run: bool,
    pub escrow: Option<HealthSnapshot>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EngineState {
    queue: OfferQueue,
    ownership: OwnershipTracker,
    poll: PollData,
    /// Proposals with an auto-retry already scheduled in the current window.
    retry_markers: HashSet<ProposalId>,
    marker_reset: Option<JoinHandle<()>>,
    inventory_retry: Option<JoinHandle<()>>,
    /// ActiveOnly polls since the last summary.
    poll_count: u32,
}

struct Inner {
    settings: EngineSettings,
    executor: ActionExecutor,
    balancer: Balancer,
    handler: Arc<dyn OfferHandler>,
    inventory: Arc<dyn InventoryProvider>,
    prices: Arc<dyn PriceSource>,
    alerts: Arc<dyn Alerter>,
    escrow: Option<EscrowMonitor>,
    state: Mutex<EngineState>,
    wake: Notify,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds()
}

/// Whether a terminal state is the one our applied action was aiming for.
fn action_matches_state(action: Action, state: OfferState) -> bool {
    match action {
        Action::Accept => state.is_accepted(),
        Action::Decline => state == OfferState::Declined,
        Action::Counter => matches!(state, OfferState::Countered | OfferState::Declined),
        Action::Skip => false,
    }
}

impl Engine {
    /// `escrow`, when given, gates intake: every fetched proposal is checked
    /// for escrow before the decision callback runs.
    pub fn new(
        collaborators: Collaborators,
        balancer: Balancer,
        settings: EngineSettings,
        escrow: Option<EscrowMonitor>,
    ) -> Self {
        let executor = ActionExecutor::new(
            collaborators.service.clone(),
            collaborators.inventory.clone(),
            settings.retry,
            settings.dry_run,
        );

        Self {
            inner: Arc::new(Inner {
                settings,
                executor,
                balancer,
                handler: collaborators.handler,
                inventory: collaborators.inventory,
                prices: collaborators.prices,
                alerts: collaborators.alerts,
                escrow,
                state: Mutex::new(EngineState::default()),
                wake: Notify::new(),
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn escrow(&self) -> Option<&EscrowMonitor> {
        self.inner.escrow.as_ref()
    }

    // -----------------------------------------------------------------------
    // Intake & dispatch
    // -----------------------------------------------------------------------

    /// A received proposal we have not seen before.
    pub fn on_new_offer(&self, proposal: &Proposal) {
        if proposal.is_glitched {
            warn!(offer_id = %proposal.id, partner = %proposal.partner, "Offer is glitched, ignoring it");
            return;
        }

        info!(offer_id = %proposal.id, partner = %proposal.partner, "Received offer");
        self.inner
            .state
            .lock()
            .poll
            .record_state(&proposal.id, proposal.direction, proposal.state);
        self.enqueue(proposal);
    }

    /// Queue a received proposal for processing. Idempotent per id.
    pub fn enqueue(&self, proposal: &Proposal) {
        let (outcome, position) = {
            let mut state = self.inner.state.lock();
            let outcome = state.queue.enqueue(proposal.id.clone());
            if outcome != EnqueueOutcome::Duplicate {
                let assets = proposal.give_assets();
                state.ownership.mark_all(assets.iter(), &proposal.id);
                let meta = state.poll.meta_mut(&proposal.id);
                meta.partner = Some(proposal.partner.clone());
                meta.our_items = Some(assets);
            }
            (outcome, state.queue.len())
        };

        match outcome {
            EnqueueOutcome::Duplicate => {
                debug!(offer_id = %proposal.id, "Offer is already queued");
            }
            EnqueueOutcome::StartNow => {
                debug!(offer_id = %proposal.id, "Queue was empty, processing offer now");
                self.inner.wake.notify_one();
            }
            EnqueueOutcome::Queued => {
                debug!(offer_id = %proposal.id, position, "Offer queued");
                self.inner.wake.notify_one();
            }
        }
    }

    /// Spawn the dispatcher task that drains the queue whenever woken.
    pub fn spawn_dispatcher(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                engine.inner.wake.notified().await;
                engine.process_queue().await;
            }
        })
    }

    /// Process queued proposals until the queue is empty.
    pub async fn process_queue(&self) {
        while self.process_next().await {}
    }

    /// Process the head of the queue. Returns `false` when there was nothing
    /// to do.
    pub async fn process_next(&self) -> bool {
        let Some(id) = self.inner.state.lock().queue.begin_next() else {
            return false;
        };

        debug!(offer_id = %id, "Handling offer");
        match self.inner.executor.fetch_offer(&id).await {
            Ok(Some(proposal)) => self.handle_offer(proposal).await,
            Ok(None) => {
                info!(offer_id = %id, "Offer is not active anymore, skipping");
                let mut state = self.inner.state.lock();
                state.ownership.release_proposal(&id);
                state.queue.finish(&id);
            }
            Err(e) => {
                let requeued = self.inner.state.lock().queue.requeue_to_tail(&id);
                if requeued {
                    warn!(offer_id = %id, error = %e, "Failed to get offer, moved it to the back of the queue");
                } else {
                    warn!(offer_id = %id, error = %e, "Failed to get offer, dropping it");
                }
            }
        }
        true
    }

    fn finish(&self, id: &ProposalId) {
        self.inner.state.lock().queue.finish(id);
    }

    async fn handle_offer(&self, proposal: Proposal) {
        let started = Utc::now();
        {
            let mut state = self.inner.state.lock();
            let meta = state.poll.meta_mut(&proposal.id);
            meta.partner = Some(proposal.partner.clone());
            meta.handle_timestamp = Some(started);
        }

        if let Some(verdict) = self.escrow_gate(&proposal).await {
            self.mark_handled(&proposal.id, started);
            self.apply_action(&proposal, verdict).await;
            self.finish(&proposal.id);
            return;
        }

        let verdict = match self.inner.handler.decide(&proposal).await {
            Ok(verdict) => verdict,
            Err(e) => {
                let err = TradeError::Handler(format!("{e:#}"));
                error!(offer_id = %proposal.id, error = %err, "Error occurred while handling offer");
                self.finish(&proposal.id);
                return;
            }
        };
        self.mark_handled(&proposal.id, started);

        match verdict {
            Some(verdict) => {
                self.apply_action(&proposal, verdict).await;
            }
            None => debug!(offer_id = %proposal.id, "Handler left the offer alone"),
        }
        self.finish(&proposal.id);
    }

    fn mark_handled(&self, id: &ProposalId, started: DateTime<Utc>) {
        let mut state = self.inner.state.lock();
        let meta = state.poll.meta_mut(id);
        meta.handled_by_us = true;
        meta.process_offer_ms = Some(elapsed_ms(started, Utc::now()));
    }

    /// Verdict forced by the escrow check, if intake checking is enabled.
    async fn escrow_gate(&self, proposal: &Proposal) -> Option<Verdict> {
        let monitor = self.inner.escrow.as_ref()?;
        match monitor.check_escrow(proposal).await {
            Ok(false) => None,
            Ok(true) => {
                info!(offer_id = %proposal.id, "Partner would hold the trade in escrow");
                Some(Verdict::new(Action::Decline, REASON_ESCROW))
            }
            Err(e) => {
                warn!(offer_id = %proposal.id, error = %e, "Escrow check failed, skipping offer");
                Some(Verdict::new(Action::Skip, REASON_ESCROW_CHECK_FAILED))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    /// Apply a verdict to a proposal.
    pub async fn apply_action(&self, proposal: &Proposal, verdict: Verdict) -> ActionOutcome {
        let Verdict {
            action,
            reason,
            meta,
            valuation,
        } = verdict;

        self.inner.handler.on_action(proposal, action, &reason);
        {
            let mut state = self.inner.state.lock();
            let entry = state.poll.meta_mut(&proposal.id);
            entry.action = Some(AppliedAction {
                action,
                reason: reason.clone(),
            });
            if action != Action::Counter {
                entry.meta = Some(meta.clone());
            }
            if let Some(valuation) = &valuation {
                entry.valuation = Some(valuation.clone());
            }
        }

        match action {
            Action::Skip => {
                let released = self.inner.state.lock().ownership.release_proposal(&proposal.id);
                info!(offer_id = %proposal.id, reason = %reason, released = released.len(), "Skipping offer");
                ActionOutcome::Skipped
            }
            Action::Accept => match self.accept_offer(proposal, &reason).await {
                Ok(status) => ActionOutcome::Accepted(status),
                Err(e) => {
                    self.on_failed_action(proposal, action, &reason, &e).await;
                    failed(action, &e)
                }
            },
            Action::Decline => match self.decline_offer(proposal, &reason).await {
                Ok(()) => ActionOutcome::Declined,
                Err(e) => {
                    self.on_failed_action(proposal, action, &reason, &e).await;
                    failed(action, &e)
                }
            },
            Action::Counter => match self.counter_offer(proposal, &meta, valuation.as_ref()).await {
                Ok(sent) => ActionOutcome::Countered(sent.id),
                Err(e) => {
                    self.on_failed_action(proposal, action, &reason, &e).await;
                    self.decline_after_failed_counter(proposal).await
                }
            },
        }
    }

    async fn decline_after_failed_counter(&self, proposal: &Proposal) -> ActionOutcome {
        self.inner
            .handler
            .on_action(proposal, Action::Decline, REASON_COUNTER_FAILED);
        self.inner.state.lock().poll.meta_mut(&proposal.id).action = Some(AppliedAction {
            action: Action::Decline,
            reason: REASON_COUNTER_FAILED.to_string(),
        });

        match self.decline_offer(proposal, REASON_COUNTER_FAILED).await {
            Ok(()) => ActionOutcome::CounterFailedDeclined,
            Err(e) => {
                self.on_failed_action(proposal, Action::Decline, REASON_COUNTER_FAILED, &e)
                    .await;
                failed(Action::Decline, &e)
            }
        }
    }

    fn record_action_timing(&self, id: &ProposalId, started: DateTime<Utc>) {
        let finished = Utc::now();
        let mut state = self.inner.state.lock();
        let meta = state.poll.meta_mut(id);
        meta.action_timestamp = Some(finished);
        meta.action_ms = Some(elapsed_ms(started, finished));
    }

    async fn accept_offer(&self, proposal: &Proposal, reason: &str) -> Result<AcceptStatus, TradeError> {
        info!(offer_id = %proposal.id, reason, "Accepting offer");
        let started = Utc::now();
        let status = self.inner.executor.accept(&proposal.id).await?;
        self.record_action_timing(&proposal.id, started);

        info!(offer_id = %proposal.id, status = ?status, "Offer accepted");
        if status == AcceptStatus::Pending {
            self.spawn_confirmation(proposal.id.clone(), true);
        }
        Ok(status)
    }

    async fn decline_offer(&self, proposal: &Proposal, reason: &str) -> Result<(), TradeError> {
        info!(offer_id = %proposal.id, reason, "Declining offer");
        let started = Utc::now();
        self.inner.executor.decline(&proposal.id).await?;
        self.record_action_timing(&proposal.id, started);
        info!(offer_id = %proposal.id, "Offer declined");
        Ok(())
    }

    fn spawn_confirmation(&self, id: ProposalId, retry_on_failure: bool) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.confirm_offer(&id, retry_on_failure).await;
        });
    }

    async fn confirm_offer(&self, id: &ProposalId, retry_on_failure: bool) {
        debug!(offer_id = %id, "Accepting mobile confirmation");
        let started = Utc::now();
        match self.inner.executor.confirm(id).await {
            Ok(()) => {
                self.inner.state.lock().poll.meta_mut(id).confirmation_ms =
                    Some(elapsed_ms(started, Utc::now()));
                info!(offer_id = %id, "Confirmation accepted");
            }
            Err(e) => {
                if e.as_service()
                    .is_some_and(ServiceError::is_ignored_confirmation_error)
                {
                    debug!(offer_id = %id, error = %e, "Confirmation already handled");
                    return;
                }

                warn!(offer_id = %id, error = %e, "Error while trying to accept mobile confirmation");
                self.inner
                    .alerts
                    .alert(
                        Alert::new(
                            AlertKind::ErrorAccept,
                            format!("Error while trying to accept mobile confirmation for offer #{id}"),
                        )
                        .with_error(&e)
                        .with_offer(id),
                    )
                    .await;

                if retry_on_failure {
                    self.schedule_retry(id.clone(), Action::Accept);
                }
            }
        }
    }

    async fn on_failed_action(&self, proposal: &Proposal, action: Action, reason: &str, err: &TradeError) {
        let id = &proposal.id;
        if err.is_invalid_state() {
            warn!(offer_id = %id, action = %action, error = %err, "Offer is no longer actionable");
            return;
        }
        warn!(
            offer_id = %id,
            action = %action,
            reason,
            class = ?err.class(),
            error = %err,
            "Failed to apply action"
        );

        let Some(kind) = AlertKind::for_failed(action) else {
            return;
        };
        let retries = matches!(action, Action::Accept | Action::Decline)
            && reason != REASON_MANUAL_FORCE
            && reason != REASON_AUTO_RETRY;

        let suffix = if action == Action::Counter {
            "The offer has been automatically declined.".to_string()
        } else if retries {
            format!(
                "Retrying in {} seconds, or you can try to force {action} this trade, send \"!f{action} {id}\" now.",
                self.inner.settings.action_retry_delay.as_secs()
            )
        } else {
            format!("You can try to force {action} this trade, send \"!f{action} {id}\" now.")
        };

        self.inner
            .alerts
            .alert(
                Alert::new(kind, format!("Failed to {action} on the offer #{id}. {suffix}"))
                    .with_error(err)
                    .with_offer(id),
            )
            .await;

        if retries {
            self.schedule_retry(id.clone(), action);
        }
    }

    /// Retry an action later, at most once per proposal per marker window.
    fn schedule_retry(&self, id: ProposalId, action: Action) {
        let delay = self.inner.settings.action_retry_delay;
        let ttl = self.inner.settings.retry_marker_ttl;
        {
            let mut state = self.inner.state.lock();
            if !state.retry_markers.insert(id.clone()) {
                debug!(offer_id = %id, "Automatic retry already scheduled");
                return;
            }

            let engine = self.clone();
            let reset = tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                engine.inner.state.lock().retry_markers.clear();
            });
            if let Some(previous) = state.marker_reset.replace(reset) {
                previous.abort();
            }
        }

        info!(offer_id = %id, action = %action, delay_secs = delay.as_secs(), "Scheduling automatic retry");
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.retry_action_after_failure(&id, action).await;
        });
    }

    async fn retry_action_after_failure(&self, id: &ProposalId, action: Action) {
        let known = self.inner.state.lock().poll.received.contains_key(id);
        if !known {
            debug!(offer_id = %id, "Offer is not a known received offer, not retrying");
            return;
        }

        let proposal = match self.inner.executor.fetch_offer(id).await {
            Ok(Some(proposal)) => proposal,
            Ok(None) => {
                debug!(offer_id = %id, "Offer is no longer active, not retrying");
                return;
            }
            Err(e) => {
                warn!(offer_id = %id, error = %e, "Failed to get offer for automatic retry");
                return;
            }
        };

        info!(offer_id = %id, action = %action, "Retrying action");
        let mut verdict = Verdict::new(action, REASON_AUTO_RETRY);
        if action == Action::Accept {
            verdict.meta = self.stored_verdict_meta(id);
        }
        self.apply_action(&proposal, verdict).await;
    }

    fn stored_verdict_meta(&self, id: &ProposalId) -> VerdictMeta {
        self.inner
            .state
            .lock()
            .poll
            .offer_data
            .get(id)
            .and_then(|m| m.meta.clone())
            .unwrap_or_default()
    }

    /// Apply accept or decline on operator request.
    pub async fn force_action(&self, id: &ProposalId, action: Action) -> Result<ActionOutcome, TradeError> {
        let Some(proposal) = self.inner.executor.fetch_offer(id).await? else {
            return Err(TradeError::UnknownOffer(id.clone()));
        };

        info!(offer_id = %id, action = %action, "Forcing action");
        let mut verdict = Verdict::new(action, REASON_MANUAL_FORCE);
        if action == Action::Accept {
            verdict.meta = self.stored_verdict_meta(id);
        }
        Ok(self.apply_action(&proposal, verdict).await)
    }

    // -----------------------------------------------------------------------
    // Counter & send
    // -----------------------------------------------------------------------

    async fn counter_offer(
        &self,
        proposal: &Proposal,
        verdict_meta: &VerdictMeta,
        valuation: Option<&OfferValuation>,
    ) -> Result<Proposal, TradeError> {
        let started = Utc::now();
        let valuation = match valuation {
            Some(v) => v.clone(),
            None => self
                .offer_meta(&proposal.id)
                .and_then(|m| m.valuation)
                .ok_or_else(|| TradeError::MissingValuation(proposal.id.clone()))?,
        };

        info!(offer_id = %proposal.id, "Countering offer");
        let their_inventory = self
            .inner
            .inventory
            .fetch_partner(&proposal.partner)
            .await
            .map_err(|e| TradeError::InventoryUnavailable(format!("{e:#}")))?;

        let committed = self.inner.state.lock().ownership.items_excluding(&proposal.id);
        let our_inventory = self.inner.inventory.snapshot().without(&committed);

        let mut listed = PriceSnapshot::new();
        for sku in &self.inner.balancer.options().fallback_kinds {
            if let Some(price) = self.inner.prices.price_for(sku).await {
                listed.insert(sku.clone(), price);
            }
        }

        let plan = self.inner.balancer.balance(CounterInput {
            valuation: &valuation,
            our_offered: &proposal.items_to_give,
            their_offered: &proposal.items_to_receive,
            our_inventory: &our_inventory,
            their_inventory: &their_inventory,
            listed_prices: &listed,
        })?;

        let (give, receive) = plan.apply(&proposal.items_to_give, &proposal.items_to_receive);
        let draft = ProposalDraft {
            partner: proposal.partner.clone(),
            items_to_give: give,
            items_to_receive: receive,
            message: self.inner.settings.counter_message.clone(),
            countering: Some(proposal.id.clone()),
        };

        let original = self.offer_meta(&proposal.id).unwrap_or_default();
        let meta = OfferMeta {
            notify: true,
            handle_timestamp: original.handle_timestamp,
            process_offer_ms: original.process_offer_ms,
            process_counter_ms: Some(elapsed_ms(started, Utc::now())),
            action: Some(AppliedAction {
                action: Action::Counter,
                reason: REASON_COUNTERED.to_string(),
            }),
            meta: Some(verdict_meta.clone()),
            valuation: Some(plan.valuation.clone()),
            ..OfferMeta::default()
        };

        debug!(
            offer_id = %proposal.id,
            add_ours = plan.add_ours.len(),
            remove_ours = plan.remove_ours.len(),
            add_theirs = plan.add_theirs.len(),
            remove_theirs = plan.remove_theirs.len(),
            fallback = ?plan.fallback.as_ref().map(|i| i.sku.as_str()),
            "Counter plan ready"
        );

        let sent = self.send_offer(draft, meta).await?;
        if sent.state == OfferState::NeedsConfirmation {
            self.spawn_confirmation(sent.id.clone(), false);
        }
        Ok(sent)
    }

    /// Send a proposal, committing its give side while the send is in
    /// flight. `meta` is stored under the id the remote assigns.
    pub async fn send_offer(&self, draft: ProposalDraft, meta: OfferMeta) -> Result<Proposal, TradeError> {
        let pending = ProposalId::new(format!("pending-{}", Uuid::new_v4()));
        let assets = draft.give_assets();
        self.inner
            .state
            .lock()
            .ownership
            .mark_all(assets.iter(), &pending);

        let started = Utc::now();
        match self.inner.executor.send(&draft).await {
            Ok(sent) => {
                let finished = Utc::now();
                {
                    let mut state = self.inner.state.lock();
                    let holds = sent.state.holds_items();
                    if holds {
                        state.ownership.rehome(&pending, &sent.id);
                    } else {
                        state.ownership.release_proposal(&pending);
                    }
                    state.poll.record_state(&sent.id, Direction::Sent, sent.state);
                    *state.poll.meta_mut(&sent.id) = OfferMeta {
                        partner: Some(sent.partner.clone()),
                        handled_by_us: true,
                        our_items: holds.then_some(assets),
                        action_timestamp: Some(finished),
                        action_ms: Some(elapsed_ms(started, finished)),
                        ..meta
                    };
                }
                info!(offer_id = %sent.id, state = %sent.state, partner = %sent.partner, "Offer sent");
                Ok(sent)
            }
            Err(e) => {
                self.inner.state.lock().ownership.release_proposal(&pending);
                warn!(partner = %draft.partner, error = %e, "Failed to send offer");
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // State sync
    // -----------------------------------------------------------------------

    /// Reconcile a proposal whose remote state changed from `old_state`.
    pub async fn on_offer_changed(&self, proposal: &Proposal, old_state: OfferState) {
        let now = Utc::now();
        let (applied, time_taken) = {
            let mut state = self.inner.state.lock();
            state
                .poll
                .record_state(&proposal.id, proposal.direction, proposal.state);

            let mut time_taken = None;
            if proposal.state.holds_items() {
                let assets = proposal.give_assets();
                state.ownership.mark_all(assets.iter(), &proposal.id);
                let meta = state.poll.meta_mut(&proposal.id);
                if proposal.is_ours() && meta.our_items.is_none() {
                    meta.our_items = Some(assets);
                }
            } else {
                state.ownership.release_proposal(&proposal.id);
                let meta = state.poll.meta_mut(&proposal.id);
                meta.our_items = None;
                meta.finish_timestamp = Some(now);
                time_taken = meta
                    .handle_timestamp
                    .or(meta.action_timestamp)
                    .map(|t| elapsed_ms(t, now));
            }

            let meta = state.poll.meta_mut(&proposal.id);
            if proposal.state.is_accepted() {
                meta.is_accepted = true;
            }
            (meta.action.clone(), time_taken)
        };

        match applied.filter(|a| action_matches_state(a.action, proposal.state)) {
            Some(applied) => info!(
                offer_id = %proposal.id,
                old_state = %old_state,
                new_state = %proposal.state,
                reason = %applied.reason,
                "Offer state changed"
            ),
            None => info!(
                offer_id = %proposal.id,
                old_state = %old_state,
                new_state = %proposal.state,
                "Offer state changed"
            ),
        }

        if proposal.state.is_accepted() {
            for item in &proposal.items_to_give {
                self.inner.inventory.remove_item(&item.asset_id);
            }
        }

        self.refresh_inventory().await;
        self.inner
            .handler
            .on_offer_changed(proposal, old_state, time_taken);
    }

    async fn refresh_inventory(&self) {
        match self.inner.inventory.refresh().await {
            Ok(()) => {
                if let Some(retry) = self.inner.state.lock().inventory_retry.take() {
                    retry.abort();
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retry_secs = self.inner.settings.inventory_retry_delay.as_secs(),
                    "Failed to refresh inventory, retrying later"
                );
                self.spawn_inventory_retry();
            }
        }
    }

    fn spawn_inventory_retry(&self) {
        let engine = self.clone();
        let delay = self.inner.settings.inventory_retry_delay;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                match engine.inner.inventory.refresh().await {
                    Ok(()) => {
                        debug!("Inventory refreshed");
                        break;
                    }
                    Err(e) => warn!(error = %e, "Failed to refresh inventory"),
                }
            }
        });

        if let Some(previous) = self.inner.state.lock().inventory_retry.replace(handle) {
            previous.abort();
        }
    }

    /// Called with every polled offer list.
    pub fn on_offer_list(&self, filter: OfferFilter, sent: &[Proposal], received: &[Proposal]) {
        let (to_enqueue, summary) = {
            let mut state = self.inner.state.lock();

            for proposal in sent.iter().chain(received) {
                if !proposal.state.holds_items() {
                    if let Some(meta) = state.poll.offer_data.get_mut(&proposal.id) {
                        meta.our_items = None;
                    }
                }
            }

            let mut summary = None;
            if filter == OfferFilter::ActiveOnly {
                state.poll_count = state.poll_count.saturating_add(1);
                let elapsed = self
                    .inner
                    .settings
                    .poll_interval
                    .saturating_mul(state.poll_count);
                if elapsed >= self.inner.settings.poll_summary_interval {
                    state.poll_count = 0;
                    let active = |list: &[Proposal]| {
                        list.iter().filter(|p| p.state == OfferState::Active).count()
                    };
                    let on_hold = sent
                        .iter()
                        .chain(received)
                        .filter(|p| p.state == OfferState::InEscrow)
                        .count();
                    summary = Some((active(received), active(sent), on_hold));
                }
            }

            let to_enqueue: Vec<&Proposal> = received
                .iter()
                .filter(|p| p.state == OfferState::Active)
                .filter(|p| {
                    !state
                        .poll
                        .offer_data
                        .get(&p.id)
                        .is_some_and(|m| m.handled_by_us)
                })
                .collect();
            (to_enqueue, summary)
        };

        if let Some((incoming, outgoing, on_hold)) = summary {
            info!(incoming, outgoing, on_hold, "Offer summary");
        }
        for proposal in to_enqueue {
            self.enqueue(proposal);
        }
    }

    /// Restore persisted poll data and rebuild the ownership set from it.
    pub fn set_poll_data(&self, poll: PollData) {
        let mut ownership = OwnershipTracker::new();
        let held = poll
            .sent
            .iter()
            .chain(poll.received.iter())
            .filter(|(_, s)| s.holds_items());
        for (id, _) in held {
            if let Some(items) = poll.offer_data.get(id).and_then(|m| m.our_items.as_ref()) {
                ownership.mark_all(items.iter(), id);
            }
        }

        info!(
            sent = poll.sent.len(),
            received = poll.received.len(),
            items_in_trade = ownership.len(),
            "Restored poll data"
        );
        let mut state = self.inner.state.lock();
        state.ownership = ownership;
        state.poll = poll;
    }

    /// Track a proposal without running any intake logic. Proposals that
    /// hold items commit their give side.
    pub fn record_state(&self, proposal: &Proposal) {
        let mut state = self.inner.state.lock();
        state
            .poll
            .record_state(&proposal.id, proposal.direction, proposal.state);
        if proposal.state.holds_items() {
            let assets = proposal.give_assets();
            state.ownership.mark_all(assets.iter(), &proposal.id);
            let meta = state.poll.meta_mut(&proposal.id);
            meta.partner = Some(proposal.partner.clone());
            if meta.our_items.is_none() {
                meta.our_items = Some(assets);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn is_item_in_trade(&self, asset_id: &AssetId) -> bool {
        self.inner.state.lock().ownership.is_in_trade(asset_id)
    }

    /// First active proposal we sent to `partner`.
    pub fn active_proposal_with(&self, partner: &PartnerId) -> Option<ProposalId> {
        let state = self.inner.state.lock();
        state
            .poll
            .sent
            .iter()
            .filter(|(_, s)| **s == OfferState::Active)
            .map(|(id, _)| id)
            .find(|id| {
                state
                    .poll
                    .offer_data
                    .get(*id)
                    .and_then(|m| m.partner.as_ref())
                    == Some(partner)
            })
            .cloned()
    }

    /// Number of known proposals per partner.
    pub fn trades_with_people(&self, partners: &[PartnerId]) -> BTreeMap<PartnerId, usize> {
        let state = self.inner.state.lock();
        let mut counts: BTreeMap<PartnerId, usize> =
            partners.iter().map(|p| (p.clone(), 0)).collect();
        for meta in state.poll.offer_data.values() {
            if let Some(count) = meta.partner.as_ref().and_then(|p| counts.get_mut(p)) {
                *count += 1;
            }
        }
        counts
    }

    pub async fn find_matching_offer(
        &self,
        proposal: &Proposal,
        is_sent: bool,
    ) -> Result<Option<Proposal>, TradeError> {
        self.inner.executor.find_matching_offer(proposal, is_sent).await
    }

    pub fn poll_data(&self) -> PollData {
        self.inner.state.lock().poll.clone()
    }

    pub fn known_state(&self, id: &ProposalId) -> Option<OfferState> {
        self.inner.state.lock().poll.state_of(id)
    }

    /// Known proposals whose last recorded state holds items.
    pub fn held_proposals(&self) -> Vec<(ProposalId, OfferState)> {
        let state = self.inner.state.lock();
        state
            .poll
            .sent
            .iter()
            .chain(state.poll.received.iter())
            .filter(|(_, s)| s.holds_items())
            .map(|(id, s)| (id.clone(), *s))
            .collect()
    }

    pub fn offer_meta(&self, id: &ProposalId) -> Option<OfferMeta> {
        self.inner.state.lock().poll.offer_data.get(id).cloned()
    }

    pub fn queue_snapshot(&self) -> Vec<ProposalId> {
        self.inner.state.lock().queue.snapshot()
    }

    pub fn items_in_trade(&self) -> BTreeSet<AssetId> {
        self.inner.state.lock().ownership.items()
    }

    pub fn status(&self) -> EngineStatus {
        let escrow = self.inner.escrow.as_ref().map(EscrowMonitor::snapshot);
        let state = self.inner.state.lock();
        EngineStatus {
            queue_len: state.queue.len(),
            processing: state.queue.is_processing(),
            items_in_trade: state.ownership.len(),
            known_sent: state.poll.sent.len(),
            known_received: state.poll.received.len(),
            pending_retries: state.retry_markers.len(),
            dry_run: self.inner.settings.dry_run,
            escrow,
        }
    }
}

fn failed(action: Action, err: &TradeError) -> ActionOutcome {
    ActionOutcome::Failed {
        action,
        class: err.class(),
        error: err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
