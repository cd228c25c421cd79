//! Action executor.
//!
//! Runs accept / decline / send / confirm against the remote service with
//! bounded retry and exponential backoff, and classifies failures as
//! retryable or fatal. In dry-run mode mutations are logged but never sent.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ResultCode, ServiceError, TradeError};
use crate::services::{InventoryProvider, TradeService};
use crate::types::{
    AcceptStatus, Direction, OfferFilter, OfferState, Proposal, ProposalDraft, ProposalId,
};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls before giving up.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// Base for the wait before looking for a proposal a timed-out send may
    /// have created.
    pub send_timeout_backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            send_timeout_backoff_base: Duration::from_secs(4),
        }
    }
}

/// `2^attempt * base` plus up to one `base` of jitter.
pub fn exponential_backoff(attempt: u32, base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let exp = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    let jitter = if base_ms > 0 {
        rand::thread_rng().gen_range(0..base_ms)
    } else {
        0
    };
    Duration::from_millis(exp.saturating_add(jitter))
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct ActionExecutor {
    service: Arc<dyn TradeService>,
    inventory: Arc<dyn InventoryProvider>,
    policy: RetryPolicy,
    dry_run: bool,
}

impl ActionExecutor {
    pub fn new(
        service: Arc<dyn TradeService>,
        inventory: Arc<dyn InventoryProvider>,
        policy: RetryPolicy,
        dry_run: bool,
    ) -> Self {
        Self {
            service,
            inventory,
            policy,
            dry_run,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Wait before the next attempt. A successful session refresh skips the
    /// wait entirely.
    async fn pause_before_retry(&self, op: &'static str, attempt: u32, err: &ServiceError) {
        if err.is_session_loss() {
            match self.service.refresh_session().await {
                Ok(()) => {
                    debug!(op, attempt, "Session re-established, retrying immediately");
                    return;
                }
                Err(e) => warn!(op, attempt, error = %e, "Failed to re-establish session"),
            }
        }

        let delay = exponential_backoff(attempt, self.policy.backoff_base);
        debug!(
            op,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after backoff"
        );
        tokio::time::sleep(delay).await;
    }

    /// Fresh copy of a proposal. `None` when it no longer exists or is no
    /// longer active.
    pub async fn fetch_offer(&self, id: &ProposalId) -> Result<Option<Proposal>, TradeError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.service.get_offer(id).await {
                Ok(proposal) if proposal.state == OfferState::Active => return Ok(Some(proposal)),
                Ok(proposal) => {
                    debug!(offer_id = %id, state = %proposal.state, "Offer is not active");
                    return Ok(None);
                }
                Err(ServiceError::NoMatch) => {
                    debug!(offer_id = %id, "Offer does not exist");
                    return Ok(None);
                }
                Err(e) => e,
            };

            if attempt >= self.policy.max_attempts {
                return Err(err.into());
            }
            self.pause_before_retry("get_offer", attempt, &err).await;
        }
    }

    pub async fn accept(&self, id: &ProposalId) -> Result<AcceptStatus, TradeError> {
        if self.dry_run {
            info!(offer_id = %id, "[DRY RUN] Would accept offer");
            return Ok(AcceptStatus::Accepted);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.service.accept(id).await {
                Ok(status) => return Ok(status),
                Err(e) => e,
            };

            if attempt >= self.policy.max_attempts || err.is_fatal_for_accept() {
                return Err(err.into());
            }
            self.pause_before_retry("accept", attempt, &err).await;
        }
    }

    pub async fn decline(&self, id: &ProposalId) -> Result<(), TradeError> {
        if self.dry_run {
            info!(offer_id = %id, "[DRY RUN] Would decline offer");
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.service.decline(id).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if attempt >= self.policy.max_attempts || err.is_fatal_for_accept() {
                return Err(err.into());
            }
            self.pause_before_retry("decline", attempt, &err).await;
        }
    }

    pub async fn confirm(&self, id: &ProposalId) -> Result<(), TradeError> {
        if self.dry_run {
            info!(offer_id = %id, "[DRY RUN] Would accept mobile confirmation");
            return Ok(());
        }
        self.service.confirm(id).await.map_err(TradeError::from)
    }

    /// Send a proposal. A timed-out send is resolved by adopting the
    /// proposal it may have created instead of sending a duplicate.
    pub async fn send(&self, draft: &ProposalDraft) -> Result<Proposal, TradeError> {
        if self.dry_run {
            info!(
                partner = %draft.partner,
                give = draft.items_to_give.len(),
                receive = draft.items_to_receive.len(),
                "[DRY RUN] Would send offer"
            );
            let now = Utc::now();
            return Ok(Proposal {
                id: ProposalId::new(format!("dry-run-{}", Uuid::new_v4())),
                partner: draft.partner.clone(),
                direction: Direction::Sent,
                state: OfferState::Invalid,
                items_to_give: draft.items_to_give.clone(),
                items_to_receive: draft.items_to_receive.clone(),
                message: draft.message.clone(),
                is_glitched: false,
                created_at: now,
                updated_at: now,
            });
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.service.send(draft).await {
                Ok(proposal) => return Ok(proposal),
                Err(e) => e,
            };

            if err.is_fatal_send_message() || matches!(err, ServiceError::Cause { .. }) {
                return Err(err.into());
            }

            match err.result_code() {
                Some(ResultCode::Revoked) => {
                    // Some items are gone; make sure the next attempt sees that.
                    if let Err(e) = self.inventory.refresh().await {
                        warn!(error = %e, "Failed to refresh inventory after revoked send");
                    }
                    return Err(err.into());
                }
                Some(ResultCode::Timeout) => {
                    let delay = exponential_backoff(attempt, self.policy.send_timeout_backoff_base);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Send timed out, waiting before looking for a matching offer"
                    );
                    tokio::time::sleep(delay).await;

                    if let Some(found) = self.find_matching(draft).await? {
                        info!(offer_id = %found.id, state = %found.state, "Adopted offer created by timed-out send");
                        return Ok(found);
                    }
                    if attempt >= self.policy.max_attempts {
                        return Err(err.into());
                    }
                    continue;
                }
                Some(_) => return Err(err.into()),
                None => {}
            }

            if attempt >= self.policy.max_attempts {
                return Err(err.into());
            }
            self.pause_before_retry("send", attempt, &err).await;
        }
    }

    /// Active sent proposal structurally identical to a draft.
    pub async fn find_matching(&self, draft: &ProposalDraft) -> Result<Option<Proposal>, TradeError> {
        let list = self.service.get_offers(OfferFilter::ActiveOnly).await?;
        Ok(list.sent.into_iter().find(|p| p.matches_draft(draft)))
    }

    /// Active proposal in the given direction structurally identical to
    /// `proposal`.
    pub async fn find_matching_offer(
        &self,
        proposal: &Proposal,
        is_sent: bool,
    ) -> Result<Option<Proposal>, TradeError> {
        let list = self.service.get_offers(OfferFilter::ActiveOnly).await?;
        let pool = if is_sent { list.sent } else { list.received };
        Ok(pool.into_iter().find(|p| p.structurally_equals(proposal)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
