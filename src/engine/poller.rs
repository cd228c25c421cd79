//! Offer-list poller.
//!
//! Diffs the remote offer list against the states the engine already knows
//! and feeds the differences into the engine: unseen received proposals go
//! to intake, state transitions go to state-change reconciliation.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::Engine;
use crate::error::{ServiceError, TradeError};
use crate::services::TradeService;
use crate::types::{Direction, OfferFilter, OfferState};

/// What one poll found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub new_offers: usize,
    pub changed: usize,
    pub sent_active: usize,
    pub received_active: usize,
}

pub struct Poller {
    engine: Engine,
    service: Arc<dyn TradeService>,
}

impl Poller {
    pub fn new(engine: Engine, service: Arc<dyn TradeService>) -> Self {
        Self { engine, service }
    }

    pub async fn poll_once(&self) -> Result<PollSummary, TradeError> {
        let list = self.service.get_offers(OfferFilter::ActiveOnly).await?;
        let mut summary = PollSummary {
            sent_active: list.sent.len(),
            received_active: list.received.len(),
            ..PollSummary::default()
        };

        let mut seen = HashSet::new();
        for proposal in list.received.iter().chain(list.sent.iter()) {
            seen.insert(proposal.id.clone());
            match self.engine.known_state(&proposal.id) {
                None if proposal.direction == Direction::Received
                    && proposal.state == OfferState::Active =>
                {
                    self.engine.on_new_offer(proposal);
                    summary.new_offers += 1;
                }
                None => self.engine.record_state(proposal),
                Some(old) if old != proposal.state => {
                    self.engine.on_offer_changed(proposal, old).await;
                    summary.changed += 1;
                }
                Some(_) => {}
            }
        }

        // Proposals that dropped out of the active list changed state
        // somewhere; look them up individually.
        let missing: Vec<_> = self
            .engine
            .held_proposals()
            .into_iter()
            .filter(|(id, _)| !seen.contains(id))
            .collect();

        for (id, old) in missing {
            match self.service.get_offer(&id).await {
                Ok(proposal) if proposal.state != old => {
                    self.engine.on_offer_changed(&proposal, old).await;
                    summary.changed += 1;
                }
                Ok(_) => {}
                Err(ServiceError::NoMatch) => {
                    debug!(offer_id = %id, "Offer disappeared from the remote service");
                }
                Err(e) => warn!(offer_id = %id, error = %e, "Failed to look up offer"),
            }
        }

        self.engine
            .on_offer_list(OfferFilter::ActiveOnly, &list.sent, &list.received);

        debug!(
            new_offers = summary.new_offers,
            changed = summary.changed,
            sent_active = summary.sent_active,
            received_active = summary.received_active,
            "Poll complete"
        );
        Ok(summary)
    }
}
