//! Test harness for engine integration tests.
//!
//! Wires an `Engine` to the in-memory paper collaborators with all timings
//! shrunk to milliseconds. Every collaborator is kept so tests can seed
//! offers, inject failures and inspect what the engine did.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use offer_reconciler::balance::{to_refined, Balancer, BalancerOptions, CurrencyLadder};
use offer_reconciler::engine::{
    Collaborators, Engine, EngineSettings, EscrowMonitor, EscrowSettings, MaintenanceWindow, Poller,
    RetryPolicy,
};
use offer_reconciler::services::alerts::MemoryAlerter;
use offer_reconciler::services::paper::{PaperInventory, PaperTradeService, ScriptedHandler, StaticPrices};
use offer_reconciler::services::supervisor::EnvSupervisor;
use offer_reconciler::services::{AlertKind, ReachabilityProbe};
use offer_reconciler::types::{
    Currencies, Direction, ItemsDict, OfferState, OfferValuation, PartnerId, PriceEntry,
    PriceSnapshot, Proposal, ProposalId, SideValue, Sku, TradeItem, Valuation,
};

pub const PARTNER: &str = "76561198000000001";
pub const HAT_OURS: &str = "30000;6";
pub const HAT_THEIRS: &str = "30001;6";
pub const WEAPON: &str = "45;6";
pub const SCRAP: &str = "5000;6";

/// Probe that always answers.
pub struct UpProbe;

#[async_trait]
impl ReachabilityProbe for UpProbe {
    async fn probe(&self, _partner: &PartnerId) -> Result<()> {
        Ok(())
    }
}

pub struct Harness {
    pub engine: Engine,
    pub service: Arc<PaperTradeService>,
    pub inventory: Arc<PaperInventory>,
    pub handler: Arc<ScriptedHandler>,
    pub alerts: Arc<MemoryAlerter>,
    pub restart_signal: Arc<Notify>,
}

pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy {
            max_attempts: 2,
            backoff_base: Duration::from_millis(1),
            send_timeout_backoff_base: Duration::from_millis(1),
        },
        action_retry_delay: Duration::from_millis(50),
        retry_marker_ttl: Duration::from_millis(500),
        inventory_retry_delay: Duration::from_millis(20),
        poll_interval: Duration::from_secs(30),
        poll_summary_interval: Duration::from_secs(600),
        counter_message: "countered".into(),
        dry_run: false,
    }
}

pub fn fast_escrow_settings() -> EscrowSettings {
    EscrowSettings {
        failure_threshold: 2,
        max_attempts: 2,
        backoff_base: Duration::from_millis(1),
        max_session_resets: 1,
        restart_trigger_delay: Duration::from_millis(100),
        restart_cooldown: Duration::from_secs(3600),
        maintenance: MaintenanceWindow::default(),
    }
}

impl Harness {
    /// Engine without the escrow intake gate. `our_items` seeds our
    /// inventory.
    pub fn new(our_items: &[TradeItem]) -> Self {
        Self::build(our_items, false)
    }

    /// Engine with the escrow intake gate and a supervised restart signal.
    pub fn with_escrow(our_items: &[TradeItem]) -> Self {
        Self::build(our_items, true)
    }

    fn build(our_items: &[TradeItem], escrow: bool) -> Self {
        let service = Arc::new(PaperTradeService::new());
        let inventory = Arc::new(PaperInventory::new(our_items));
        let handler = Arc::new(ScriptedHandler::new());
        let alerts = Arc::new(MemoryAlerter::new());
        let restart_signal = Arc::new(Notify::new());

        let monitor = escrow.then(|| {
            // Fixed Wednesday afternoon, outside the maintenance window.
            let clock = Arc::new(|| Utc.with_ymd_and_hms(2026, 10, 21, 15, 0, 0).unwrap());
            EscrowMonitor::with_clock(
                service.clone(),
                Arc::new(UpProbe),
                Some(Arc::new(EnvSupervisor::new(true, restart_signal.clone()))),
                alerts.clone(),
                fast_escrow_settings(),
                clock,
            )
        });

        let collaborators = Collaborators {
            service: service.clone(),
            handler: handler.clone(),
            inventory: inventory.clone(),
            prices: Arc::new(StaticPrices::new(PriceSnapshot::new())),
            alerts: alerts.clone(),
        };
        let options = BalancerOptions {
            fallback_kinds: vec![Sku::new(WEAPON)],
            ..BalancerOptions::default()
        };
        let engine = Engine::new(
            collaborators,
            Balancer::new(CurrencyLadder::standard(), options),
            fast_settings(),
            monitor,
        );

        Self {
            engine,
            service,
            inventory,
            handler,
            alerts,
            restart_signal,
        }
    }

    pub fn poller(&self) -> Poller {
        Poller::new(self.engine.clone(), self.service.clone())
    }

    /// Seed a proposal remotely and hand it to the engine as new.
    pub fn receive(&self, proposal: Proposal) {
        self.service.add_offer(proposal.clone());
        self.engine.on_new_offer(&proposal);
    }

    pub fn alert_kinds(&self) -> Vec<AlertKind> {
        self.alerts.alerts().into_iter().map(|a| a.kind).collect()
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn item(asset_id: &str, sku: &str) -> TradeItem {
    TradeItem::new(asset_id, sku)
}

pub fn received(id: &str, give: &[TradeItem], receive: &[TradeItem]) -> Proposal {
    Proposal {
        id: ProposalId::new(id),
        partner: PartnerId::new(PARTNER),
        direction: Direction::Received,
        state: OfferState::Active,
        items_to_give: give.to_vec(),
        items_to_receive: receive.to_vec(),
        message: String::new(),
        is_glitched: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn sent(id: &str, give: &[TradeItem]) -> Proposal {
    Proposal {
        direction: Direction::Sent,
        ..received(id, give, &[])
    }
}

pub fn id(value: &str) -> ProposalId {
    ProposalId::new(value)
}

fn side(total: Decimal) -> SideValue {
    SideValue {
        total,
        keys: 0,
        metal: to_refined(total),
    }
}

fn price(buy: Decimal, sell: Decimal) -> PriceEntry {
    PriceEntry {
        buy: Currencies::new(0, buy),
        sell: Currencies::new(0, sell),
    }
}

/// Our hat (12.5 scrap) for theirs (10 scrap): they owe us 2.5 scrap.
pub fn hat_for_hat_valuation() -> OfferValuation {
    let mut dict = ItemsDict::default();
    dict.our.insert(Sku::new(HAT_OURS), 1);
    dict.their.insert(Sku::new(HAT_THEIRS), 1);

    let mut prices = PriceSnapshot::new();
    prices.insert(Sku::new(HAT_OURS), price(dec!(1.22), dec!(1.39)));
    prices.insert(Sku::new(HAT_THEIRS), price(dec!(1.11), dec!(1.33)));

    OfferValuation {
        value: Valuation {
            our: side(dec!(12.5)),
            their: side(dec!(10)),
            rate: dec!(6.33),
        },
        dict,
        prices,
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
