//! Shared types for the reconciliation engine.
//!
//! These types form the data model used across all modules: proposals and
//! their items, lifecycle states, decision verdicts, recorded valuations and
//! the per-proposal metadata record persisted with the poll data.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Remote identifier of a trade proposal.
    ProposalId
);
string_id!(
    /// Identifier of a single owned item instance.
    AssetId
);
string_id!(
    /// Counterparty identity (64-bit account id rendered as a string).
    PartnerId
);
string_id!(
    /// Item kind, e.g. `5021;6` for a key.
    Sku
);

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// One item instance on either side of a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradeItem {
    pub asset_id: AssetId,
    pub sku: Sku,
}

impl TradeItem {
    pub fn new(asset_id: impl Into<String>, sku: impl Into<String>) -> Self {
        Self {
            asset_id: AssetId(asset_id.into()),
            sku: Sku(sku.into()),
        }
    }
}

/// Multiset comparison of two item lists by asset id.
pub fn items_equal(a: &[TradeItem], b: &[TradeItem]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut remaining: Vec<&TradeItem> = b.iter().collect();
    for item in a {
        match remaining.iter().position(|other| other.asset_id == item.asset_id) {
            Some(idx) => {
                remaining.swap_remove(idx);
            }
            None => return false,
        }
    }

    remaining.is_empty()
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Whether we sent the proposal or received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

/// Remote lifecycle state of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OfferState {
    Created,
    Active,
    NeedsConfirmation,
    Accepted,
    Declined,
    Countered,
    InEscrow,
    Expired,
    Canceled,
    Invalid,
}

impl OfferState {
    /// States in which the give side stays committed to the proposal.
    pub fn holds_items(&self) -> bool {
        matches!(
            self,
            OfferState::Active | OfferState::NeedsConfirmation | OfferState::InEscrow
        )
    }

    /// Active or waiting for our confirmation.
    pub fn is_open(&self) -> bool {
        matches!(self, OfferState::Active | OfferState::NeedsConfirmation)
    }

    /// Whether the exchange went (or is going) through.
    pub fn is_accepted(&self) -> bool {
        matches!(self, OfferState::Accepted | OfferState::InEscrow)
    }
}

impl fmt::Display for OfferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OfferState::Created => "Created",
            OfferState::Active => "Active",
            OfferState::NeedsConfirmation => "CreatedNeedsConfirmation",
            OfferState::Accepted => "Accepted",
            OfferState::Declined => "Declined",
            OfferState::Countered => "Countered",
            OfferState::InEscrow => "InEscrow",
            OfferState::Expired => "Expired",
            OfferState::Canceled => "Canceled",
            OfferState::Invalid => "Invalid",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------------

/// A barter proposal as reported by the remote negotiation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub partner: PartnerId,
    pub direction: Direction,
    pub state: OfferState,
    /// Items leaving our inventory.
    pub items_to_give: Vec<TradeItem>,
    /// Items entering our inventory.
    pub items_to_receive: Vec<TradeItem>,
    #[serde(default)]
    pub message: String,
    /// Set by the service when item descriptions could not be loaded.
    #[serde(default)]
    pub is_glitched: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} [{:?}] {} with {} (give {} / receive {})",
            self.id,
            self.direction,
            self.state,
            self.partner,
            self.items_to_give.len(),
            self.items_to_receive.len(),
        )
    }
}

impl Proposal {
    pub fn is_ours(&self) -> bool {
        self.direction == Direction::Sent
    }

    pub fn give_assets(&self) -> Vec<AssetId> {
        self.items_to_give.iter().map(|i| i.asset_id.clone()).collect()
    }

    /// Same direction, same counterparty, same item multisets on both sides.
    pub fn structurally_equals(&self, other: &Proposal) -> bool {
        self.direction == other.direction
            && self.partner == other.partner
            && items_equal(&self.items_to_give, &other.items_to_give)
            && items_equal(&self.items_to_receive, &other.items_to_receive)
    }

    /// Whether this proposal matches a draft we attempted to send.
    pub fn matches_draft(&self, draft: &ProposalDraft) -> bool {
        self.direction == Direction::Sent
            && self.partner == draft.partner
            && items_equal(&self.items_to_give, &draft.items_to_give)
            && items_equal(&self.items_to_receive, &draft.items_to_receive)
    }
}

/// A proposal we are about to send. The remote assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalDraft {
    pub partner: PartnerId,
    pub items_to_give: Vec<TradeItem>,
    pub items_to_receive: Vec<TradeItem>,
    pub message: String,
    /// Proposal this draft counters, if any.
    pub countering: Option<ProposalId>,
}

impl ProposalDraft {
    pub fn give_assets(&self) -> Vec<AssetId> {
        self.items_to_give.iter().map(|i| i.asset_id.clone()).collect()
    }
}

/// Offer list filter used when polling the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferFilter {
    ActiveOnly,
    All,
}

/// Result of listing offers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfferList {
    pub sent: Vec<Proposal>,
    pub received: Vec<Proposal>,
}

/// Outcome of a successful accept call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptStatus {
    Accepted,
    /// Mobile confirmation still required.
    Pending,
}

/// Hold information for the counterparty of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowDetails {
    pub their_escrow_days: u32,
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// The closed set of verdicts the decision callback may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Accept,
    Decline,
    Skip,
    Counter,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Accept => write!(f, "accept"),
            Action::Decline => write!(f, "decline"),
            Action::Skip => write!(f, "skip"),
            Action::Counter => write!(f, "counter"),
        }
    }
}

/// Reason used when an action is re-applied by the auto-retry timer.
pub const REASON_AUTO_RETRY: &str = "AUTO-RETRY";
/// Reason used for operator-forced actions.
pub const REASON_MANUAL_FORCE: &str = "MANUAL-FORCE";
/// Reason recorded when a counter attempt failed and we declined instead.
pub const REASON_COUNTER_FAILED: &str = "COUNTER_INVALID_VALUE_FAILED";
/// Reason recorded on the counter proposal itself.
pub const REASON_COUNTERED: &str = "COUNTERED";
/// Reason used when intake declines a proposal that would be held in escrow.
pub const REASON_ESCROW: &str = "ESCROW";
/// Reason used when the intake escrow check itself failed.
pub const REASON_ESCROW_CHECK_FAILED: &str = "ESCROW_CHECK_FAILED";

/// Extra context the decision callback attaches to its verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerdictMeta {
    #[serde(default)]
    pub unique_reasons: Vec<String>,
    /// Items that made the proposal high-value, if any.
    #[serde(default)]
    pub high_value: Vec<Sku>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Decision callback result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub action: Action,
    pub reason: String,
    #[serde(default)]
    pub meta: VerdictMeta,
    /// Valuation computed while deciding. Required for `counter`.
    #[serde(default)]
    pub valuation: Option<OfferValuation>,
}

impl Verdict {
    pub fn new(action: Action, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
            meta: VerdictMeta::default(),
            valuation: None,
        }
    }

    pub fn with_valuation(mut self, valuation: OfferValuation) -> Self {
        self.valuation = Some(valuation);
        self
    }
}

/// The action actually applied to a proposal and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedAction {
    pub action: Action,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Valuation
// ---------------------------------------------------------------------------

/// Price expressed as keys plus refined metal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Currencies {
    pub keys: i64,
    pub metal: Decimal,
}

impl Currencies {
    pub fn new(keys: i64, metal: Decimal) -> Self {
        Self { keys, metal }
    }
}

/// Buy/sell price of one item kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub buy: Currencies,
    pub sell: Currencies,
}

/// Prices used when a proposal was valued, keyed by item kind.
pub type PriceSnapshot = BTreeMap<Sku, PriceEntry>;

/// Value of one side of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SideValue {
    /// Total in base units (scrap), keys included at the exchange rate.
    pub total: Decimal,
    pub keys: i64,
    /// Non-key part in refined metal.
    pub metal: Decimal,
}

/// Recorded valuation of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Valuation {
    pub our: SideValue,
    pub their: SideValue,
    /// Key price in refined metal.
    pub rate: Decimal,
}

impl Valuation {
    pub fn is_balanced(&self) -> bool {
        self.our.total == self.their.total
    }
}

/// Item-kind counts per side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemsDict {
    pub our: BTreeMap<Sku, i64>,
    pub their: BTreeMap<Sku, i64>,
}

impl ItemsDict {
    /// All kinds referenced on either side.
    pub fn kinds(&self) -> BTreeSet<&Sku> {
        self.our.keys().chain(self.their.keys()).collect()
    }
}

/// Everything the decision callback recorded when valuing a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferValuation {
    pub value: Valuation,
    pub dict: ItemsDict,
    pub prices: PriceSnapshot,
}

// ---------------------------------------------------------------------------
// Metadata & poll data
// ---------------------------------------------------------------------------

/// Structured per-proposal metadata kept by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfferMeta {
    pub partner: Option<PartnerId>,
    #[serde(default)]
    pub handled_by_us: bool,
    pub action: Option<AppliedAction>,
    pub meta: Option<VerdictMeta>,
    pub valuation: Option<OfferValuation>,
    /// Give side saved for proposals we sent while they are active.
    pub our_items: Option<Vec<AssetId>>,
    #[serde(default)]
    pub notify: bool,
    #[serde(default)]
    pub is_accepted: bool,
    pub handle_timestamp: Option<DateTime<Utc>>,
    pub action_timestamp: Option<DateTime<Utc>>,
    pub finish_timestamp: Option<DateTime<Utc>>,
    pub process_offer_ms: Option<i64>,
    pub process_counter_ms: Option<i64>,
    pub action_ms: Option<i64>,
    pub confirmation_ms: Option<i64>,
}

/// Known proposal states plus their metadata. Persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollData {
    #[serde(default)]
    pub sent: BTreeMap<ProposalId, OfferState>,
    #[serde(default)]
    pub received: BTreeMap<ProposalId, OfferState>,
    #[serde(default)]
    pub offer_data: BTreeMap<ProposalId, OfferMeta>,
}

impl PollData {
    pub fn state_of(&self, id: &ProposalId) -> Option<OfferState> {
        self.sent.get(id).or_else(|| self.received.get(id)).copied()
    }

    pub fn record_state(&mut self, id: &ProposalId, direction: Direction, state: OfferState) {
        let map = match direction {
            Direction::Sent => &mut self.sent,
            Direction::Received => &mut self.received,
        };
        map.insert(id.clone(), state);
    }

    pub fn meta_mut(&mut self, id: &ProposalId) -> &mut OfferMeta {
        self.offer_data.entry(id.clone()).or_default()
    }
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

/// Owned items grouped by kind, in the order the inventory reported them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    items: BTreeMap<Sku, Vec<AssetId>>,
}

impl InventorySnapshot {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a TradeItem>) -> Self {
        let mut snapshot = Self::default();
        for item in items {
            snapshot.insert(item.clone());
        }
        snapshot
    }

    pub fn insert(&mut self, item: TradeItem) {
        self.items.entry(item.sku).or_default().push(item.asset_id);
    }

    pub fn find_items_by_kind(&self, sku: &Sku) -> &[AssetId] {
        self.items.get(sku).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count(&self, sku: &Sku) -> i64 {
        self.find_items_by_kind(sku).len() as i64
    }

    pub fn contains(&self, asset_id: &AssetId) -> bool {
        self.items.values().any(|ids| ids.contains(asset_id))
    }

    /// Remove one item. Returns whether it was present.
    pub fn remove_item(&mut self, asset_id: &AssetId) -> bool {
        let mut removed = false;
        for ids in self.items.values_mut() {
            if let Some(idx) = ids.iter().position(|id| id == asset_id) {
                ids.remove(idx);
                removed = true;
                break;
            }
        }
        self.items.retain(|_, ids| !ids.is_empty());
        removed
    }

    /// Copy of this snapshot with the given assets left out.
    pub fn without(&self, excluded: &BTreeSet<AssetId>) -> Self {
        let items = self
            .items
            .iter()
            .map(|(sku, ids)| {
                let kept: Vec<AssetId> = ids
                    .iter()
                    .filter(|id| !excluded.contains(*id))
                    .cloned()
                    .collect();
                (sku.clone(), kept)
            })
            .filter(|(_, ids)| !ids.is_empty())
            .collect();
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_items(&self) -> Vec<TradeItem> {
        self.items
            .iter()
            .flat_map(|(sku, ids)| {
                ids.iter().map(move |id| TradeItem {
                    asset_id: id.clone(),
                    sku: sku.clone(),
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
