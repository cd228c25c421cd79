//! Counter-offer balancing.
//!
//! Given the valuation recorded when a proposal was rejected, computes which
//! currency items to add or remove on each side so both totals match
//! exactly. Non-currency items are never touched; the imbalance they create
//! is covered greedily from each side's currency holdings, with one
//! fractional-value fallback item taken from the counterparty when the
//! imbalance is not a whole number of base units.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::ladder::{price_in_scrap, to_refined, to_scrap, CurrencyLadder};
use crate::error::TradeError;
use crate::types::{
    AssetId, InventorySnapshot, OfferValuation, PriceSnapshot, SideValue, Sku, TradeItem,
    Valuation,
};

// ---------------------------------------------------------------------------
// Options & input
// ---------------------------------------------------------------------------

/// Knobs that change how the imbalance is measured and settled.
#[derive(Debug, Clone, PartialEq)]
pub struct BalancerOptions {
    /// Value fallback-kind items at `fallback_value` instead of their price.
    pub weapons_as_currency: bool,
    /// Item kinds usable as the fractional fallback, in preference order.
    pub fallback_kinds: Vec<Sku>,
    /// Fixed value of one fallback item in base units.
    pub fallback_value: Decimal,
    /// Fold keys into the metal part of the resulting valuation.
    pub show_only_metal: bool,
}

impl Default for BalancerOptions {
    fn default() -> Self {
        Self {
            weapons_as_currency: true,
            fallback_kinds: Vec::new(),
            fallback_value: dec!(0.5),
            show_only_metal: false,
        }
    }
}

/// Everything the balancer looks at for one proposal.
#[derive(Debug, Clone, Copy)]
pub struct CounterInput<'a> {
    pub valuation: &'a OfferValuation,
    /// Our side of the original proposal.
    pub our_offered: &'a [TradeItem],
    /// Their side of the original proposal.
    pub their_offered: &'a [TradeItem],
    /// Our holdings, including `our_offered` but excluding items committed
    /// to other proposals.
    pub our_inventory: &'a InventorySnapshot,
    /// Their live inventory, including `their_offered`.
    pub their_inventory: &'a InventorySnapshot,
    /// Current price-list entries for the fallback kinds that are listed.
    pub listed_prices: &'a PriceSnapshot,
}

/// Item changes that turn the original proposal into a balanced counter.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterPlan {
    pub add_ours: Vec<TradeItem>,
    pub remove_ours: Vec<TradeItem>,
    pub add_theirs: Vec<TradeItem>,
    pub remove_theirs: Vec<TradeItem>,
    /// Fallback item taken from their inventory, also present in `add_theirs`.
    pub fallback: Option<TradeItem>,
    pub valuation: OfferValuation,
}

impl CounterPlan {
    /// Apply the plan to the original sides, returning `(give, receive)`.
    pub fn apply(&self, give: &[TradeItem], receive: &[TradeItem]) -> (Vec<TradeItem>, Vec<TradeItem>) {
        (
            apply_side(give, &self.remove_ours, &self.add_ours),
            apply_side(receive, &self.remove_theirs, &self.add_theirs),
        )
    }

    pub fn is_noop(&self) -> bool {
        self.add_ours.is_empty()
            && self.remove_ours.is_empty()
            && self.add_theirs.is_empty()
            && self.remove_theirs.is_empty()
    }
}

fn apply_side(original: &[TradeItem], remove: &[TradeItem], add: &[TradeItem]) -> Vec<TradeItem> {
    let removed: BTreeSet<&AssetId> = remove.iter().map(|i| &i.asset_id).collect();
    original
        .iter()
        .filter(|i| !removed.contains(&i.asset_id))
        .chain(add.iter())
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Greedy cover state
// ---------------------------------------------------------------------------

/// Running imbalance. Positive means the counterparty owes us.
struct Cover<'a> {
    ladder: &'a CurrencyLadder,
    worth: Decimal,
    key_price: Decimal,
    key_trade: bool,
    key_difference: i64,
    lock_keys: bool,
}

impl Cover<'_> {
    /// How many of `sku` (out of `available`) to move. `increase` moves value
    /// onto our side, `round_up` allows overshooting the remaining amount.
    fn take(
        &mut self,
        sku: &Sku,
        available: i64,
        increase: bool,
        round_up: bool,
    ) -> Result<i64, TradeError> {
        let value = match self.ladder.pure_value(sku, self.key_price) {
            Some(v) if !v.is_zero() => v,
            _ => return Ok(0),
        };

        if self.key_trade && self.ladder.is_key(sku) {
            // Key counts are already folded into the worth; the key-giving
            // side simply keeps its keys, once.
            let amount = if increase == (self.key_difference > 0) && !self.lock_keys {
                self.key_difference.abs()
            } else {
                0
            };
            self.lock_keys = amount != 0;
            return Ok(amount);
        }

        let remaining = if increase { -self.worth } else { self.worth };
        let ratio = remaining / value;
        let wanted = if round_up { ratio.ceil() } else { ratio.floor() };
        let wanted = wanted
            .max(Decimal::ZERO)
            .to_i64()
            .ok_or_else(|| TradeError::CountOutOfRange {
                sku: sku.clone(),
                count: wanted,
            })?;
        let amount = available.max(0).min(wanted);

        let moved = Decimal::from(amount) * value;
        if increase {
            self.worth += moved;
        } else {
            self.worth -= moved;
        }
        Ok(amount)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TradeValue {
    keys: i64,
    scrap: Decimal,
}

impl TradeValue {
    fn total(&self, key_price: Decimal) -> Decimal {
        Decimal::from(self.keys) * key_price + self.scrap
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Our,
    Their,
}

// ---------------------------------------------------------------------------
// Balancer
// ---------------------------------------------------------------------------

pub struct Balancer {
    ladder: CurrencyLadder,
    options: BalancerOptions,
}

impl Balancer {
    pub fn new(ladder: CurrencyLadder, options: BalancerOptions) -> Self {
        Self { ladder, options }
    }

    pub fn ladder(&self) -> &CurrencyLadder {
        &self.ladder
    }

    pub fn options(&self) -> &BalancerOptions {
        &self.options
    }

    /// Compute a balanced counter for the given proposal, or fail the whole
    /// attempt.
    pub fn balance(&self, input: CounterInput<'_>) -> Result<CounterPlan, TradeError> {
        let recorded = &input.valuation.value;
        let mut dict = input.valuation.dict.clone();
        let mut prices = input.valuation.prices.clone();
        let key_price = to_scrap(recorded.rate);

        let mut trade_values = [
            TradeValue {
                keys: recorded.our.keys,
                scrap: recorded.our.total - Decimal::from(recorded.our.keys) * key_price,
            },
            TradeValue {
                keys: recorded.their.keys,
                scrap: recorded.their.total - Decimal::from(recorded.their.keys) * key_price,
            },
        ];

        // 1. Worth of everything that is not currency.
        let mut missing: Vec<Sku> = Vec::new();
        let mut key_trade = true;
        let mut key_difference = 0i64;
        let mut worth = Decimal::ZERO;

        for (side, counts) in [(Side::Our, &dict.our), (Side::Their, &dict.their)] {
            let mut side_worth = Decimal::ZERO;
            for (sku, &count) in counts {
                let is_currency = self.ladder.is_currency(sku);
                let price = prices.get(sku);
                if price.is_none() && !is_currency {
                    missing.push(sku.clone());
                    continue;
                }
                if self.ladder.is_key(sku) {
                    key_difference += if side == Side::Our { count } else { -count };
                }
                if count == 0 || is_currency {
                    continue;
                }

                key_trade = false;

                if self.options.weapons_as_currency && self.options.fallback_kinds.contains(sku) {
                    side_worth += self.options.fallback_value * Decimal::from(count);
                    continue;
                }

                if let Some(price) = price {
                    let entry = if side == Side::Our { &price.sell } else { &price.buy };
                    side_worth += Decimal::from(count) * price_in_scrap(entry, key_price);
                }
            }
            worth += if side == Side::Our { side_worth } else { -side_worth };
        }

        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(TradeError::MissingPrices(missing));
        }

        // 2. Pure-only proposals fold the key asymmetry in at market price.
        if key_trade && key_difference != 0 {
            let key = self.ladder.key();
            let Some(key_entry) = prices.get(key) else {
                return Err(TradeError::MissingPrices(vec![key.clone()]));
            };
            let rate = if key_difference > 0 { key_entry.sell.metal } else { key_entry.buy.metal };
            worth += Decimal::from(key_difference) * to_scrap(rate);
        }

        debug!(%worth, key_trade, key_difference, "Computed counter imbalance");

        // 5. Fractional remainder: take one fallback item from them.
        let mut fallback: Option<TradeItem> = None;
        if !worth.fract().is_zero() {
            let item = self.pick_fallback(input)?;
            worth -= self.options.fallback_value;
            trade_values[1].scrap += self.options.fallback_value;
            *dict.their.entry(item.sku.clone()).or_insert(0) += 1;
            if let Some(listed) = input.listed_prices.get(&item.sku) {
                prices.insert(item.sku.clone(), *listed);
            }
            debug!(sku = %item.sku, asset_id = %item.asset_id, "Taking fallback item");
            fallback = Some(item);
        }

        let mut cover = Cover {
            ladder: &self.ladder,
            worth,
            key_price,
            key_trade,
            key_difference,
            lock_keys: false,
        };

        let key = self.ladder.key().clone();
        let metals: Vec<Sku> = self.ladder.metals().iter().map(|m| m.sku.clone()).collect();
        let (smallest_metal, upper_metals) = match metals.split_last() {
            Some((last, rest)) => (last.clone(), rest.to_vec()),
            None => return Err(TradeError::Unbalanced(worth)),
        };
        let our_inv = input.our_inventory;
        let their_inv = input.their_inventory;

        // 3. Our best way: floor pass.
        let mut ours: BTreeMap<Sku, i64> = BTreeMap::new();
        for sku in std::iter::once(&key).chain(metals.iter()) {
            let n = cover.take(sku, our_inv.count(sku), true, false)?;
            ours.insert(sku.clone(), n);
        }

        // 4. Still owing: round upper denominations up, then claw back.
        if cover.worth < Decimal::ZERO {
            for sku in upper_metals.iter().chain(std::iter::once(&key)) {
                let have = ours[sku];
                let n = cover.take(sku, our_inv.count(sku) - have, true, true)?;
                *ours.entry(sku.clone()).or_insert(0) += n;
            }
            for sku in &metals {
                let have = ours[sku];
                let n = cover.take(sku, have, false, false)?;
                *ours.entry(sku.clone()).or_insert(0) -= n;
            }
        }

        let mut theirs: BTreeMap<Sku, i64> = BTreeMap::new();
        for sku in std::iter::once(&key).chain(metals.iter()) {
            let n = cover.take(sku, their_inv.count(sku), false, false)?;
            theirs.insert(sku.clone(), n);
        }

        // 6. They would still overpay: same dance on their side, then top up
        // with our small denominations.
        if cover.worth > Decimal::ZERO {
            for sku in upper_metals.iter().chain(std::iter::once(&key)) {
                let have = theirs[sku];
                let n = cover.take(sku, their_inv.count(sku) - have, false, true)?;
                *theirs.entry(sku.clone()).or_insert(0) += n;
            }
            for sku in &metals {
                let have = theirs[sku];
                let n = cover.take(sku, have, true, false)?;
                *theirs.entry(sku.clone()).or_insert(0) -= n;
            }
            for sku in &metals {
                let have = ours[sku];
                let n = cover.take(sku, our_inv.count(sku) - have, true, false)?;
                *ours.entry(sku.clone()).or_insert(0) += n;
            }
        }

        if !cover.worth.is_zero() {
            let smallest = self
                .ladder
                .metal_value(&smallest_metal)
                .unwrap_or(Decimal::ONE);
            if !(cover.worth % smallest).is_zero() {
                return Err(TradeError::UnresolvableRemainder {
                    remainder: cover.worth,
                    smallest,
                });
            }
            return Err(TradeError::Unbalanced(cover.worth));
        }

        // 8. Turn target counts into concrete item moves.
        let key_buy_scrap = prices.get(&key).map(|p| to_scrap(p.buy.metal));
        let mut plan_items = PlanItems::default();

        for (side, target, offered, inventory) in [
            (Side::Their, &theirs, input.their_offered, their_inv),
            (Side::Our, &ours, input.our_offered, our_inv),
        ] {
            let offered_ids: BTreeSet<&AssetId> = offered.iter().map(|i| &i.asset_id).collect();
            for sku in std::iter::once(&key).chain(metals.iter()) {
                let in_trade: Vec<&TradeItem> = offered.iter().filter(|i| i.sku == *sku).collect();
                let amount = target.get(sku).copied().unwrap_or(0) - in_trade.len() as i64;
                if amount == 0 {
                    continue;
                }

                let moved: Vec<TradeItem> = if amount > 0 {
                    let free: Vec<TradeItem> = inventory
                        .find_items_by_kind(sku)
                        .iter()
                        .filter(|id| !offered_ids.contains(id))
                        .take(amount as usize)
                        .map(|id| TradeItem {
                            asset_id: id.clone(),
                            sku: sku.clone(),
                        })
                        .collect();
                    if (free.len() as i64) < amount {
                        return Err(TradeError::InsufficientItems {
                            sku: sku.clone(),
                            verb: "add",
                            missing: amount - free.len() as i64,
                        });
                    }
                    free
                } else {
                    in_trade
                        .into_iter()
                        .take(amount.unsigned_abs() as usize)
                        .cloned()
                        .collect()
                };

                plan_items.push(side, amount > 0, moved);

                let idx = if side == Side::Our { 0 } else { 1 };
                let is_key = self.ladder.is_key(sku);
                if is_key && !key_trade && !self.options.show_only_metal {
                    trade_values[idx].keys += amount;
                } else {
                    let unit = match (is_key && key_trade && side == Side::Their, key_buy_scrap) {
                        (true, Some(buy)) => buy,
                        _ => self.ladder.pure_value(sku, key_price).unwrap_or(Decimal::ZERO),
                    };
                    trade_values[idx].scrap += Decimal::from(amount) * unit;
                }

                let counts = if side == Side::Our { &mut dict.our } else { &mut dict.their };
                let entry = counts.entry(sku.clone()).or_insert(0);
                *entry += amount;
                if *entry == 0 {
                    counts.remove(sku);
                }
            }
        }

        // 7. Safety net.
        let our_total = trade_values[0].total(key_price);
        let their_total = trade_values[1].total(key_price);
        if our_total != their_total {
            return Err(TradeError::ValueMismatch {
                our: our_total,
                their: their_total,
            });
        }

        if let Some(item) = &fallback {
            plan_items.add_theirs.push(item.clone());
        }

        let side_value = |v: &TradeValue| SideValue {
            total: v.total(key_price),
            keys: v.keys,
            metal: to_refined(v.scrap),
        };

        Ok(CounterPlan {
            add_ours: plan_items.add_ours,
            remove_ours: plan_items.remove_ours,
            add_theirs: plan_items.add_theirs,
            remove_theirs: plan_items.remove_theirs,
            fallback,
            valuation: OfferValuation {
                value: Valuation {
                    our: side_value(&trade_values[0]),
                    their: side_value(&trade_values[1]),
                    rate: recorded.rate,
                },
                dict,
                prices,
            },
        })
    }

    /// First fallback kind they hold that is not already in the proposal.
    /// Unlisted kinds are preferred.
    fn pick_fallback(&self, input: CounterInput<'_>) -> Result<TradeItem, TradeError> {
        let kinds = &self.options.fallback_kinds;
        let unlisted: Vec<&Sku> = kinds
            .iter()
            .filter(|sku| !input.listed_prices.contains_key(*sku))
            .collect();
        let candidates: Vec<&Sku> = if unlisted.is_empty() {
            kinds.iter().collect()
        } else {
            unlisted
        };

        let offered_kinds: BTreeSet<&Sku> = input.their_offered.iter().map(|i| &i.sku).collect();

        candidates
            .into_iter()
            .filter(|sku| !offered_kinds.contains(*sku))
            .find_map(|sku| {
                input
                    .their_inventory
                    .find_items_by_kind(sku)
                    .first()
                    .map(|id| TradeItem {
                        asset_id: id.clone(),
                        sku: sku.clone(),
                    })
            })
            .ok_or(TradeError::NoFallbackItem)
    }
}

#[derive(Default)]
struct PlanItems {
    add_ours: Vec<TradeItem>,
    remove_ours: Vec<TradeItem>,
    add_theirs: Vec<TradeItem>,
    remove_theirs: Vec<TradeItem>,
}

impl PlanItems {
    fn push(&mut self, side: Side, add: bool, items: Vec<TradeItem>) {
        let target = match (side, add) {
            (Side::Our, true) => &mut self.add_ours,
            (Side::Our, false) => &mut self.remove_ours,
            (Side::Their, true) => &mut self.add_theirs,
            (Side::Their, false) => &mut self.remove_theirs,
        };
        target.extend(items);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
