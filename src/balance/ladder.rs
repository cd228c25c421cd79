//! Currency ladder and base-unit conversions.
//!
//! Values are tracked in scrap, the smallest standard denomination. Keys float
//! against metal at the rate recorded with each valuation.

use anyhow::{bail, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::{Currencies, Sku};

pub const KEY_SKU: &str = "5021;6";
pub const REFINED_SKU: &str = "5002;6";
pub const RECLAIMED_SKU: &str = "5001;6";
pub const SCRAP_SKU: &str = "5000;6";

/// Refined metal to scrap, rounded to the nearest half scrap.
pub fn to_scrap(refined: Decimal) -> Decimal {
    (refined * dec!(18)).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        / dec!(2)
}

/// Scrap to refined metal, truncated to two decimals.
pub fn to_refined(scrap: Decimal) -> Decimal {
    (scrap / dec!(9)).round_dp_with_strategy(2, RoundingStrategy::ToZero)
}

/// Scrap value of a keys + metal price.
pub fn price_in_scrap(price: &Currencies, key_price: Decimal) -> Decimal {
    Decimal::from(price.keys) * key_price + to_scrap(price.metal)
}

/// A fixed-value fungible denomination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denomination {
    pub sku: Sku,
    /// Value in base units.
    pub value: Decimal,
}

impl Denomination {
    pub fn new(sku: impl Into<String>, value: Decimal) -> Self {
        Self {
            sku: Sku::new(sku),
            value,
        }
    }
}

/// Ordered denominations: one floating "key" kind plus fixed-value metals,
/// largest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrencyLadder {
    key: Sku,
    metals: Vec<Denomination>,
}

impl Default for CurrencyLadder {
    fn default() -> Self {
        Self::standard()
    }
}

impl CurrencyLadder {
    /// Keys plus refined (9), reclaimed (3) and scrap (1).
    pub fn standard() -> Self {
        Self {
            key: Sku::new(KEY_SKU),
            metals: vec![
                Denomination::new(REFINED_SKU, dec!(9)),
                Denomination::new(RECLAIMED_SKU, dec!(3)),
                Denomination::new(SCRAP_SKU, dec!(1)),
            ],
        }
    }

    /// Build a custom ladder. Metals must be positive, distinct and given
    /// in strictly descending order.
    pub fn new(key: Sku, metals: Vec<Denomination>) -> Result<Self> {
        if metals.is_empty() {
            bail!("Currency ladder needs at least one metal denomination");
        }
        for metal in &metals {
            if metal.value <= Decimal::ZERO {
                bail!("Denomination {} must have a positive value", metal.sku);
            }
            if metal.sku == key {
                bail!("Denomination {} collides with the key kind", metal.sku);
            }
        }
        for pair in metals.windows(2) {
            if pair[0].value <= pair[1].value {
                bail!(
                    "Denominations must be strictly descending ({} then {})",
                    pair[0].sku,
                    pair[1].sku
                );
            }
            if pair[0].sku == pair[1].sku {
                bail!("Duplicate denomination {}", pair[0].sku);
            }
        }
        Ok(Self { key, metals })
    }

    pub fn key(&self) -> &Sku {
        &self.key
    }

    pub fn is_key(&self, sku: &Sku) -> bool {
        *sku == self.key
    }

    pub fn metals(&self) -> &[Denomination] {
        &self.metals
    }

    /// Value of the smallest metal. Remainders that are not a multiple of
    /// it cannot be settled with currency.
    pub fn smallest(&self) -> Decimal {
        self.metals
            .last()
            .map(|m| m.value)
            .unwrap_or(Decimal::ONE)
    }

    pub fn metal_value(&self, sku: &Sku) -> Option<Decimal> {
        self.metals.iter().find(|m| m.sku == *sku).map(|m| m.value)
    }

    pub fn is_currency(&self, sku: &Sku) -> bool {
        self.is_key(sku) || self.metal_value(sku).is_some()
    }

    /// Base-unit value of a currency kind; keys at the given key price.
    pub fn pure_value(&self, sku: &Sku, key_price: Decimal) -> Option<Decimal> {
        if self.is_key(sku) {
            Some(key_price)
        } else {
            self.metal_value(sku)
        }
    }

    /// Every currency kind: the key first, then metals largest first.
    pub fn kinds(&self) -> Vec<Sku> {
        std::iter::once(self.key.clone())
            .chain(self.metals.iter().map(|m| m.sku.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_scrap_rounds_to_half() {
        assert_eq!(to_scrap(dec!(1.39)), dec!(12.5));
        assert_eq!(to_scrap(dec!(1.11)), dec!(10));
        assert_eq!(to_scrap(dec!(6.33)), dec!(57));
        assert_eq!(to_scrap(dec!(6.22)), dec!(56));
        assert_eq!(to_scrap(dec!(0.05)), dec!(0.5));
    }

    #[test]
    fn test_to_refined_truncates() {
        assert_eq!(to_refined(dec!(12.5)), dec!(1.38));
        assert_eq!(to_refined(dec!(9)), dec!(1));
        assert_eq!(to_refined(dec!(19)), dec!(2.11));
    }

    #[test]
    fn test_price_in_scrap() {
        let price = Currencies::new(1, dec!(1.11));
        assert_eq!(price_in_scrap(&price, dec!(57)), dec!(67));
    }

    #[test]
    fn test_standard_ladder() {
        let ladder = CurrencyLadder::standard();
        assert_eq!(ladder.smallest(), dec!(1));
        assert_eq!(ladder.metal_value(&Sku::new(RECLAIMED_SKU)), Some(dec!(3)));
        assert!(ladder.is_currency(&Sku::new(KEY_SKU)));
        assert!(!ladder.is_currency(&Sku::new("200;6")));
        assert_eq!(ladder.pure_value(&Sku::new(KEY_SKU), dec!(57)), Some(dec!(57)));
        assert_eq!(ladder.kinds()[0], Sku::new(KEY_SKU));
    }

    #[test]
    fn test_custom_ladder_validation() {
        let ok = CurrencyLadder::new(
            Sku::new("key"),
            vec![Denomination::new("big", dec!(6)), Denomination::new("small", dec!(3))],
        );
        assert_eq!(ok.unwrap().smallest(), dec!(3));

        let ascending = CurrencyLadder::new(
            Sku::new("key"),
            vec![Denomination::new("small", dec!(3)), Denomination::new("big", dec!(6))],
        );
        assert!(ascending.is_err());

        assert!(CurrencyLadder::new(Sku::new("key"), vec![]).is_err());
        assert!(CurrencyLadder::new(
            Sku::new("key"),
            vec![Denomination::new("zero", dec!(0))]
        )
        .is_err());
    }
}
