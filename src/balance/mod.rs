//! Counter-offer value balancing.
//!
//! - `ladder`: currency denominations and scrap/refined conversions
//! - `counter`: the balancer that turns a rejected proposal into a
//!   value-equal counter

pub mod counter;
pub mod ladder;

pub use counter::{Balancer, BalancerOptions, CounterInput, CounterPlan};
pub use ladder::{to_refined, to_scrap, CurrencyLadder, Denomination};
