//! Fractional Kelly sizing for fully hedged binary pairs.
//!
//! A hedged pair pays exactly one unit at settlement regardless of outcome,
//! so the "bet" is near riskless and full Kelly degenerates. The sizer
//! instead treats the net edge as the growth rate of the stake, clamps it to
//! a hard cap and scales by the configured Kelly multiplier.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Highest edge fraction the sizer will ever credit.
pub const DEFAULT_EDGE_CAP: Decimal = dec!(0.25);

/// Bankroll fraction for an edge: `min(edge, cap) * multiplier`.
///
/// Non-positive edges and multipliers yield zero.
#[must_use]
pub fn hedge_fraction(edge: Decimal, cap: Decimal, multiplier: Decimal) -> Decimal {
    if edge <= Decimal::ZERO || multiplier <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    edge.min(cap) * multiplier
}

/// Kelly sizer for hedged pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgeKelly {
    /// Fraction of Kelly to use (0.25 = quarter Kelly)
    pub multiplier: Decimal,
    /// Cap on the credited edge fraction
    pub edge_cap: Decimal,
}

impl Default for HedgeKelly {
    fn default() -> Self {
        Self {
            multiplier: dec!(0.25),
            edge_cap: DEFAULT_EDGE_CAP,
        }
    }
}

/// Why a stake came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StakeReason {
    /// Positive stake
    Sized,
    /// Edge was zero or negative
    NoEdge,
    /// Bankroll was zero or negative
    NoBankroll,
}

/// Result of a Kelly stake calculation, in settlement currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeStake {
    /// Bankroll fraction applied
    pub fraction: Decimal,
    /// Stake in settlement currency
    pub stake: Decimal,
    /// Reason for the decision
    pub reason: StakeReason,
}

impl HedgeKelly {
    /// Creates a sizer with the given multiplier and the default edge cap.
    #[must_use]
    pub fn new(multiplier: Decimal) -> Self {
        Self {
            multiplier,
            ..Self::default()
        }
    }

    /// Overrides the edge cap.
    #[must_use]
    pub fn with_edge_cap(mut self, cap: Decimal) -> Self {
        self.edge_cap = cap;
        self
    }

    /// Stake for an opportunity with net edge `edge_bps` against `bankroll`.
    #[must_use]
    pub fn stake(&self, edge_bps: Decimal, bankroll: Decimal) -> HedgeStake {
        if bankroll <= Decimal::ZERO {
            return HedgeStake {
                fraction: Decimal::ZERO,
                stake: Decimal::ZERO,
                reason: StakeReason::NoBankroll,
            };
        }
        let fraction = hedge_fraction(edge_bps / dec!(10000), self.edge_cap, self.multiplier);
        if fraction.is_zero() {
            return HedgeStake {
                fraction,
                stake: Decimal::ZERO,
                reason: StakeReason::NoEdge,
            };
        }
        HedgeStake {
            fraction,
            stake: bankroll * fraction,
            reason: StakeReason::Sized,
        }
    }
}
