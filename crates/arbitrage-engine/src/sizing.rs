//! Position sizing.
//!
//! Size in contracts per leg is
//! `floor(min(kelly_stake, remaining_capacity) / net_cost, max_size)`, where
//! the Kelly stake is a capped, edge-scaled fraction of bankroll. Anything
//! below the minimum order size is skipped rather than sent as dust.

use pm_arb_core::{HedgeKelly, Settings, StakeReason};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{ArbitrageOpportunity, SizedOpportunity};

#[derive(Debug, Clone, PartialEq)]
pub struct SizingConfig {
    pub kelly: HedgeKelly,
    /// Smallest order worth sending, in contracts.
    pub min_order_size: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            kelly: HedgeKelly::default(),
            min_order_size: Decimal::ONE,
        }
    }
}

impl SizingConfig {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            kelly: HedgeKelly::new(settings.kelly_fraction),
            min_order_size: settings.min_order_size,
        }
    }

    #[must_use]
    pub fn with_kelly(mut self, kelly: HedgeKelly) -> Self {
        self.kelly = kelly;
        self
    }

    #[must_use]
    pub fn with_min_order_size(mut self, size: Decimal) -> Self {
        self.min_order_size = size;
        self
    }
}

/// Why sizing produced nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SkipReason {
    NoEdge,
    NoBankroll,
    NoCapacity,
    NoLiquidity,
    BelowMinimum { size: Decimal, minimum: Decimal },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoEdge => write!(f, "no edge"),
            Self::NoBankroll => write!(f, "no bankroll"),
            Self::NoCapacity => write!(f, "no risk capacity"),
            Self::NoLiquidity => write!(f, "no liquidity"),
            Self::BelowMinimum { size, minimum } => write!(f, "size {size} below minimum {minimum}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SizingDecision {
    Sized(SizedOpportunity),
    Skip(SkipReason),
}

#[derive(Debug, Clone, Default)]
pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    #[must_use]
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Sizes `opportunity` against `bankroll` and the risk manager's
    /// remaining `capacity`, both in settlement currency.
    #[must_use]
    pub fn size(&self, opportunity: ArbitrageOpportunity, bankroll: Decimal, capacity: Decimal) -> SizingDecision {
        let stake = self.config.kelly.stake(opportunity.edge_bps, bankroll);
        match stake.reason {
            StakeReason::NoEdge => return SizingDecision::Skip(SkipReason::NoEdge),
            StakeReason::NoBankroll => return SizingDecision::Skip(SkipReason::NoBankroll),
            StakeReason::Sized => {}
        }
        if capacity <= Decimal::ZERO {
            return SizingDecision::Skip(SkipReason::NoCapacity);
        }
        if opportunity.max_size <= Decimal::ZERO {
            return SizingDecision::Skip(SkipReason::NoLiquidity);
        }
        let cost_per_pair = opportunity.net_cost;
        if cost_per_pair <= Decimal::ZERO {
            return SizingDecision::Skip(SkipReason::NoEdge);
        }

        let budget = stake.stake.min(capacity);
        let size = (budget / cost_per_pair).min(opportunity.max_size).trunc();
        if size < self.config.min_order_size || size.is_zero() {
            return SizingDecision::Skip(SkipReason::BelowMinimum {
                size,
                minimum: self.config.min_order_size,
            });
        }

        debug!(
            canonical_key = %opportunity.key,
            kelly_fraction = %stake.fraction,
            stake = %stake.stake,
            capacity = %capacity,
            size = %size,
            "opportunity sized"
        );
        SizingDecision::Sized(SizedOpportunity {
            notional: size * cost_per_pair,
            size,
            opportunity,
            breaker_trial: false,
        })
    }
}
