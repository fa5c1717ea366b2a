//! Fee model and net-edge calculation for synchronized quote pairs.
//!
//! For a pair `(A, B)` both hedges are priced:
//! - buy YES on A and NO on B: gross = `askYes_A + askNo_B`
//! - buy NO on A and YES on B: gross = `askNo_A + askYes_B`
//!
//! `net = gross * (1 + fee_A + fee_B) + slippage_bps / 10000` and
//! `edge_bps = (1 - net) * 10000`. The better hedge is kept if it clears the
//! minimum edge. The calculator holds no mutable state.

use pm_arb_core::Settings;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ArbError;
use crate::types::{ArbitrageOpportunity, HedgeLeg, Quote, QuotePair, Side, Strategy, Venue};

/// Basis points per unit.
pub const BPS: Decimal = dec!(10000);

/// Default Polymarket taker fee rate.
pub const POLYMARKET_DEFAULT_FEE_RATE: Decimal = dec!(0.0025);

/// Default Kalshi taker fee rate.
pub const KALSHI_DEFAULT_FEE_RATE: Decimal = dec!(0.0030);

// =============================================================================
// Fees
// =============================================================================

/// Per-venue taker fee rates, as decimals of notional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub polymarket: Decimal,
    pub kalshi: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            polymarket: POLYMARKET_DEFAULT_FEE_RATE,
            kalshi: KALSHI_DEFAULT_FEE_RATE,
        }
    }
}

impl FeeSchedule {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            polymarket: settings.polymarket_fee_rate,
            kalshi: settings.kalshi_fee_rate,
        }
    }

    /// A schedule with no fees.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            polymarket: Decimal::ZERO,
            kalshi: Decimal::ZERO,
        }
    }

    /// Taker rate for a venue.
    #[must_use]
    pub fn rate(&self, venue: Venue) -> Decimal {
        match venue {
            Venue::Polymarket => self.polymarket,
            Venue::Kalshi => self.kalshi,
        }
    }

    /// Fee charged on `notional` traded at `venue`.
    #[must_use]
    pub fn fee_for(&self, venue: Venue, notional: Decimal) -> Decimal {
        notional.abs() * self.rate(venue)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Edge calculator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub fees: FeeSchedule,
    /// Added to net cost, in basis points.
    pub slippage_buffer_bps: Decimal,
    /// Opportunities below this edge are not emitted.
    pub min_edge_bps: Decimal,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            fees: FeeSchedule::default(),
            slippage_buffer_bps: dec!(25),
            min_edge_bps: dec!(80),
        }
    }
}

impl EdgeConfig {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            fees: FeeSchedule::from_settings(settings),
            slippage_buffer_bps: settings.slippage_buffer_bps,
            min_edge_bps: settings.min_edge_bps,
        }
    }

    #[must_use]
    pub fn with_fees(mut self, fees: FeeSchedule) -> Self {
        self.fees = fees;
        self
    }

    #[must_use]
    pub fn with_slippage_buffer_bps(mut self, bps: Decimal) -> Self {
        self.slippage_buffer_bps = bps;
        self
    }

    #[must_use]
    pub fn with_min_edge_bps(mut self, bps: Decimal) -> Self {
        self.min_edge_bps = bps;
        self
    }
}

// =============================================================================
// Calculator
// =============================================================================

/// Priced hedge for one strategy of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyEdge {
    pub strategy: Strategy,
    pub gross_cost: Decimal,
    pub net_cost: Decimal,
    pub edge_bps: Decimal,
    /// `min(askSize_A, askSize_B)`.
    pub max_size: Decimal,
}

/// Stateless net-edge calculator.
#[derive(Debug, Clone, Default)]
pub struct EdgeCalculator {
    config: EdgeConfig,
}

impl EdgeCalculator {
    #[must_use]
    pub fn new(config: EdgeConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    /// `gross * (1 + fee_a + fee_b) + slippage`.
    #[must_use]
    pub fn net_cost(&self, gross: Decimal, fee_a: Decimal, fee_b: Decimal) -> Decimal {
        gross * (Decimal::ONE + fee_a + fee_b) + self.config.slippage_buffer_bps / BPS
    }

    /// `(1 - net) * 10000`.
    #[must_use]
    pub fn edge_bps(net_cost: Decimal) -> Decimal {
        (Decimal::ONE - net_cost) * BPS
    }

    /// Prices one strategy.
    #[must_use]
    pub fn price_strategy(&self, pair: &QuotePair, strategy: Strategy) -> StrategyEdge {
        let gross_cost = pair.a.ask(strategy.side_a()) + pair.b.ask(strategy.side_b());
        let net_cost = self.net_cost(
            gross_cost,
            self.config.fees.rate(pair.a.venue()),
            self.config.fees.rate(pair.b.venue()),
        );
        StrategyEdge {
            strategy,
            gross_cost,
            net_cost,
            edge_bps: Self::edge_bps(net_cost),
            max_size: pair.a.inner.ask_size.min(pair.b.inner.ask_size),
        }
    }

    /// Higher-edge strategy of the pair; ties keep YES-on-A.
    #[must_use]
    pub fn best_strategy(&self, pair: &QuotePair) -> StrategyEdge {
        let first = self.price_strategy(pair, Strategy::YesANoB);
        let second = self.price_strategy(pair, Strategy::NoAYesB);
        if second.edge_bps > first.edge_bps {
            second
        } else {
            first
        }
    }

    /// Emits an opportunity when the best edge clears the minimum.
    ///
    /// # Errors
    ///
    /// Returns [`ArbError::InsufficientEdge`] otherwise.
    pub fn evaluate(&self, pair: &QuotePair) -> Result<ArbitrageOpportunity, ArbError> {
        let best = self.best_strategy(pair);
        if best.edge_bps < self.config.min_edge_bps {
            debug!(
                canonical_key = %pair.key,
                edge_bps = %best.edge_bps.round_dp(2),
                min_edge_bps = %self.config.min_edge_bps,
                "edge below minimum"
            );
            return Err(ArbError::InsufficientEdge {
                edge_bps: best.edge_bps,
                min_edge_bps: self.config.min_edge_bps,
            });
        }

        let leg = |q: &Quote, side: Side| HedgeLeg {
            venue: q.venue(),
            market_id: q.inner.market_id.clone(),
            side,
            price: q.ask(side),
            available: q.inner.ask_size,
        };
        Ok(ArbitrageOpportunity {
            key: pair.key.clone(),
            strategy: best.strategy,
            edge_bps: best.edge_bps,
            gross_cost: best.gross_cost,
            net_cost: best.net_cost,
            max_size: best.max_size,
            leg_a: leg(&pair.a, best.strategy.side_a()),
            leg_b: leg(&pair.b, best.strategy.side_b()),
            pair: pair.clone(),
            computed_at: pair.bucket_close,
        })
    }
}
