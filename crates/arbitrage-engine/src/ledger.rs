//! Portfolio ledger.
//!
//! Records fills as trades and keeps cash, realized PnL (net of fees),
//! open exposure per event and per venue, and realized drawdown. All
//! mutation goes through [`PortfolioLedger::apply`], which only the
//! execution coordinator calls; the risk manager reads snapshots.
//!
//! A trade is one position leg on one venue: an unwound position leaves a
//! single closed trade, a completed hedge leaves two open trades until the
//! event settles.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};
use uuid::Uuid;

use crate::connector::OrderAction;
use crate::error::ArbError;
use crate::types::{CanonicalKey, Quote, Side, Venue};

// =============================================================================
// Updates
// =============================================================================

/// One confirmed fill reported by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegFill {
    pub position_id: Uuid,
    pub key: CanonicalKey,
    pub venue: Venue,
    pub market_id: String,
    pub side: Side,
    pub action: OrderAction,
    pub size: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub at: DateTime<Utc>,
}

/// The only ways the ledger changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerUpdate {
    /// A leg filled (buy) or was unwound (sell).
    Fill(LegFill),
    /// The event resolved; each winning contract pays 1.
    Settled {
        key: CanonicalKey,
        outcome: Side,
        at: DateTime<Utc>,
    },
}

// =============================================================================
// Trades
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
    Settled,
}

/// One position leg on one venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub position_id: Uuid,
    pub key: CanonicalKey,
    pub venue: Venue,
    pub market_id: String,
    pub side: Side,
    /// Contracts still held.
    pub size: Decimal,
    /// Contracts bought in total.
    pub bought: Decimal,
    /// Cost basis of the contracts still held.
    pub cost: Decimal,
    pub entry_price: Decimal,
    /// Gross realized PnL, before fees.
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    pub status: TradeStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Trade {
    fn open(fill: &LegFill) -> Self {
        Self {
            id: Uuid::new_v4(),
            position_id: fill.position_id,
            key: fill.key.clone(),
            venue: fill.venue,
            market_id: fill.market_id.clone(),
            side: fill.side,
            size: Decimal::ZERO,
            bought: Decimal::ZERO,
            cost: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            status: TradeStatus::Open,
            opened_at: fill.at,
            closed_at: None,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    /// Realized PnL net of fees.
    #[must_use]
    pub fn net_pnl(&self) -> Decimal {
        self.realized_pnl - self.fees
    }

    fn matches(&self, fill: &LegFill) -> bool {
        self.is_open()
            && self.position_id == fill.position_id
            && self.venue == fill.venue
            && self.side == fill.side
    }
}

// =============================================================================
// Summary
// =============================================================================

/// Point-in-time view of the portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub starting_balance: Decimal,
    pub cash: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub fees_paid: Decimal,
    pub aggregate_exposure: Decimal,
    /// Realized drawdown as a fraction of starting balance.
    pub drawdown: Decimal,
    pub open_events: usize,
    pub trade_count: usize,
}

// =============================================================================
// Ledger
// =============================================================================

#[derive(Debug)]
struct LedgerState {
    cash: Decimal,
    fees_paid: Decimal,
    trades: Vec<Trade>,
    /// Peak of starting balance plus realized PnL.
    peak_equity: Decimal,
    /// Latest mark per (venue, market, side).
    marks: BTreeMap<(Venue, String, Side), Decimal>,
}

/// Single-writer, many-reader portfolio state.
#[derive(Debug)]
pub struct PortfolioLedger {
    starting_balance: Decimal,
    state: RwLock<LedgerState>,
}

impl PortfolioLedger {
    #[must_use]
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            starting_balance,
            state: RwLock::new(LedgerState {
                cash: starting_balance,
                fees_paid: Decimal::ZERO,
                trades: Vec::new(),
                peak_equity: starting_balance,
                marks: BTreeMap::new(),
            }),
        }
    }

    /// Applies one update. A sell that does not match an open trade is an
    /// invariant violation and leaves the ledger untouched.
    pub fn apply(&self, update: LedgerUpdate) -> Result<(), ArbError> {
        let mut state = self.state.write();
        match update {
            LedgerUpdate::Fill(fill) => Self::apply_fill(&mut state, &fill)?,
            LedgerUpdate::Settled { key, outcome, at } => Self::apply_settlement(&mut state, &key, outcome, at),
        }
        let equity = self.starting_balance + Self::realized(&state);
        if equity > state.peak_equity {
            state.peak_equity = equity;
        }
        Ok(())
    }

    fn apply_fill(state: &mut LedgerState, fill: &LegFill) -> Result<(), ArbError> {
        if fill.size <= Decimal::ZERO {
            return Err(ArbError::InvariantViolation(format!(
                "non-positive fill size {} for {}",
                fill.size, fill.key
            )));
        }
        let notional = fill.size * fill.price;
        match fill.action {
            OrderAction::Buy => {
                let idx = match state.trades.iter().position(|t| t.matches(fill)) {
                    Some(idx) => idx,
                    None => {
                        state.trades.push(Trade::open(fill));
                        state.trades.len() - 1
                    }
                };
                let trade = &mut state.trades[idx];
                trade.size += fill.size;
                trade.bought += fill.size;
                trade.cost += notional;
                trade.fees += fill.fee;
                trade.entry_price = trade.cost / trade.size;
                state.cash -= notional + fill.fee;
            }
            OrderAction::Sell => {
                let Some(trade) = state.trades.iter_mut().find(|t| t.matches(fill)) else {
                    return Err(ArbError::InvariantViolation(format!(
                        "sell of {} {} on {} with no open trade for position {}",
                        fill.size, fill.side, fill.venue, fill.position_id
                    )));
                };
                if fill.size > trade.size {
                    return Err(ArbError::InvariantViolation(format!(
                        "sell of {} exceeds held {} on {}",
                        fill.size, trade.size, fill.venue
                    )));
                }
                let basis = trade.cost * fill.size / trade.size;
                trade.realized_pnl += notional - basis;
                trade.cost -= basis;
                trade.size -= fill.size;
                trade.fees += fill.fee;
                if trade.size.is_zero() {
                    trade.cost = Decimal::ZERO;
                    trade.status = TradeStatus::Closed;
                    trade.closed_at = Some(fill.at);
                }
                state.cash += notional - fill.fee;
            }
        }
        state.fees_paid += fill.fee;
        debug!(
            canonical_key = %fill.key,
            venue = %fill.venue,
            action = %fill.action,
            side = %fill.side,
            size = %fill.size,
            price = %fill.price,
            "ledger fill applied"
        );
        Ok(())
    }

    fn apply_settlement(state: &mut LedgerState, key: &CanonicalKey, outcome: Side, at: DateTime<Utc>) {
        let mut payout_total = Decimal::ZERO;
        for trade in state.trades.iter_mut().filter(|t| t.is_open() && &t.key == key) {
            let payout = if trade.side == outcome { trade.size } else { Decimal::ZERO };
            trade.realized_pnl += payout - trade.cost;
            trade.cost = Decimal::ZERO;
            trade.size = Decimal::ZERO;
            trade.status = TradeStatus::Settled;
            trade.closed_at = Some(at);
            payout_total += payout;
        }
        state.cash += payout_total;
        info!(canonical_key = %key, outcome = %outcome, payout = %payout_total, "event settled");
    }

    fn realized(state: &LedgerState) -> Decimal {
        state.trades.iter().map(|t| t.realized_pnl).sum::<Decimal>() - state.fees_paid
    }

    // =========================================================================
    // Readers
    // =========================================================================

    #[must_use]
    pub fn starting_balance(&self) -> Decimal {
        self.starting_balance
    }

    /// Cash after purchases, sales, fees and settlements.
    #[must_use]
    pub fn balance(&self) -> Decimal {
        self.state.read().cash
    }

    /// Realized PnL net of fees.
    #[must_use]
    pub fn realized_pnl(&self) -> Decimal {
        Self::realized(&self.state.read())
    }

    /// Cost basis held for one event.
    #[must_use]
    pub fn open_exposure(&self, key: &CanonicalKey) -> Decimal {
        self.state
            .read()
            .trades
            .iter()
            .filter(|t| t.is_open() && &t.key == key)
            .map(|t| t.cost)
            .sum()
    }

    /// Cost basis held across all events.
    #[must_use]
    pub fn aggregate_exposure(&self) -> Decimal {
        self.state
            .read()
            .trades
            .iter()
            .filter(|t| t.is_open())
            .map(|t| t.cost)
            .sum()
    }

    #[must_use]
    pub fn exposure_by_venue(&self) -> BTreeMap<Venue, Decimal> {
        let mut out = BTreeMap::new();
        for trade in self.state.read().trades.iter().filter(|t| t.is_open()) {
            *out.entry(trade.venue).or_insert(Decimal::ZERO) += trade.cost;
        }
        out
    }

    /// True if any contracts are held on the event.
    #[must_use]
    pub fn has_open(&self, key: &CanonicalKey) -> bool {
        self.state
            .read()
            .trades
            .iter()
            .any(|t| t.is_open() && &t.key == key && t.size > Decimal::ZERO)
    }

    /// Events with contracts held.
    #[must_use]
    pub fn open_events(&self) -> BTreeSet<CanonicalKey> {
        self.state
            .read()
            .trades
            .iter()
            .filter(|t| t.is_open() && t.size > Decimal::ZERO)
            .map(|t| t.key.clone())
            .collect()
    }

    /// Net directional contracts held on an event: YES held minus NO held,
    /// as an absolute value. Zero for a complete hedge.
    #[must_use]
    pub fn unhedged_residual(&self, key: &CanonicalKey) -> Decimal {
        let state = self.state.read();
        let net: Decimal = state
            .trades
            .iter()
            .filter(|t| t.is_open() && &t.key == key)
            .map(|t| match t.side {
                Side::Yes => t.size,
                Side::No => -t.size,
            })
            .sum();
        net.abs()
    }

    /// Realized drawdown from peak, as a fraction of starting balance.
    #[must_use]
    pub fn drawdown(&self) -> Decimal {
        if self.starting_balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let state = self.state.read();
        let equity = self.starting_balance + Self::realized(&state);
        ((state.peak_equity - equity) / self.starting_balance).max(Decimal::ZERO)
    }

    /// All trades, oldest first.
    #[must_use]
    pub fn trades(&self) -> Vec<Trade> {
        self.state.read().trades.clone()
    }

    #[must_use]
    pub fn trades_for_position(&self, position_id: Uuid) -> Vec<Trade> {
        self.state
            .read()
            .trades
            .iter()
            .filter(|t| t.position_id == position_id)
            .cloned()
            .collect()
    }

    /// Records mid prices from `quotes` and returns unrealized PnL per event
    /// with open contracts. Legs without a mark are valued at cost.
    pub fn mark_to_market(&self, quotes: &[Quote]) -> BTreeMap<CanonicalKey, Decimal> {
        let mut state = self.state.write();
        for quote in quotes {
            for side in [Side::Yes, Side::No] {
                state
                    .marks
                    .insert((quote.venue(), quote.inner.market_id.clone(), side), quote.mid(side));
            }
        }
        Self::unrealized(&state)
    }

    fn unrealized(state: &LedgerState) -> BTreeMap<CanonicalKey, Decimal> {
        let mut out = BTreeMap::new();
        for trade in state.trades.iter().filter(|t| t.is_open() && t.size > Decimal::ZERO) {
            let mark = state
                .marks
                .get(&(trade.venue, trade.market_id.clone(), trade.side))
                .map_or(trade.cost, |mid| *mid * trade.size);
            *out.entry(trade.key.clone()).or_insert(Decimal::ZERO) += mark - trade.cost;
        }
        out
    }

    #[must_use]
    pub fn summary(&self) -> PortfolioSummary {
        let drawdown = self.drawdown();
        let state = self.state.read();
        let open_events: BTreeSet<&CanonicalKey> = state
            .trades
            .iter()
            .filter(|t| t.is_open() && t.size > Decimal::ZERO)
            .map(|t| &t.key)
            .collect();
        PortfolioSummary {
            starting_balance: self.starting_balance,
            cash: state.cash,
            realized_pnl: Self::realized(&state),
            unrealized_pnl: Self::unrealized(&state).values().copied().sum(),
            fees_paid: state.fees_paid,
            aggregate_exposure: state.trades.iter().filter(|t| t.is_open()).map(|t| t.cost).sum(),
            drawdown,
            open_events: open_events.len(),
            trade_count: state.trades.len(),
        }
    }
}
