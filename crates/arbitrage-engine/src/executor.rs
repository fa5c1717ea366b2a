//! Execution coordinator.
//!
//! Places the two legs of a hedge as one logical transaction:
//!
//! ```text
//! Idle -> LegAPending -> LegAFilled -> LegBPending -> BothFilled
//!              |              |              |
//!              |              |              +-> PartialHedge (residual flagged, event halted)
//!              |              |              +-> Unwinding -> Unwound
//!              |              |                          +-> UnwindFailed (breaker latched)
//!              +-> LegARejected
//!              +-> LegACancelled (timed out, nothing filled)
//!
//! any pending leg or unwind order that survives cancellation -> Unresolved (event halted)
//! ```
//!
//! Leg B is only attempted after leg A's fill is confirmed. A per-event lock
//! is taken before `LegAPending` and released only once the position is
//! terminal, so at most one hedge per canonical event is ever in flight.
//! Under that lock an event that is halted or still holds contracts is
//! refused, since the opportunity may have waited in the queue since gate 1.
//! Every transition is logged and kept on the position as an audit trail.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pm_arb_core::{Settings, UnwindPricing};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connector::{ConnectorError, ConnectorMap, Order, OrderAction, OrderRequest, OrderStatus, VenueConnector};
use crate::edge::FeeSchedule;
use crate::ledger::{LedgerUpdate, LegFill, PortfolioLedger};
use crate::risk::RiskManager;
use crate::types::{CanonicalKey, HedgeLeg, Side, SizedOpportunity, Strategy, Venue};

/// Lowest price an aggressive unwind limit is allowed to reach.
const MIN_UNWIND_PRICE: Decimal = dec!(0.01);

/// Cancel-then-poll rounds before a timed-out order is declared unresolved.
const CANCEL_ATTEMPTS: u32 = 3;

// =============================================================================
// Configuration
// =============================================================================

/// Leg timing, retry and unwind policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// How long a leg may rest before it is cancelled.
    #[serde(with = "millis_serde")]
    pub leg_timeout: Duration,

    /// Delay between order polls.
    #[serde(with = "millis_serde")]
    pub poll_interval: Duration,

    /// Extra placement attempts on timeout or transient errors.
    pub leg_retry_attempts: u32,

    /// Unwind attempts before giving up.
    pub unwind_max_attempts: u32,

    /// First unwind retry delay; doubles per attempt.
    #[serde(with = "millis_serde")]
    pub unwind_backoff_base: Duration,

    /// Ceiling on the unwind retry delay.
    #[serde(with = "millis_serde")]
    pub unwind_backoff_max: Duration,

    pub unwind_pricing: UnwindPricing,

    /// Price concession below the leg A fill for aggressive-limit unwinds.
    pub unwind_limit_offset: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            leg_timeout: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(250),
            leg_retry_attempts: 2,
            unwind_max_attempts: 5,
            unwind_backoff_base: Duration::from_millis(500),
            unwind_backoff_max: Duration::from_millis(8000),
            unwind_pricing: UnwindPricing::Market,
            unwind_limit_offset: dec!(0.02),
        }
    }
}

impl ExecutionConfig {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            leg_timeout: Duration::from_millis(settings.leg_timeout_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            leg_retry_attempts: settings.leg_retry_attempts,
            unwind_max_attempts: settings.unwind_max_attempts,
            unwind_backoff_base: Duration::from_millis(settings.unwind_backoff_base_ms),
            unwind_backoff_max: Duration::from_millis(settings.unwind_backoff_max_ms),
            unwind_pricing: settings.unwind_pricing,
            unwind_limit_offset: settings.unwind_limit_offset,
        }
    }

    /// Fast timings for tests and replays.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            leg_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
            unwind_backoff_base: Duration::from_millis(1),
            unwind_backoff_max: Duration::from_millis(4),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_leg_timeout(mut self, timeout: Duration) -> Self {
        self.leg_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_unwind_pricing(mut self, pricing: UnwindPricing) -> Self {
        self.unwind_pricing = pricing;
        self
    }

    #[must_use]
    pub fn with_unwind_max_attempts(mut self, attempts: u32) -> Self {
        self.unwind_max_attempts = attempts;
        self
    }

    /// Delay after unwind attempt `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped.
    #[must_use]
    pub fn unwind_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.unwind_backoff_base
            .checked_mul(factor)
            .unwrap_or(self.unwind_backoff_max)
            .min(self.unwind_backoff_max)
    }
}

// =============================================================================
// Hedge State Machine
// =============================================================================

/// State of one hedge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HedgeState {
    Idle,
    LegAPending,
    LegAFilled,
    /// Leg A refused by the venue; nothing opened.
    LegARejected,
    /// Leg A timed out without fills and was cancelled.
    LegACancelled,
    LegBPending,
    BothFilled,
    Unwinding,
    Unwound,
    /// Unwind attempts exhausted; exposure remains. Operator action required.
    UnwindFailed,
    /// Leg B filled only partly; the residual is tracked and the event halted.
    PartialHedge,
    /// An order could not be confirmed dead after cancellation; it is kept
    /// on the position and the event halted.
    Unresolved,
}

impl HedgeState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::LegAPending => "leg_a_pending",
            Self::LegAFilled => "leg_a_filled",
            Self::LegARejected => "leg_a_rejected",
            Self::LegACancelled => "leg_a_cancelled",
            Self::LegBPending => "leg_b_pending",
            Self::BothFilled => "both_filled",
            Self::Unwinding => "unwinding",
            Self::Unwound => "unwound",
            Self::UnwindFailed => "unwind_failed",
            Self::PartialHedge => "partial_hedge",
            Self::Unresolved => "unresolved",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::LegARejected
                | Self::LegACancelled
                | Self::BothFilled
                | Self::Unwound
                | Self::UnwindFailed
                | Self::PartialHedge
                | Self::Unresolved
        )
    }
}

impl std::fmt::Display for HedgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One audited state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: HedgeState,
    pub to: HedgeState,
    pub trigger: String,
    pub at: DateTime<Utc>,
}

/// The pair of orders placed for one opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgePosition {
    pub id: Uuid,
    pub key: CanonicalKey,
    pub strategy: Strategy,
    /// Target contracts per leg.
    pub size: Decimal,
    pub leg_a: Option<Order>,
    pub leg_b: Option<Order>,
    pub unwind_orders: Vec<Order>,
    pub state: HedgeState,
    /// Contracts left unhedged at the terminal state.
    pub residual: Decimal,
    /// Order that may still be working at its venue.
    #[serde(default)]
    pub open_order: Option<Order>,
    pub transitions: Vec<Transition>,
    pub opened_at: DateTime<Utc>,
}

impl HedgePosition {
    fn new(sized: &SizedOpportunity) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: sized.key().clone(),
            strategy: sized.opportunity.strategy,
            size: sized.size,
            leg_a: None,
            leg_b: None,
            unwind_orders: Vec::new(),
            state: HedgeState::Idle,
            residual: Decimal::ZERO,
            open_order: None,
            transitions: Vec::new(),
            opened_at: Utc::now(),
        }
    }

    fn transition(&mut self, to: HedgeState, trigger: impl Into<String>) {
        let trigger = trigger.into();
        let from = self.state;
        match to {
            HedgeState::UnwindFailed | HedgeState::Unresolved => error!(
                position_id = %self.id, canonical_key = %self.key, from = %from, to = %to, trigger = %trigger,
                "hedge transition"
            ),
            HedgeState::LegARejected | HedgeState::Unwinding | HedgeState::PartialHedge | HedgeState::Unwound => warn!(
                position_id = %self.id, canonical_key = %self.key, from = %from, to = %to, trigger = %trigger,
                "hedge transition"
            ),
            _ => info!(
                position_id = %self.id, canonical_key = %self.key, from = %from, to = %to, trigger = %trigger,
                "hedge transition"
            ),
        }
        self.transitions.push(Transition {
            from,
            to,
            trigger,
            at: Utc::now(),
        });
        self.state = to;
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// States visited, in order, starting from `Idle`.
    #[must_use]
    pub fn path(&self) -> Vec<HedgeState> {
        std::iter::once(HedgeState::Idle)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }
}

// =============================================================================
// Per-Event Locks
// =============================================================================

/// Exclusive per-canonical-event locks. Unrelated events never contend.
#[derive(Debug, Clone, Default)]
pub struct EventLocks {
    held: Arc<Mutex<HashSet<CanonicalKey>>>,
}

impl EventLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `key`, or `None` if a hedge is already in flight.
    #[must_use]
    pub fn try_acquire(&self, key: &CanonicalKey) -> Option<EventLockGuard> {
        if !self.held.lock().insert(key.clone()) {
            return None;
        }
        Some(EventLockGuard {
            held: Arc::clone(&self.held),
            key: key.clone(),
        })
    }

    #[must_use]
    pub fn is_locked(&self, key: &CanonicalKey) -> bool {
        self.held.lock().contains(key)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.held.lock().len()
    }
}

/// Releases its event lock on drop.
#[derive(Debug)]
pub struct EventLockGuard {
    held: Arc<Mutex<HashSet<CanonicalKey>>>,
    key: CanonicalKey,
}

impl Drop for EventLockGuard {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of handing one sized opportunity to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    /// The hedge ran to a terminal state.
    Completed(HedgePosition),
    /// Another hedge on the same event is in flight.
    EventBusy { key: CanonicalKey },
    /// Trading is paused; no leg was placed.
    Paused { key: CanonicalKey },
    /// The event is halted or already holds contracts; no leg was placed.
    Blocked { key: CanonicalKey, reason: String },
}

impl ExecutionOutcome {
    #[must_use]
    pub fn position(&self) -> Option<&HedgePosition> {
        match self {
            Self::Completed(position) => Some(position),
            _ => None,
        }
    }

    #[must_use]
    pub fn state(&self) -> Option<HedgeState> {
        self.position().map(|p| p.state)
    }

    /// Both legs filled as intended.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state() == Some(HedgeState::BothFilled)
    }

    /// Unhedged exposure remains.
    #[must_use]
    pub fn has_exposure(&self) -> bool {
        matches!(
            self.state(),
            Some(HedgeState::PartialHedge | HedgeState::UnwindFailed | HedgeState::Unresolved)
        )
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Drives hedges through the state machine and reports fills to the ledger.
pub struct ExecutionCoordinator {
    config: ExecutionConfig,
    connectors: ConnectorMap,
    ledger: Arc<PortfolioLedger>,
    risk: Arc<RiskManager>,
    fees: FeeSchedule,
    locks: EventLocks,
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("config", &self.config)
            .field("venues", &self.connectors.keys().collect::<Vec<_>>())
            .field("in_flight", &self.locks.in_flight())
            .finish_non_exhaustive()
    }
}

impl ExecutionCoordinator {
    #[must_use]
    pub fn new(
        config: ExecutionConfig,
        connectors: ConnectorMap,
        ledger: Arc<PortfolioLedger>,
        risk: Arc<RiskManager>,
        fees: FeeSchedule,
    ) -> Self {
        Self {
            config,
            connectors,
            ledger,
            risk,
            fees,
            locks: EventLocks::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    #[must_use]
    pub fn locks(&self) -> &EventLocks {
        &self.locks
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<PortfolioLedger> {
        &self.ledger
    }

    /// Runs one hedge to a terminal state.
    pub async fn execute(&self, sized: SizedOpportunity) -> ExecutionOutcome {
        let key = sized.key().clone();
        let Some(_guard) = self.locks.try_acquire(&key) else {
            debug!(canonical_key = %key, "hedge already in flight for event");
            self.release_trial(&sized);
            return ExecutionOutcome::EventBusy { key };
        };
        if self.risk.pause_signal().is_paused() {
            self.release_trial(&sized);
            return ExecutionOutcome::Paused { key };
        }
        let blocked = if self.risk.is_halted(&key) {
            Some("event halted")
        } else if self.ledger.has_open(&key) {
            Some("event already holds a position")
        } else {
            None
        };
        if let Some(reason) = blocked {
            info!(canonical_key = %key, reason, "hedge refused");
            self.release_trial(&sized);
            return ExecutionOutcome::Blocked {
                key,
                reason: reason.to_string(),
            };
        }

        info!(
            canonical_key = %key,
            strategy = %sized.opportunity.strategy,
            edge_bps = %sized.opportunity.edge_bps,
            size = %sized.size,
            leg_a = %sized.opportunity.leg_a.venue,
            leg_b = %sized.opportunity.leg_b.venue,
            trial = sized.breaker_trial,
            "executing hedge"
        );

        let mut position = HedgePosition::new(&sized);
        self.run(&sized, &mut position).await;
        if position.state == HedgeState::LegACancelled {
            self.release_trial(&sized);
        }
        ExecutionOutcome::Completed(position)
    }

    /// Records an event's resolution in the ledger.
    pub fn settle_event(&self, key: &CanonicalKey, outcome: Side) {
        let update = LedgerUpdate::Settled {
            key: key.clone(),
            outcome,
            at: Utc::now(),
        };
        if let Err(err) = self.ledger.apply(update) {
            error!(canonical_key = %key, error = %err, "settlement rejected by ledger");
        }
    }

    async fn run(&self, sized: &SizedOpportunity, position: &mut HedgePosition) {
        let opportunity = &sized.opportunity;
        let leg_a = &opportunity.leg_a;
        let leg_b = &opportunity.leg_b;

        // Leg A.
        position.transition(
            HedgeState::LegAPending,
            format!("placing {} {} x{} @ {} on {}", leg_a.side, leg_a.market_id, sized.size, leg_a.price, leg_a.venue),
        );
        let request_a = OrderRequest::buy_limit(leg_a.venue, &leg_a.market_id, leg_a.side, leg_a.price, sized.size);
        let order_a = match self.place_leg(&request_a).await {
            Ok(order) => order,
            Err(err) => {
                position.transition(HedgeState::LegARejected, format!("leg A rejected: {err}"));
                self.risk.breaker().record_failure();
                return;
            }
        };
        let order_a = match self.await_fill(leg_a.venue, order_a).await {
            LegWait::Settled(order) => order,
            LegWait::Unresolved(order) => {
                position.leg_a = Some(order.clone());
                let residual = order.filled_size;
                self.hold_unresolved(position, leg_a, OrderAction::Buy, order, leg_a.price, residual);
                return;
            }
        };
        position.leg_a = Some(order_a.clone());
        if !order_a.has_fills() {
            position.transition(
                HedgeState::LegACancelled,
                format!("leg A {} without fills after {:?}", order_a.status, self.config.leg_timeout),
            );
            return;
        }
        let fill_a = order_a.avg_fill_price.unwrap_or(leg_a.price);
        self.record_fill(position, leg_a, OrderAction::Buy, order_a.filled_size, fill_a);
        let hedge_size = order_a.filled_size;
        position.transition(HedgeState::LegAFilled, format!("leg A filled {hedge_size} @ {fill_a}"));

        // Leg B, sized to what leg A actually filled.
        position.transition(
            HedgeState::LegBPending,
            format!("placing {} {} x{hedge_size} @ {} on {}", leg_b.side, leg_b.market_id, leg_b.price, leg_b.venue),
        );
        let request_b = OrderRequest::buy_limit(leg_b.venue, &leg_b.market_id, leg_b.side, leg_b.price, hedge_size);
        let order_b = match self.place_leg(&request_b).await {
            Ok(order) => match self.await_fill(leg_b.venue, order).await {
                LegWait::Settled(order) => order,
                LegWait::Unresolved(order) => {
                    position.leg_b = Some(order.clone());
                    let residual = (hedge_size - order.filled_size).max(Decimal::ZERO);
                    self.hold_unresolved(position, leg_b, OrderAction::Buy, order, leg_b.price, residual);
                    return;
                }
            },
            Err(err) => {
                self.unwind(position, leg_a, hedge_size, fill_a, format!("leg B rejected: {err}"))
                    .await;
                return;
            }
        };
        position.leg_b = Some(order_b.clone());

        if order_b.has_fills() {
            let fill_b = order_b.avg_fill_price.unwrap_or(leg_b.price);
            self.record_fill(position, leg_b, OrderAction::Buy, order_b.filled_size, fill_b);
        }

        if order_b.filled_size >= hedge_size {
            position.transition(HedgeState::BothFilled, format!("leg B filled {}", order_b.filled_size));
            self.risk.breaker().record_success();
        } else if order_b.has_fills() {
            position.residual = hedge_size - order_b.filled_size;
            position.transition(
                HedgeState::PartialHedge,
                format!("leg B filled {} of {hedge_size}, residual {}", order_b.filled_size, position.residual),
            );
            self.risk.halt_event(&position.key, "partial hedge residual");
            self.risk.breaker().record_failure();
        } else {
            let trigger = format!("leg B {} without fills", order_b.status);
            self.unwind(position, leg_a, hedge_size, fill_a, trigger).await;
        }
    }

    /// Closes leg A's filled size on venue A with bounded, backed-off retries.
    async fn unwind(
        &self,
        position: &mut HedgePosition,
        leg_a: &HedgeLeg,
        size: Decimal,
        fill_price: Decimal,
        trigger: String,
    ) {
        position.transition(HedgeState::Unwinding, trigger);
        let mut remaining = size;
        let max_attempts = self.config.unwind_max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let mut request = OrderRequest::sell_market(leg_a.venue, &leg_a.market_id, leg_a.side, remaining);
            if self.config.unwind_pricing == UnwindPricing::AggressiveLimit {
                request = request.with_limit((fill_price - self.config.unwind_limit_offset).max(MIN_UNWIND_PRICE));
            }

            match self.place_once(&request).await {
                Ok(order) => {
                    let order = match self.await_fill(leg_a.venue, order).await {
                        LegWait::Settled(order) => order,
                        LegWait::Unresolved(order) => {
                            position.unwind_orders.push(order.clone());
                            let residual = (remaining - order.filled_size).max(Decimal::ZERO);
                            self.hold_unresolved(position, leg_a, OrderAction::Sell, order, fill_price, residual);
                            self.risk.breaker().force_open("unwind order unresolved");
                            return;
                        }
                    };
                    if order.has_fills() {
                        let price = order.avg_fill_price.unwrap_or(fill_price);
                        self.record_fill(position, leg_a, OrderAction::Sell, order.filled_size, price);
                        remaining -= order.filled_size;
                    }
                    position.unwind_orders.push(order);
                }
                Err(err) => {
                    warn!(
                        position_id = %position.id,
                        canonical_key = %position.key,
                        attempt,
                        error = %err,
                        "unwind attempt failed"
                    );
                }
            }

            if remaining <= Decimal::ZERO {
                position.transition(HedgeState::Unwound, format!("leg A closed after {attempt} attempt(s)"));
                self.risk.breaker().record_failure();
                return;
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.config.unwind_backoff(attempt)).await;
            }
        }

        position.residual = remaining;
        position.transition(
            HedgeState::UnwindFailed,
            format!("{remaining} contracts still open after {max_attempts} unwind attempts"),
        );
        self.risk.breaker().force_open("unwind failed");
        self.risk.halt_event(&position.key, "unwind failed");
    }

    fn connector(&self, venue: Venue) -> Result<&Arc<dyn VenueConnector>, ConnectorError> {
        self.connectors
            .get(&venue)
            .ok_or_else(|| ConnectorError::rejected(format!("no connector for {venue}")))
    }

    /// Places an order, retrying timeouts and transient errors.
    async fn place_leg(&self, request: &OrderRequest) -> Result<Order, ConnectorError> {
        let attempts = self.config.leg_retry_attempts + 1;
        let mut last = ConnectorError::timeout("place_order");
        for attempt in 1..=attempts {
            match self.place_once(request).await {
                Ok(order) => return Ok(order),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    debug!(venue = %request.venue, attempt, error = %err, "retrying order placement");
                    last = err;
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    async fn place_once(&self, request: &OrderRequest) -> Result<Order, ConnectorError> {
        let connector = self.connector(request.venue)?;
        let order = tokio::time::timeout(self.config.leg_timeout, connector.place_order(request))
            .await
            .map_err(|_| ConnectorError::timeout("place_order"))??;
        if order.status == OrderStatus::Rejected {
            return Err(ConnectorError::rejected(
                order.reason.unwrap_or_else(|| "rejected".to_string()),
            ));
        }
        Ok(order)
    }

    /// Polls until the order is terminal or the leg timeout passes. On
    /// timeout the order is cancelled and re-polled, a bounded number of
    /// times, until the venue reports it terminal; late fills are counted.
    async fn await_fill(&self, venue: Venue, order: Order) -> LegWait {
        let Ok(connector) = self.connector(venue) else {
            return LegWait::Unresolved(order);
        };
        let deadline = Instant::now() + self.config.leg_timeout;
        let mut current = order;

        while !current.is_terminal() && Instant::now() < deadline {
            tokio::time::sleep(self.config.poll_interval).await;
            match tokio::time::timeout(self.config.leg_timeout, connector.poll_order(&current.id)).await {
                Ok(Ok(order)) => current = order,
                Ok(Err(err)) => debug!(venue = %venue, order_id = %current.id, error = %err, "poll failed"),
                Err(_) => debug!(venue = %venue, order_id = %current.id, "poll timed out"),
            }
        }
        if current.is_terminal() {
            return LegWait::Settled(current);
        }

        for attempt in 1..=CANCEL_ATTEMPTS {
            match tokio::time::timeout(self.config.leg_timeout, connector.cancel_order(&current.id)).await {
                Ok(Ok(cancelled)) => debug!(venue = %venue, order_id = %current.id, cancelled, "cancelled resting order"),
                Ok(Err(err)) => warn!(venue = %venue, order_id = %current.id, attempt, error = %err, "cancel failed"),
                Err(_) => warn!(venue = %venue, order_id = %current.id, attempt, "cancel timed out"),
            }
            match tokio::time::timeout(self.config.leg_timeout, connector.poll_order(&current.id)).await {
                Ok(Ok(order)) => current = order,
                Ok(Err(err)) => warn!(venue = %venue, order_id = %current.id, attempt, error = %err, "poll after cancel failed"),
                Err(_) => warn!(venue = %venue, order_id = %current.id, attempt, "poll after cancel timed out"),
            }
            if current.is_terminal() {
                return LegWait::Settled(current);
            }
            if attempt < CANCEL_ATTEMPTS {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
        error!(
            venue = %venue,
            order_id = %current.id,
            status = %current.status,
            filled = %current.filled_size,
            "order still working after cancel attempts"
        );
        LegWait::Unresolved(current)
    }

    /// Books what an unresolved order filled so far, keeps the order on the
    /// position and halts the event. Nothing more is placed for this hedge.
    fn hold_unresolved(
        &self,
        position: &mut HedgePosition,
        leg: &HedgeLeg,
        action: OrderAction,
        order: Order,
        fallback_price: Decimal,
        residual: Decimal,
    ) {
        if order.has_fills() {
            let price = order.avg_fill_price.unwrap_or(fallback_price);
            self.record_fill(position, leg, action, order.filled_size, price);
        }
        position.residual = residual;
        position.transition(
            HedgeState::Unresolved,
            format!(
                "{} order {} still {} after cancel, {} filled",
                order.venue, order.id, order.status, order.filled_size
            ),
        );
        position.open_order = Some(order);
        self.risk.halt_event(&position.key, "order state unresolved");
        self.risk.breaker().record_failure();
    }

    fn record_fill(&self, position: &HedgePosition, leg: &HedgeLeg, action: OrderAction, size: Decimal, price: Decimal) {
        let fill = LegFill {
            position_id: position.id,
            key: position.key.clone(),
            venue: leg.venue,
            market_id: leg.market_id.clone(),
            side: leg.side,
            action,
            size,
            price,
            fee: self.fees.fee_for(leg.venue, size * price),
            at: Utc::now(),
        };
        if let Err(err) = self.ledger.apply(LedgerUpdate::Fill(fill)) {
            error!(position_id = %position.id, canonical_key = %position.key, error = %err, "ledger rejected fill");
            self.risk.halt_event(&position.key, "ledger invariant violation");
        }
    }

    fn release_trial(&self, sized: &SizedOpportunity) {
        if sized.breaker_trial {
            self.risk.breaker().cancel_trial();
        }
    }
}

/// What polling a placed order established.
enum LegWait {
    /// The venue reports the order terminal.
    Settled(Order),
    /// The order may still be working at the venue.
    Unresolved(Order),
}

// =============================================================================
// Duration Serde Helper
// =============================================================================

mod millis_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{PaperConnector, PaperScript};
    use crate::risk::{BreakerState, CircuitBreaker, CircuitBreakerConfig, RiskConfig};
    use crate::types::{ArbitrageOpportunity, QuotePair, VenueQuote};
    use chrono::TimeZone;

    struct Harness {
        poly: Arc<PaperConnector>,
        kalshi: Arc<PaperConnector>,
        ledger: Arc<PortfolioLedger>,
        risk: Arc<RiskManager>,
        coordinator: ExecutionCoordinator,
    }

    fn harness(config: ExecutionConfig) -> Harness {
        let poly = Arc::new(PaperConnector::always_fill(Venue::Polymarket));
        let kalshi = Arc::new(PaperConnector::always_fill(Venue::Kalshi));
        for (connector, venue) in [(&poly, Venue::Polymarket), (&kalshi, Venue::Kalshi)] {
            connector.set_reference_quote(venue_quote(venue));
        }
        let ledger = Arc::new(PortfolioLedger::new(dec!(10000)));
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let risk = Arc::new(RiskManager::new(RiskConfig::default(), breaker, Arc::clone(&ledger)));
        let mut connectors: ConnectorMap = ConnectorMap::new();
        connectors.insert(Venue::Polymarket, poly.clone());
        connectors.insert(Venue::Kalshi, kalshi.clone());
        let coordinator = ExecutionCoordinator::new(
            config,
            connectors,
            Arc::clone(&ledger),
            Arc::clone(&risk),
            FeeSchedule::zero(),
        );
        Harness {
            poly,
            kalshi,
            ledger,
            risk,
            coordinator,
        }
    }

    fn key() -> CanonicalKey {
        CanonicalKey::parse("ELECTION:US:PRESIDENT:2028-11-07:DEM").unwrap()
    }

    fn venue_quote(venue: Venue) -> VenueQuote {
        VenueQuote {
            venue,
            market_id: format!("{venue}-mkt"),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            bid_yes: dec!(0.40),
            ask_yes: dec!(0.42),
            bid_no: dec!(0.49),
            ask_no: dec!(0.51),
            bid_size: dec!(500),
            ask_size: dec!(500),
            expires_at: None,
        }
    }

    fn sized(size: Decimal) -> SizedOpportunity {
        let a = venue_quote(Venue::Polymarket).resolved(key());
        let b = venue_quote(Venue::Kalshi).resolved(key());
        SizedOpportunity {
            opportunity: ArbitrageOpportunity {
                key: key(),
                strategy: Strategy::YesANoB,
                edge_bps: dec!(649),
                gross_cost: dec!(0.93),
                net_cost: dec!(0.935),
                max_size: dec!(500),
                leg_a: HedgeLeg {
                    venue: Venue::Polymarket,
                    market_id: "polymarket-mkt".into(),
                    side: Side::Yes,
                    price: dec!(0.42),
                    available: dec!(500),
                },
                leg_b: HedgeLeg {
                    venue: Venue::Kalshi,
                    market_id: "kalshi-mkt".into(),
                    side: Side::No,
                    price: dec!(0.51),
                    available: dec!(500),
                },
                computed_at: a.timestamp(),
                pair: QuotePair {
                    key: key(),
                    bucket_close: a.timestamp(),
                    a,
                    b,
                },
            },
            size,
            notional: size * dec!(0.935),
            breaker_trial: false,
        }
    }

    // ==================== Config Tests ====================

    #[test]
    fn test_unwind_backoff_doubles_and_caps() {
        let config = ExecutionConfig::default();
        assert_eq!(config.unwind_backoff(1), Duration::from_millis(500));
        assert_eq!(config.unwind_backoff(2), Duration::from_millis(1000));
        assert_eq!(config.unwind_backoff(4), Duration::from_millis(4000));
        assert_eq!(config.unwind_backoff(5), Duration::from_millis(8000));
        assert_eq!(config.unwind_backoff(40), Duration::from_millis(8000));
    }

    #[test]
    fn test_execution_config_serde_millis() {
        let config = ExecutionConfig::fast();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["leg_timeout"], 50);
        let back: ExecutionConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    // ==================== State Machine Tests ====================

    #[tokio::test]
    async fn test_both_legs_fill() {
        let h = harness(ExecutionConfig::fast());
        let outcome = h.coordinator.execute(sized(dec!(100))).await;

        assert!(outcome.is_success());
        let position = outcome.position().unwrap();
        assert_eq!(
            position.path(),
            vec![
                HedgeState::Idle,
                HedgeState::LegAPending,
                HedgeState::LegAFilled,
                HedgeState::LegBPending,
                HedgeState::BothFilled
            ]
        );
        assert_eq!(h.ledger.open_exposure(&key()), dec!(93));
        assert_eq!(h.ledger.unhedged_residual(&key()), Decimal::ZERO);
        assert!(!h.coordinator.locks().is_locked(&key()));
    }

    #[tokio::test]
    async fn test_leg_a_rejected_creates_no_exposure() {
        let h = harness(ExecutionConfig::fast());
        h.poly.script(PaperScript::Reject("insufficient balance".into()));
        let outcome = h.coordinator.execute(sized(dec!(100))).await;

        assert_eq!(outcome.state(), Some(HedgeState::LegARejected));
        assert_eq!(h.kalshi.orders_placed(), 0);
        assert_eq!(h.ledger.aggregate_exposure(), Decimal::ZERO);
        assert_eq!(h.risk.breaker().snapshot().recent_failures, 1);
    }

    #[tokio::test]
    async fn test_leg_a_timeout_cancels_and_abandons() {
        let h = harness(ExecutionConfig::fast());
        h.poly.script(PaperScript::Rest);
        let outcome = h.coordinator.execute(sized(dec!(100))).await;

        assert_eq!(outcome.state(), Some(HedgeState::LegACancelled));
        let leg_a = outcome.position().unwrap().leg_a.clone().unwrap();
        assert_eq!(leg_a.status, OrderStatus::Cancelled);
        assert_eq!(h.kalshi.orders_placed(), 0);
        assert_eq!(h.ledger.aggregate_exposure(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_leg_b_rejected_unwinds_leg_a() {
        let h = harness(ExecutionConfig::fast());
        h.kalshi.script(PaperScript::Reject("market closed".into()));
        let outcome = h.coordinator.execute(sized(dec!(100))).await;

        let position = outcome.position().unwrap();
        assert_eq!(position.state, HedgeState::Unwound);
        assert_eq!(position.unwind_orders.len(), 1);
        let unwind = &position.unwind_orders[0];
        assert_eq!(unwind.action, OrderAction::Sell);
        assert_eq!(unwind.side, Side::Yes);
        assert_eq!(unwind.venue, Venue::Polymarket);
        assert_eq!(unwind.filled_size, dec!(100));
        assert_eq!(h.ledger.open_exposure(&key()), Decimal::ZERO);
        assert_eq!(h.ledger.trades_for_position(position.id).len(), 1);
        assert!(!outcome.has_exposure());
    }

    #[tokio::test]
    async fn test_leg_b_partial_is_flagged() {
        let h = harness(ExecutionConfig::fast());
        h.kalshi.script(PaperScript::PartialFill(dec!(0.4)));
        let outcome = h.coordinator.execute(sized(dec!(100))).await;

        let position = outcome.position().unwrap();
        assert_eq!(position.state, HedgeState::PartialHedge);
        assert_eq!(position.residual, dec!(60));
        assert!(outcome.has_exposure());
        assert_eq!(h.ledger.unhedged_residual(&key()), dec!(60));
        assert!(h.risk.is_halted(&key()));
    }

    #[tokio::test]
    async fn test_partial_leg_a_hedges_filled_quantity() {
        let h = harness(ExecutionConfig::fast());
        h.poly.script(PaperScript::PartialFill(dec!(0.3)));
        let outcome = h.coordinator.execute(sized(dec!(100))).await;

        assert!(outcome.is_success());
        let position = outcome.position().unwrap();
        assert_eq!(position.leg_b.as_ref().unwrap().size, dec!(30));
        assert_eq!(h.ledger.unhedged_residual(&key()), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unwind_retries_then_succeeds() {
        let h = harness(ExecutionConfig::fast());
        h.kalshi.script(PaperScript::Reject("halted".into()));
        h.poly.script_all([
            PaperScript::Fill,
            PaperScript::Fail(ConnectorError::Transient("503".into())),
            PaperScript::Reject("no bids".into()),
            PaperScript::Fill,
        ]);
        let outcome = h.coordinator.execute(sized(dec!(100))).await;

        assert_eq!(outcome.state(), Some(HedgeState::Unwound));
        assert!(outcome.position().unwrap().transitions.last().unwrap().trigger.contains("3 attempt"));
    }

    #[tokio::test]
    async fn test_unwind_failure_latches_breaker() {
        let h = harness(ExecutionConfig::fast().with_unwind_max_attempts(2));
        h.kalshi.script(PaperScript::Reject("halted".into()));
        h.poly.script_all([
            PaperScript::Fill,
            PaperScript::Reject("no bids".into()),
            PaperScript::Reject("no bids".into()),
        ]);
        let outcome = h.coordinator.execute(sized(dec!(100))).await;

        let position = outcome.position().unwrap();
        assert_eq!(position.state, HedgeState::UnwindFailed);
        assert_eq!(position.residual, dec!(100));
        assert!(outcome.has_exposure());
        assert_eq!(h.risk.breaker().state(), BreakerState::Open);
        assert!(h.risk.breaker().snapshot().latched);
        assert!(h.risk.is_halted(&key()));
    }

    #[tokio::test]
    async fn test_aggressive_limit_unwind_price() {
        let h = harness(ExecutionConfig::fast().with_unwind_pricing(UnwindPricing::AggressiveLimit));
        h.kalshi.script(PaperScript::Reject("halted".into()));
        let outcome = h.coordinator.execute(sized(dec!(10))).await;

        let unwind = &outcome.position().unwrap().unwind_orders[0];
        assert_eq!(unwind.limit_price, Some(dec!(0.40)));
    }

    #[tokio::test]
    async fn test_leg_b_timeout_unwinds_leg_a() {
        let h = harness(ExecutionConfig::fast());
        h.kalshi.script(PaperScript::Rest);
        let outcome = h.coordinator.execute(sized(dec!(100))).await;

        let position = outcome.position().unwrap();
        assert_eq!(position.state, HedgeState::Unwound);
        let leg_b = position.leg_b.as_ref().unwrap();
        assert_eq!(leg_b.status, OrderStatus::Cancelled);
        assert_eq!(leg_b.filled_size, Decimal::ZERO);
        assert_eq!(h.kalshi.orders()[0].status, OrderStatus::Cancelled);
        assert_eq!(position.unwind_orders[0].filled_size, dec!(100));
        assert_eq!(h.ledger.open_exposure(&key()), Decimal::ZERO);
        assert!(!h.ledger.has_open(&key()));
    }

    #[tokio::test]
    async fn test_late_fills_inside_timeout_complete_hedge() {
        let h = harness(ExecutionConfig::fast());
        h.poly.script(PaperScript::FillAfterPolls(3));
        h.kalshi.script(PaperScript::FillAfterPolls(2));
        let outcome = h.coordinator.execute(sized(dec!(100))).await;

        assert!(outcome.is_success());
        let position = outcome.position().unwrap();
        assert_eq!(position.leg_a.as_ref().unwrap().status, OrderStatus::Filled);
        assert_eq!(position.leg_b.as_ref().unwrap().filled_size, dec!(100));
        assert!(position.unwind_orders.is_empty());
        assert_eq!(h.ledger.unhedged_residual(&key()), Decimal::ZERO);
    }

    // ==================== Unresolved Order Tests ====================

    #[tokio::test]
    async fn test_leg_b_surviving_cancel_halts_without_unwind() {
        let h = harness(ExecutionConfig::fast());
        h.kalshi.script(PaperScript::Unresponsive);
        let outcome = h.coordinator.execute(sized(dec!(100))).await;

        let position = outcome.position().unwrap();
        assert_eq!(position.state, HedgeState::Unresolved);
        assert!(outcome.has_exposure());
        let open = position.open_order.as_ref().unwrap();
        assert_eq!(open.venue, Venue::Kalshi);
        assert_eq!(open.status, OrderStatus::Pending);
        assert!(position.unwind_orders.is_empty());
        assert_eq!(position.residual, dec!(100));
        assert_eq!(h.poly.orders_placed(), 1);
        assert_eq!(h.ledger.unhedged_residual(&key()), dec!(100));
        assert!(h.risk.is_halted(&key()));
    }

    #[tokio::test]
    async fn test_unwind_order_surviving_cancel_stops_unwinding() {
        let h = harness(ExecutionConfig::fast());
        h.kalshi.script(PaperScript::Reject("halted".into()));
        h.poly.script_all([PaperScript::Fill, PaperScript::Unresponsive]);
        let outcome = h.coordinator.execute(sized(dec!(100))).await;

        let position = outcome.position().unwrap();
        assert_eq!(position.state, HedgeState::Unresolved);
        assert_eq!(position.unwind_orders.len(), 1);
        assert_eq!(position.residual, dec!(100));
        // No second sell while the first may still execute.
        assert_eq!(h.poly.orders_placed(), 2);
        assert_eq!(h.risk.breaker().state(), BreakerState::Open);
        assert!(h.risk.is_halted(&key()));
    }

    // ==================== Gating Tests ====================

    #[tokio::test]
    async fn test_event_with_open_position_is_blocked() {
        let h = harness(ExecutionConfig::fast());
        assert!(h.coordinator.execute(sized(dec!(100))).await.is_success());

        let second = h.coordinator.execute(sized(dec!(100))).await;
        assert!(matches!(second, ExecutionOutcome::Blocked { .. }));
        assert_eq!(h.ledger.open_exposure(&key()), dec!(93));
        assert_eq!(h.poly.orders_placed(), 1);
        assert_eq!(h.kalshi.orders_placed(), 1);
    }

    #[tokio::test]
    async fn test_halted_event_is_blocked() {
        let h = harness(ExecutionConfig::fast());
        h.kalshi.script(PaperScript::PartialFill(dec!(0.4)));
        let first = h.coordinator.execute(sized(dec!(100))).await;
        assert_eq!(first.state(), Some(HedgeState::PartialHedge));

        let second = h.coordinator.execute(sized(dec!(100))).await;
        match second {
            ExecutionOutcome::Blocked { key: blocked, reason } => {
                assert_eq!(blocked, key());
                assert_eq!(reason, "event halted");
            }
            other => panic!("expected blocked, got {other:?}"),
        }
        assert_eq!(h.kalshi.orders_placed(), 1);
        assert_eq!(h.ledger.unhedged_residual(&key()), dec!(60));
    }

    #[tokio::test]
    async fn test_blocked_hedge_releases_breaker_trial() {
        let h = harness(ExecutionConfig::fast());
        h.risk.halt_event(&key(), "operator");
        let mut trial = sized(dec!(10));
        trial.breaker_trial = true;
        let outcome = h.coordinator.execute(trial).await;
        assert!(matches!(outcome, ExecutionOutcome::Blocked { .. }));
        assert_eq!(h.poly.orders_placed(), 0);
        assert_eq!(h.risk.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_paused_blocks_new_hedges() {
        let h = harness(ExecutionConfig::fast());
        h.risk.pause_signal().pause();
        let outcome = h.coordinator.execute(sized(dec!(10))).await;
        assert_eq!(outcome, ExecutionOutcome::Paused { key: key() });
        assert_eq!(h.poly.orders_placed(), 0);
    }

    #[tokio::test]
    async fn test_event_lock_rejects_second_hedge() {
        let h = harness(ExecutionConfig::fast());
        let _held = h.coordinator.locks().try_acquire(&key()).unwrap();
        let outcome = h.coordinator.execute(sized(dec!(10))).await;
        assert_eq!(outcome, ExecutionOutcome::EventBusy { key: key() });
    }

    #[test]
    fn test_lock_guard_releases_on_drop() {
        let locks = EventLocks::new();
        {
            let _guard = locks.try_acquire(&key()).unwrap();
            assert!(locks.try_acquire(&key()).is_none());
            assert_eq!(locks.in_flight(), 1);
        }
        assert!(!locks.is_locked(&key()));
    }
}
