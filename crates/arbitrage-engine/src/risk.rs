//! Risk manager and circuit breaker.
//!
//! Gate 1 runs before sizing: minimum edge, pause signal, halted events,
//! an already-open position on the event, and the circuit breaker. Gate 2
//! runs after sizing: aggregate, per-trade and per-event exposure caps and
//! the realized drawdown stop.
//!
//! The circuit breaker is an explicit state machine
//! (`Closed -> Open -> HalfOpen -> Closed | Open`) that can be inspected
//! through [`CircuitBreaker::snapshot`].

use parking_lot::RwLock;
use pm_arb_core::Settings;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::error::ArbError;
use crate::ledger::PortfolioLedger;
use crate::types::{ArbitrageOpportunity, CanonicalKey, SizedOpportunity};

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` that open the breaker.
    pub failure_threshold: u32,
    /// Rolling window failures are counted in.
    pub window: Duration,
    /// Time spent open before a trial is allowed.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 6,
            window: Duration::from_secs(300),
            cooldown: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            failure_threshold: settings.circuit_breaker_failures,
            window: Duration::from_secs(settings.circuit_breaker_window_secs),
            cooldown: Duration::from_secs(settings.circuit_breaker_cooldown_secs),
        }
    }

    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// New trades blocked.
    Open,
    /// Cooldown elapsed; one trial opportunity allowed.
    HalfOpen,
}

impl BreakerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How an opportunity was let through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single half-open trial. Its outcome decides the next state.
    Trial,
}

/// Circuit breaker errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Open after repeated failures.
    #[error("circuit breaker open, {remaining_secs}s until trial")]
    Open {
        /// Seconds until the half-open trial.
        remaining_secs: u64,
    },

    /// Half-open and the trial is already running.
    #[error("circuit breaker half-open, trial in flight")]
    TrialInFlight,

    /// Opened by an unwind failure; needs an operator reset.
    #[error("circuit breaker latched open, operator reset required")]
    Latched,
}

/// Inspectable breaker state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub recent_failures: usize,
    pub latched: bool,
    pub trips: u32,
    pub successes: u32,
    pub failures: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    latched: bool,
}

/// Failure-isolation gate shared by the risk manager and the coordinator.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<BreakerInner>,
    trips: AtomicU32,
    successes: AtomicU32,
    failures: AtomicU32,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
                latched: false,
            }),
            trips: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            failures: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, after applying any elapsed cooldown.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.state_at(Instant::now())
    }

    #[must_use]
    pub fn state_at(&self, now: Instant) -> BreakerState {
        let mut inner = self.inner.write();
        self.advance(&mut inner, now);
        inner.state
    }

    /// Asks to start a new trade.
    pub fn admit(&self) -> Result<Admission, CircuitBreakerError> {
        self.admit_at(Instant::now())
    }

    pub fn admit_at(&self, now: Instant) -> Result<Admission, CircuitBreakerError> {
        let mut inner = self.inner.write();
        self.advance(&mut inner, now);
        let state = inner.state;
        match state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open if inner.latched => Err(CircuitBreakerError::Latched),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
                Err(CircuitBreakerError::Open {
                    remaining_secs: self.config.cooldown.saturating_sub(elapsed).as_secs(),
                })
            }
            BreakerState::HalfOpen if inner.trial_in_flight => Err(CircuitBreakerError::TrialInFlight),
            BreakerState::HalfOpen => {
                inner.trial_in_flight = true;
                info!("circuit breaker admitting half-open trial");
                Ok(Admission::Trial)
            }
        }
    }

    /// Releases a trial that never reached execution.
    pub fn cancel_trial(&self) {
        self.inner.write().trial_in_flight = false;
    }

    /// Records a completed hedge.
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.write();
        inner.failures.clear();
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.trial_in_flight = false;
            inner.opened_at = None;
            info!("circuit breaker closed after successful trial");
        }
    }

    /// Records an execution failure (rejection, abandoned or unwound hedge).
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.write();
        inner.failures.push_back(now);
        self.prune(&mut inner, now);
        let state = inner.state;
        let recent = inner.failures.len();
        match state {
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                self.trip(&mut inner, now, "half-open trial failed");
            }
            BreakerState::Closed if recent >= self.config.failure_threshold as usize => {
                self.trip(&mut inner, now, "failure threshold reached");
            }
            _ => {}
        }
    }

    /// Opens the breaker until [`reset`](Self::reset) is called.
    pub fn force_open(&self, reason: &str) {
        let now = Instant::now();
        let mut inner = self.inner.write();
        inner.latched = true;
        inner.trial_in_flight = false;
        self.trip(&mut inner, now, reason);
        error!(reason = %reason, "circuit breaker latched open");
    }

    /// Operator reset back to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.trial_in_flight = false;
        inner.latched = false;
        info!("circuit breaker reset");
    }

    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.write();
        self.advance(&mut inner, now);
        self.prune(&mut inner, now);
        BreakerSnapshot {
            state: inner.state,
            recent_failures: inner.failures.len(),
            latched: inner.latched,
            trips: self.trips.load(Ordering::SeqCst),
            successes: self.successes.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }

    fn trip(&self, inner: &mut BreakerInner, now: Instant, reason: &str) {
        if inner.state != BreakerState::Open {
            self.trips.fetch_add(1, Ordering::SeqCst);
        }
        warn!(
            from = %inner.state,
            recent_failures = inner.failures.len(),
            reason = %reason,
            "circuit breaker opened"
        );
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
    }

    fn advance(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state != BreakerState::Open || inner.latched {
            return;
        }
        let cooled = inner
            .opened_at
            .is_some_and(|t| now.saturating_duration_since(t) >= self.config.cooldown);
        if cooled {
            inner.state = BreakerState::HalfOpen;
            inner.trial_in_flight = false;
            info!("circuit breaker half-open");
        }
    }

    fn prune(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some(front) = inner.failures.front() {
            if now.saturating_duration_since(*front) > self.config.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

// =============================================================================
// Pause Signal
// =============================================================================

/// Global pause. Blocks new first legs; in-flight hedges run to completion.
#[derive(Debug, Clone, Default)]
pub struct PauseSignal {
    paused: Arc<AtomicBool>,
}

impl PauseSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            warn!("trading paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("trading resumed");
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Risk Manager
// =============================================================================

/// Exposure limits and stops, in settlement currency.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskConfig {
    pub min_edge_bps: Decimal,
    pub max_open_risk_usd: Decimal,
    pub max_per_trade_usd: Decimal,
    pub max_position_per_event_usd: Decimal,
    /// Realized drawdown, as a fraction of starting balance, beyond which
    /// trading stops. Reaching it exactly still trades.
    pub drawdown_stop: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_edge_bps: dec!(80),
            max_open_risk_usd: dec!(3000),
            max_per_trade_usd: dec!(1000),
            max_position_per_event_usd: dec!(5000),
            drawdown_stop: dec!(0.10),
        }
    }
}

impl RiskConfig {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            min_edge_bps: settings.min_edge_bps,
            max_open_risk_usd: settings.max_open_risk_usd,
            max_per_trade_usd: settings.max_per_trade_usd,
            max_position_per_event_usd: settings.max_position_per_event_usd,
            drawdown_stop: settings.drawdown_stop_fraction(),
        }
    }

    #[must_use]
    pub fn with_min_edge_bps(mut self, bps: Decimal) -> Self {
        self.min_edge_bps = bps;
        self
    }

    #[must_use]
    pub fn with_max_open_risk_usd(mut self, usd: Decimal) -> Self {
        self.max_open_risk_usd = usd;
        self
    }

    #[must_use]
    pub fn with_max_per_trade_usd(mut self, usd: Decimal) -> Self {
        self.max_per_trade_usd = usd;
        self
    }

    #[must_use]
    pub fn with_max_position_per_event_usd(mut self, usd: Decimal) -> Self {
        self.max_position_per_event_usd = usd;
        self
    }

    #[must_use]
    pub fn with_drawdown_stop(mut self, fraction: Decimal) -> Self {
        self.drawdown_stop = fraction;
        self
    }
}

/// Why the risk manager blocked an opportunity.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RiskRejection {
    #[error("edge {edge_bps} bps below minimum {min_edge_bps} bps")]
    InsufficientEdge { edge_bps: Decimal, min_edge_bps: Decimal },

    #[error("event {0} already has an open position")]
    EventOpen(CanonicalKey),

    #[error("event {0} halted pending operator review")]
    EventHalted(CanonicalKey),

    #[error(transparent)]
    Breaker(#[from] CircuitBreakerError),

    #[error("trading paused")]
    Paused,

    #[error("aggregate exposure {current} + {proposed} exceeds {limit}")]
    AggregateExposure {
        current: Decimal,
        proposed: Decimal,
        limit: Decimal,
    },

    #[error("trade notional {proposed} exceeds per-trade limit {limit}")]
    PerTrade { proposed: Decimal, limit: Decimal },

    #[error("event exposure {current} + {proposed} exceeds per-event limit {limit}")]
    PerEvent {
        current: Decimal,
        proposed: Decimal,
        limit: Decimal,
    },

    #[error("drawdown {drawdown} beyond stop {stop}")]
    Drawdown { drawdown: Decimal, stop: Decimal },
}

impl RiskRejection {
    /// Short name of the limit that blocked, for logs and counters.
    #[must_use]
    pub fn limit_name(&self) -> &'static str {
        match self {
            Self::InsufficientEdge { .. } => "min_edge",
            Self::EventOpen(_) => "event_open",
            Self::EventHalted(_) => "event_halted",
            Self::Breaker(_) => "circuit_breaker",
            Self::Paused => "paused",
            Self::AggregateExposure { .. } => "max_open_risk",
            Self::PerTrade { .. } => "max_per_trade",
            Self::PerEvent { .. } => "max_position_per_event",
            Self::Drawdown { .. } => "max_drawdown",
        }
    }
}

impl From<RiskRejection> for ArbError {
    fn from(rejection: RiskRejection) -> Self {
        match rejection {
            RiskRejection::InsufficientEdge { edge_bps, min_edge_bps } => {
                ArbError::InsufficientEdge { edge_bps, min_edge_bps }
            }
            other => ArbError::RiskLimitBreach {
                limit: other.to_string(),
            },
        }
    }
}

/// Stateful pre- and post-sizing gate.
#[derive(Debug)]
pub struct RiskManager {
    config: RiskConfig,
    breaker: Arc<CircuitBreaker>,
    ledger: Arc<PortfolioLedger>,
    halted: RwLock<HashSet<CanonicalKey>>,
    pause: PauseSignal,
}

impl RiskManager {
    #[must_use]
    pub fn new(config: RiskConfig, breaker: Arc<CircuitBreaker>, ledger: Arc<PortfolioLedger>) -> Self {
        Self {
            config,
            breaker,
            ledger,
            halted: RwLock::new(HashSet::new()),
            pause: PauseSignal::new(),
        }
    }

    /// Shares an existing pause signal.
    #[must_use]
    pub fn with_pause_signal(mut self, pause: PauseSignal) -> Self {
        self.pause = pause;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<PortfolioLedger> {
        &self.ledger
    }

    #[must_use]
    pub fn pause_signal(&self) -> &PauseSignal {
        &self.pause
    }

    /// Pre-sizing gate. On `Admission::Trial` the caller owns the breaker
    /// trial and must either execute or [`CircuitBreaker::cancel_trial`].
    pub fn gate_one(&self, opportunity: &ArbitrageOpportunity) -> Result<Admission, RiskRejection> {
        if opportunity.edge_bps < self.config.min_edge_bps {
            return Err(RiskRejection::InsufficientEdge {
                edge_bps: opportunity.edge_bps,
                min_edge_bps: self.config.min_edge_bps,
            });
        }
        if self.pause.is_paused() {
            return Err(RiskRejection::Paused);
        }
        if self.is_halted(&opportunity.key) {
            return Err(RiskRejection::EventHalted(opportunity.key.clone()));
        }
        if self.ledger.has_open(&opportunity.key) {
            return Err(RiskRejection::EventOpen(opportunity.key.clone()));
        }
        Ok(self.breaker.admit()?)
    }

    /// Capital still allowed for a new trade on `key`.
    #[must_use]
    pub fn remaining_capacity(&self, key: &CanonicalKey) -> Decimal {
        let aggregate = self.config.max_open_risk_usd - self.ledger.aggregate_exposure();
        let per_event = self.config.max_position_per_event_usd - self.ledger.open_exposure(key);
        aggregate
            .min(per_event)
            .min(self.config.max_per_trade_usd)
            .max(Decimal::ZERO)
    }

    /// Post-sizing gate.
    pub fn gate_two(&self, sized: &SizedOpportunity) -> Result<(), RiskRejection> {
        let proposed = sized.notional;

        let aggregate = self.ledger.aggregate_exposure();
        if aggregate + proposed > self.config.max_open_risk_usd {
            return Err(RiskRejection::AggregateExposure {
                current: aggregate,
                proposed,
                limit: self.config.max_open_risk_usd,
            });
        }
        if proposed > self.config.max_per_trade_usd {
            return Err(RiskRejection::PerTrade {
                proposed,
                limit: self.config.max_per_trade_usd,
            });
        }
        let event = self.ledger.open_exposure(sized.key());
        if event + proposed > self.config.max_position_per_event_usd {
            return Err(RiskRejection::PerEvent {
                current: event,
                proposed,
                limit: self.config.max_position_per_event_usd,
            });
        }
        let drawdown = self.ledger.drawdown();
        if drawdown > self.config.drawdown_stop {
            return Err(RiskRejection::Drawdown {
                drawdown,
                stop: self.config.drawdown_stop,
            });
        }
        Ok(())
    }

    /// Stops trading on an event until [`clear_halt`](Self::clear_halt).
    pub fn halt_event(&self, key: &CanonicalKey, reason: &str) {
        if self.halted.write().insert(key.clone()) {
            error!(canonical_key = %key, reason = %reason, "event halted");
        }
    }

    #[must_use]
    pub fn is_halted(&self, key: &CanonicalKey) -> bool {
        self.halted.read().contains(key)
    }

    pub fn clear_halt(&self, key: &CanonicalKey) -> bool {
        let cleared = self.halted.write().remove(key);
        if cleared {
            info!(canonical_key = %key, "event halt cleared");
        }
        cleared
    }

    #[must_use]
    pub fn halted_events(&self) -> Vec<CanonicalKey> {
        let mut keys: Vec<_> = self.halted.read().iter().cloned().collect();
        keys.sort();
        keys
    }
}
