//! Engine pipeline.
//!
//! Wires the components in data-flow order:
//! synchronizer -> edge calculator -> risk gate 1 -> sizer -> risk gate 2 ->
//! execution coordinator -> ledger.
//!
//! Ingestion, bucket evaluation and execution are separate tasks. Approved
//! opportunities travel over a bounded queue that is never awaited on the
//! evaluation side, so a slow venue or a long unwind cannot stall quote
//! polling.

use chrono::{DateTime, Utc};
use pm_arb_core::Settings;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connector::{ConnectorMap, Order, VenueConnector};
use crate::edge::{EdgeCalculator, EdgeConfig, FeeSchedule};
use crate::error::ArbError;
use crate::executor::{ExecutionConfig, ExecutionCoordinator, ExecutionOutcome, HedgeState};
use crate::ledger::{PortfolioLedger, PortfolioSummary};
use crate::registry::CanonicalRegistry;
use crate::risk::{Admission, CircuitBreaker, CircuitBreakerConfig, RiskConfig, RiskManager};
use crate::sizing::{PositionSizer, SizingConfig, SizingDecision};
use crate::sync::{QuoteSynchronizer, SyncConfig};
use crate::types::{CanonicalKey, Side, SizedOpportunity, Strategy, Venue, VenueQuote};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How often each venue is asked for quotes, and how often buckets are
    /// evaluated.
    pub quote_poll_interval: Duration,
    /// Capacity of the approved-opportunity queue.
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quote_poll_interval: Duration::from_millis(5000),
            queue_capacity: 64,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            quote_poll_interval: settings.bucket_width(),
            queue_capacity: settings.queue_capacity.max(1),
        }
    }
}

// =============================================================================
// Output Records
// =============================================================================

/// Opportunity/trade record handed to reporting collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub canonical_key: CanonicalKey,
    pub strategy: Strategy,
    pub edge_bps: Decimal,
    pub net_cost: Decimal,
    pub size: Decimal,
    pub notional: Decimal,
    pub venue_a: Venue,
    pub side_a: Side,
    pub price_a: Decimal,
    pub venue_b: Venue,
    pub side_b: Side,
    pub price_b: Decimal,
    pub quote_a_at: DateTime<Utc>,
    pub quote_b_at: DateTime<Utc>,
    pub bucket_close: DateTime<Utc>,
    pub position_id: Option<Uuid>,
    /// Terminal hedge state, or why nothing was placed.
    pub outcome: String,
    pub filled_a: Decimal,
    pub filled_b: Decimal,
    pub residual: Decimal,
    pub recorded_at: DateTime<Utc>,
}

impl OpportunityRecord {
    #[must_use]
    pub fn new(sized: &SizedOpportunity, outcome: &ExecutionOutcome) -> Self {
        let opp = &sized.opportunity;
        let position = outcome.position();
        let filled = |order: Option<&Order>| order.map_or(Decimal::ZERO, |o| o.filled_size);
        Self {
            canonical_key: opp.key.clone(),
            strategy: opp.strategy,
            edge_bps: opp.edge_bps,
            net_cost: opp.net_cost,
            size: sized.size,
            notional: sized.notional,
            venue_a: opp.leg_a.venue,
            side_a: opp.leg_a.side,
            price_a: opp.leg_a.price,
            venue_b: opp.leg_b.venue,
            side_b: opp.leg_b.side,
            price_b: opp.leg_b.price,
            quote_a_at: opp.pair.a.timestamp(),
            quote_b_at: opp.pair.b.timestamp(),
            bucket_close: opp.pair.bucket_close,
            position_id: position.map(|p| p.id),
            outcome: match outcome {
                ExecutionOutcome::Completed(p) => p.state.as_str().to_string(),
                ExecutionOutcome::EventBusy { .. } => "event_busy".to_string(),
                ExecutionOutcome::Paused { .. } => "paused".to_string(),
                ExecutionOutcome::Blocked { .. } => "blocked".to_string(),
            },
            filled_a: filled(position.and_then(|p| p.leg_a.as_ref())),
            filled_b: filled(position.and_then(|p| p.leg_b.as_ref())),
            residual: position.map_or(Decimal::ZERO, |p| p.residual),
            recorded_at: Utc::now(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    quotes_ingested: AtomicU64,
    mapping_absent: AtomicU64,
    invalid_quotes: AtomicU64,
    pairs_evaluated: AtomicU64,
    stale_quotes: AtomicU64,
    insufficient_edge: AtomicU64,
    risk_rejections: AtomicU64,
    sizing_skips: AtomicU64,
    queue_dropped: AtomicU64,
    executions: AtomicU64,
    hedges_completed: AtomicU64,
    unwinds: AtomicU64,
    partial_hedges: AtomicU64,
    unwind_failures: AtomicU64,
    unresolved_orders: AtomicU64,
    blocked: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatsSnapshot {
    pub quotes_ingested: u64,
    pub mapping_absent: u64,
    pub invalid_quotes: u64,
    pub pairs_evaluated: u64,
    pub stale_quotes: u64,
    pub insufficient_edge: u64,
    pub risk_rejections: u64,
    pub sizing_skips: u64,
    pub queue_dropped: u64,
    pub executions: u64,
    pub hedges_completed: u64,
    pub unwinds: u64,
    pub partial_hedges: u64,
    pub unwind_failures: u64,
    pub unresolved_orders: u64,
    pub blocked: u64,
}

impl EngineStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            quotes_ingested: load(&self.quotes_ingested),
            mapping_absent: load(&self.mapping_absent),
            invalid_quotes: load(&self.invalid_quotes),
            pairs_evaluated: load(&self.pairs_evaluated),
            stale_quotes: load(&self.stale_quotes),
            insufficient_edge: load(&self.insufficient_edge),
            risk_rejections: load(&self.risk_rejections),
            sizing_skips: load(&self.sizing_skips),
            queue_dropped: load(&self.queue_dropped),
            executions: load(&self.executions),
            hedges_completed: load(&self.hedges_completed),
            unwinds: load(&self.unwinds),
            partial_hedges: load(&self.partial_hedges),
            unwind_failures: load(&self.unwind_failures),
            unresolved_orders: load(&self.unresolved_orders),
            blocked: load(&self.blocked),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// The arbitrage pipeline, constructed once per process and shared by `Arc`.
#[derive(Debug)]
pub struct ArbitrageEngine {
    config: EngineConfig,
    registry: Arc<CanonicalRegistry>,
    sync: QuoteSynchronizer,
    edge: EdgeCalculator,
    risk: Arc<RiskManager>,
    sizer: PositionSizer,
    coordinator: Arc<ExecutionCoordinator>,
    ledger: Arc<PortfolioLedger>,
    stats: EngineStats,
}

impl ArbitrageEngine {
    /// Builds every component from `settings`. `connectors` receive orders;
    /// they should already have passed through the live gate.
    #[must_use]
    pub fn from_settings(settings: &Settings, registry: Arc<CanonicalRegistry>, connectors: ConnectorMap) -> Self {
        let ledger = Arc::new(PortfolioLedger::new(settings.starting_balance_usd));
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from_settings(settings)));
        let risk = Arc::new(RiskManager::new(
            RiskConfig::from_settings(settings),
            breaker,
            Arc::clone(&ledger),
        ));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            ExecutionConfig::from_settings(settings),
            connectors,
            Arc::clone(&ledger),
            Arc::clone(&risk),
            FeeSchedule::from_settings(settings),
        ));
        Self {
            config: EngineConfig::from_settings(settings),
            registry,
            sync: QuoteSynchronizer::new(SyncConfig::from_settings(settings)),
            edge: EdgeCalculator::new(EdgeConfig::from_settings(settings)),
            risk,
            sizer: PositionSizer::new(SizingConfig::from_settings(settings)),
            coordinator,
            ledger,
            stats: EngineStats::default(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<CanonicalRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn synchronizer(&self) -> &QuoteSynchronizer {
        &self.sync
    }

    #[must_use]
    pub fn risk(&self) -> &Arc<RiskManager> {
        &self.risk
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.coordinator
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<PortfolioLedger> {
        &self.ledger
    }

    #[must_use]
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn portfolio(&self) -> PortfolioSummary {
        self.ledger.summary()
    }

    /// Resolves a raw venue quote and appends it to the synchronizer.
    /// Quotes without a trusted mapping are discarded, never queued.
    pub fn ingest(&self, quote: VenueQuote) -> Result<CanonicalKey, ArbError> {
        if let Err(reason) = quote.validate() {
            EngineStats::bump(&self.stats.invalid_quotes);
            return Err(ArbError::InvalidQuote {
                venue: quote.venue,
                market_id: quote.market_id,
                reason,
            });
        }
        let Some(key) = self.registry.resolve(quote.venue, &quote.market_id) else {
            EngineStats::bump(&self.stats.mapping_absent);
            debug!(venue = %quote.venue, market_id = %quote.market_id, "quote discarded, no trusted mapping");
            return Err(ArbError::MappingAbsent {
                venue: quote.venue,
                market_id: quote.market_id,
            });
        };
        EngineStats::bump(&self.stats.quotes_ingested);
        self.sync.ingest(quote.resolved(key.clone()));
        Ok(key)
    }

    /// One evaluation pass over the bucket ending at `bucket_close`.
    /// Returns the opportunities approved by both risk gates, ordered by key.
    pub fn tick(&self, bucket_close: DateTime<Utc>, now: DateTime<Utc>) -> Vec<SizedOpportunity> {
        let cycle = self.sync.evaluate(bucket_close, now);
        EngineStats::add(&self.stats.stale_quotes, cycle.stale.len());
        EngineStats::add(&self.stats.pairs_evaluated, cycle.pairs.len());
        for (key, venue) in &cycle.stale {
            debug!(canonical_key = %key, venue = %venue, "pair rejected for cycle: {}", ArbError::StaleQuote {
                key: key.clone(),
                venue: *venue,
            });
        }

        let mut approved = Vec::new();
        for pair in &cycle.pairs {
            let opportunity = match self.edge.evaluate(pair) {
                Ok(opportunity) => opportunity,
                Err(err) => {
                    EngineStats::bump(&self.stats.insufficient_edge);
                    debug!(canonical_key = %pair.key, reason = %err, "no opportunity");
                    continue;
                }
            };

            let admission = match self.risk.gate_one(&opportunity) {
                Ok(admission) => admission,
                Err(rejection) => {
                    EngineStats::bump(&self.stats.risk_rejections);
                    info!(
                        canonical_key = %opportunity.key,
                        limit = rejection.limit_name(),
                        reason = %rejection,
                        "opportunity blocked at gate 1"
                    );
                    continue;
                }
            };
            let trial = admission == Admission::Trial;

            let capacity = self.risk.remaining_capacity(&opportunity.key);
            let bankroll = self.ledger.balance();
            let mut sized = match self.sizer.size(opportunity, bankroll, capacity) {
                SizingDecision::Sized(sized) => sized,
                SizingDecision::Skip(reason) => {
                    EngineStats::bump(&self.stats.sizing_skips);
                    debug!(canonical_key = %pair.key, reason = %reason, "sizing skipped opportunity");
                    if trial {
                        self.risk.breaker().cancel_trial();
                    }
                    continue;
                }
            };
            sized.breaker_trial = trial;

            if let Err(rejection) = self.risk.gate_two(&sized) {
                EngineStats::bump(&self.stats.risk_rejections);
                info!(
                    canonical_key = %sized.key(),
                    limit = rejection.limit_name(),
                    reason = %rejection,
                    "opportunity blocked at gate 2"
                );
                if trial {
                    self.risk.breaker().cancel_trial();
                }
                continue;
            }

            info!(
                canonical_key = %sized.key(),
                strategy = %sized.opportunity.strategy,
                edge_bps = %sized.opportunity.edge_bps,
                size = %sized.size,
                notional = %sized.notional,
                "opportunity approved"
            );
            approved.push(sized);
        }

        self.ledger.mark_to_market(&self.sync.latest_all());
        approved
    }

    /// Executes one approved opportunity and counts its outcome.
    pub async fn execute(&self, sized: SizedOpportunity) -> ExecutionOutcome {
        EngineStats::bump(&self.stats.executions);
        let outcome = self.coordinator.execute(sized).await;
        if matches!(outcome, ExecutionOutcome::Blocked { .. }) {
            EngineStats::bump(&self.stats.blocked);
        }
        match outcome.state() {
            Some(HedgeState::BothFilled) => EngineStats::bump(&self.stats.hedges_completed),
            Some(HedgeState::Unwound) => EngineStats::bump(&self.stats.unwinds),
            Some(HedgeState::PartialHedge) => EngineStats::bump(&self.stats.partial_hedges),
            Some(HedgeState::UnwindFailed) => {
                EngineStats::bump(&self.stats.unwind_failures);
                self.risk.pause_signal().pause();
            }
            Some(HedgeState::Unresolved) => EngineStats::bump(&self.stats.unresolved_orders),
            _ => {}
        }
        outcome
    }

    /// Records an event's resolution.
    pub fn settle_event(&self, key: &CanonicalKey, outcome: Side) {
        self.coordinator.settle_event(key, outcome);
    }

    // =========================================================================
    // Live Loop
    // =========================================================================

    /// Runs ingestion, evaluation and execution until `shutdown` flips to
    /// true. In-flight hedges are always allowed to finish.
    pub async fn run(
        self: Arc<Self>,
        feeds: ConnectorMap,
        records: mpsc::Sender<OpportunityRecord>,
        shutdown: watch::Receiver<bool>,
    ) {
        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);
        let mut tasks = JoinSet::new();

        for (venue, connector) in feeds {
            tasks.spawn(Arc::clone(&self).ingest_loop(venue, connector, shutdown.clone()));
        }
        tasks.spawn(Arc::clone(&self).tick_loop(queue_tx, shutdown.clone()));
        tasks.spawn(Arc::clone(&self).execution_worker(queue_rx, records));

        info!(
            poll_interval = ?self.config.quote_poll_interval,
            queue_capacity = self.config.queue_capacity,
            "engine running"
        );
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "engine task ended abnormally");
            }
        }
        info!(stats = ?self.stats(), "engine stopped");
    }

    async fn ingest_loop(self: Arc<Self>, venue: Venue, connector: Arc<dyn VenueConnector>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.quote_poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            match tokio::time::timeout(self.config.quote_poll_interval, connector.fetch_quotes()).await {
                Ok(Ok(quotes)) => {
                    for quote in quotes {
                        // Discards are counted inside ingest.
                        let _ = self.ingest(quote);
                    }
                }
                Ok(Err(err)) => warn!(venue = %venue, error = %err, "quote fetch failed"),
                Err(_) => warn!(venue = %venue, "quote fetch timed out"),
            }
        }
        debug!(venue = %venue, "ingestion stopped");
    }

    async fn tick_loop(self: Arc<Self>, queue: mpsc::Sender<SizedOpportunity>, mut shutdown: watch::Receiver<bool>) {
        let width = self.sync.config().bucket_width;
        let step = chrono::Duration::from_std(width).unwrap_or_else(|_| chrono::Duration::zero());
        let mut interval = tokio::time::interval(width);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            let now = Utc::now();
            // Last fully closed bucket.
            let bucket_close = self.sync.bucket_close_for(now) - step;
            for sized in self.tick(bucket_close, now) {
                let trial = sized.breaker_trial;
                if let Err(err) = queue.try_send(sized) {
                    EngineStats::bump(&self.stats.queue_dropped);
                    warn!(error = %err, "opportunity queue full, dropping opportunity");
                    if trial {
                        self.risk.breaker().cancel_trial();
                    }
                }
            }
        }
        debug!("evaluation stopped");
    }

    async fn execution_worker(self: Arc<Self>, mut queue: mpsc::Receiver<SizedOpportunity>, records: mpsc::Sender<OpportunityRecord>) {
        let mut in_flight = JoinSet::new();
        while let Some(sized) = queue.recv().await {
            let engine = Arc::clone(&self);
            let records = records.clone();
            in_flight.spawn(async move {
                let outcome = engine.execute(sized.clone()).await;
                let record = OpportunityRecord::new(&sized, &outcome);
                if records.send(record).await.is_err() {
                    debug!("record receiver dropped");
                }
            });
        }
        while in_flight.join_next().await.is_some() {}
        debug!("execution worker drained");
    }
}
