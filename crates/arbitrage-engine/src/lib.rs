//! Cross-venue arbitrage between Polymarket and Kalshi binary markets.
//!
//! When the same canonical event trades on both venues, buying YES on one and
//! NO on the other locks in $1 at settlement. If the combined cost after fees
//! and slippage is below $1, the difference is edge:
//!
//! ```text
//! Polymarket: YES ask $0.42
//! Kalshi:     NO  ask $0.51
//!   Gross cost:        $0.93
//!   + fees (0.55%):    $0.0051
//!   + slippage 25bps:  $0.0025
//!   Net cost:          $0.9376
//!   Edge:              624 bps
//! ```
//!
//! # Modules
//!
//! - [`types`]: canonical keys, events, mappings, quotes, opportunities
//! - [`registry`] / [`store`]: the canonical event registry and its persistence
//! - [`mapper`]: the contract venue mappers implement to propose mappings
//! - [`sync`]: time-bucketed quote synchronization across venues
//! - [`edge`]: fee- and slippage-adjusted edge calculation
//! - [`risk`]: pre-trade gates, per-event halts and the circuit breaker
//! - [`sizing`]: fractional Kelly position sizing
//! - [`executor`]: the two-leg hedge state machine with unwinds
//! - [`ledger`]: fills, exposure, realized and unrealized PnL
//! - [`connector`] / [`paper`]: the venue seam and a simulated venue
//! - [`engine`] / [`replay`]: the live pipeline and historical replay
//!
//! # Safety
//!
//! Quotes are only ever paired through a trusted registry mapping. A mapping
//! below the confidence threshold resolves to nothing, so a title that merely
//! looks similar can never turn a hedge into a directional bet.

pub mod connector;
pub mod edge;
pub mod engine;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod mapper;
pub mod paper;
pub mod registry;
pub mod replay;
pub mod risk;
pub mod sizing;
pub mod store;
pub mod sync;
pub mod types;

pub use connector::{
    ConnectorError, ConnectorMap, LiveGate, Order, OrderAction, OrderRequest, OrderStatus, VenueConnector,
};
pub use edge::{EdgeCalculator, EdgeConfig, FeeSchedule};
pub use engine::{ArbitrageEngine, EngineConfig, EngineStatsSnapshot, OpportunityRecord};
pub use error::ArbError;
pub use executor::{
    EventLocks, ExecutionConfig, ExecutionCoordinator, ExecutionOutcome, HedgePosition, HedgeState, Transition,
};
pub use ledger::{LedgerUpdate, LegFill, PortfolioLedger, PortfolioSummary, Trade, TradeStatus};
pub use mapper::{promote_decision, AliasMapper, MapperDecision, VenueMapper, VenueMarket};
pub use paper::{PaperConnector, PaperConnectorConfig, PaperScript};
pub use registry::{CanonicalRegistry, CoverageStats, RegistryError};
pub use replay::{load_events, parse_events, ReplayDriver, ReplayError, ReplayEvent, ReplayReport, Settlement};
pub use risk::{
    Admission, BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, PauseSignal, RiskConfig,
    RiskManager, RiskRejection,
};
pub use sizing::{PositionSizer, SizingConfig, SizingDecision, SkipReason};
pub use store::{CsvStore, InMemoryStore, RegistrySnapshot, RegistryStore};
pub use sync::{QuoteSynchronizer, SyncConfig, SyncCycle};
pub use types::{
    ArbitrageOpportunity, CanonicalEvent, CanonicalKey, HedgeLeg, MappingMethod, Quote, QuotePair, Side,
    SizedOpportunity, Strategy, Venue, VenueMapping, VenueQuote,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_api_exports() {
        let _ = EdgeCalculator::new(EdgeConfig::default());
        let _ = PositionSizer::default();
        let _ = CanonicalRegistry::default();
        let _ = SyncConfig::default();
        let _ = RiskConfig::default();
        let _ = ExecutionConfig::default();
        let _ = CircuitBreakerConfig::default();
    }

    #[test]
    fn test_types_accessible() {
        let _ = Side::Yes;
        let _ = Venue::Kalshi;
        let _ = Strategy::NoAYesB;
        let _ = HedgeState::BothFilled;
        let _ = BreakerState::Closed;
    }
}
