//! End-to-end tests for the arbitrage pipeline.
//!
//! These drive recorded quotes through the full chain
//! (registry -> synchronizer -> edge -> gates -> sizer -> coordinator -> ledger)
//! against paper venues and check:
//! - a profitable cross-venue pair is hedged and settles for a locked-in profit
//! - an unwound position leaves no exposure behind
//! - consecutive venue rejections open the circuit breaker for every event

use chrono::{DateTime, Duration, TimeZone, Utc};
use pm_arb_core::Settings;
use pm_arb_engine::{
    load_events, ArbitrageEngine, CanonicalEvent, CanonicalKey, CanonicalRegistry, CircuitBreakerError,
    ConnectorMap, HedgeState, MappingMethod, PaperConnector, PaperScript, ReplayDriver, ReplayEvent, RiskRejection,
    Settlement, Side, Venue, VenueConnector, VenueMapping, VenueQuote,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::io::Write;
use std::sync::Arc;

// =============================================================================
// Helper Functions
// =============================================================================

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
}

fn key(scope: &str) -> CanonicalKey {
    CanonicalKey::build("crypto", scope, "above 100k", "2025-06-30", "yes").unwrap()
}

fn poly_id(scope: &str) -> String {
    format!("0x{scope}")
}

fn kalshi_id(scope: &str) -> String {
    format!("KX{}", scope.to_uppercase())
}

fn registry(scopes: &[&str]) -> Arc<CanonicalRegistry> {
    let registry = CanonicalRegistry::default();
    for scope in scopes {
        registry
            .add_event(CanonicalEvent::new(key(scope), base() + Duration::days(29), format!("{scope} above 100k")))
            .unwrap();
        registry
            .add_mapping(VenueMapping::new(Venue::Polymarket, poly_id(scope), key(scope), 1.0, MappingMethod::ManualOverride))
            .unwrap();
        registry
            .add_mapping(VenueMapping::new(Venue::Kalshi, kalshi_id(scope), key(scope), 0.97, MappingMethod::Deterministic))
            .unwrap();
    }
    Arc::new(registry)
}

fn test_settings() -> Settings {
    Settings {
        leg_timeout_ms: 100,
        poll_interval_ms: 5,
        unwind_backoff_base_ms: 1,
        unwind_backoff_max_ms: 4,
        ..Settings::default()
    }
}

struct Venues {
    poly: Arc<PaperConnector>,
    kalshi: Arc<PaperConnector>,
}

impl Venues {
    fn new() -> Self {
        Self {
            poly: Arc::new(PaperConnector::always_fill(Venue::Polymarket)),
            kalshi: Arc::new(PaperConnector::always_fill(Venue::Kalshi)),
        }
    }

    fn map(&self) -> ConnectorMap {
        let mut map = ConnectorMap::new();
        map.insert(Venue::Polymarket, self.poly.clone() as Arc<dyn VenueConnector>);
        map.insert(Venue::Kalshi, self.kalshi.clone() as Arc<dyn VenueConnector>);
        map
    }

    fn driver(&self, engine: Arc<ArbitrageEngine>) -> ReplayDriver {
        ReplayDriver::new(engine)
            .with_paper_connector(Arc::clone(&self.poly))
            .with_paper_connector(Arc::clone(&self.kalshi))
    }
}

fn quote(venue: Venue, market_id: &str, offset_ms: i64, ask_yes: Decimal, ask_no: Decimal, size: Decimal) -> VenueQuote {
    VenueQuote {
        venue,
        market_id: market_id.to_string(),
        timestamp: base() + Duration::milliseconds(offset_ms),
        bid_yes: ask_yes - dec!(0.01),
        ask_yes,
        bid_no: ask_no - dec!(0.01),
        ask_no,
        bid_size: size,
        ask_size: size,
        expires_at: None,
    }
}

/// Polymarket YES 0.42 / Kalshi NO 0.51: about 624 bps after fees and slippage.
fn profitable_pair(scope: &str, offset_ms: i64, size: Decimal) -> Vec<ReplayEvent> {
    vec![
        ReplayEvent::Quote(quote(Venue::Polymarket, &poly_id(scope), offset_ms, dec!(0.42), dec!(0.60), size)),
        ReplayEvent::Quote(quote(Venue::Kalshi, &kalshi_id(scope), offset_ms + 500, dec!(0.55), dec!(0.51), size)),
    ]
}

// =============================================================================
// End-to-End Tests
// =============================================================================

#[tokio::test]
async fn test_replay_hedges_and_settles_for_profit() {
    let venues = Venues::new();
    let engine = Arc::new(ArbitrageEngine::from_settings(&test_settings(), registry(&["btc"]), venues.map()));

    let mut events = profitable_pair("btc", 1_000, dec!(500));
    // Unmapped market on the same venue is discarded, never paired.
    events.push(ReplayEvent::Quote(quote(Venue::Kalshi, "KXUNKNOWN", 2_000, dec!(0.10), dec!(0.10), dec!(500))));
    events.push(ReplayEvent::Settlement(Settlement {
        canonical_key: key("btc"),
        outcome: Side::Yes,
        timestamp: base() + Duration::minutes(10),
    }));

    // Round-trip through a JSON-lines file, as the binary reads it.
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for event in &events {
        writeln!(file, "{}", serde_json::to_string(event).unwrap()).unwrap();
    }
    let loaded = load_events(file.path()).unwrap();
    assert_eq!(loaded, events);

    let report = venues.driver(Arc::clone(&engine)).run(loaded).await;

    assert_eq!(report.quotes, 3);
    assert_eq!(report.settlements, 1);
    assert_eq!(report.stats.mapping_absent, 1);
    assert_eq!(report.records.len(), 1);

    let record = &report.records[0];
    assert_eq!(record.canonical_key, key("btc"));
    assert_eq!(record.outcome, HedgeState::BothFilled.as_str());
    assert_eq!(record.venue_a, Venue::Polymarket);
    assert_eq!(record.side_a, Side::Yes);
    assert_eq!(record.side_b, Side::No);
    assert_eq!(record.filled_a, record.size);
    assert_eq!(record.filled_b, record.size);
    assert!(record.edge_bps >= dec!(80));

    // YES won: one leg pays $1 per contract, the other expires worthless.
    let summary = report.portfolio;
    assert_eq!(summary.aggregate_exposure, Decimal::ZERO);
    assert_eq!(summary.open_events, 0);
    assert_eq!(summary.trade_count, 2);
    assert!(summary.fees_paid > Decimal::ZERO);
    assert_eq!(summary.realized_pnl, record.size * dec!(0.07) - summary.fees_paid);
    assert_eq!(summary.cash, summary.starting_balance + summary.realized_pnl);
}

#[tokio::test]
async fn test_same_bucket_twice_is_deterministic() {
    let run = || async {
        let venues = Venues::new();
        let engine = Arc::new(ArbitrageEngine::from_settings(&test_settings(), registry(&["btc", "eth"]), venues.map()));
        let mut events = profitable_pair("btc", 1_000, dec!(300));
        events.extend(profitable_pair("eth", 1_200, dec!(300)));
        let report = venues.driver(engine).run(events).await;
        report
            .records
            .into_iter()
            .map(|r| (r.canonical_key, r.size, r.edge_bps, r.outcome))
            .collect::<Vec<_>>()
    };
    let first = run().await;
    let second = run().await;
    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_quotes_in_different_buckets_never_pair() {
    let venues = Venues::new();
    let engine = Arc::new(ArbitrageEngine::from_settings(&test_settings(), registry(&["btc"]), venues.map()));
    let events = vec![
        ReplayEvent::Quote(quote(Venue::Polymarket, &poly_id("btc"), 4_900, dec!(0.42), dec!(0.60), dec!(100))),
        ReplayEvent::Quote(quote(Venue::Kalshi, &kalshi_id("btc"), 5_100, dec!(0.55), dec!(0.51), dec!(100))),
    ];
    let report = venues.driver(engine).run(events).await;
    assert_eq!(report.buckets, 2);
    assert!(report.records.is_empty());
    assert_eq!(report.stats.pairs_evaluated, 0);
}

// =============================================================================
// Unwind Tests
// =============================================================================

#[tokio::test]
async fn test_leg_b_rejection_unwinds_to_zero_exposure() {
    let venues = Venues::new();
    let engine = Arc::new(ArbitrageEngine::from_settings(&test_settings(), registry(&["btc"]), venues.map()));
    venues.poly.script(PaperScript::Fill);
    venues.kalshi.script(PaperScript::Reject("market halted".into()));

    let report = venues.driver(Arc::clone(&engine)).run(profitable_pair("btc", 1_000, dec!(100))).await;

    assert_eq!(report.records.len(), 1);
    let record = &report.records[0];
    assert_eq!(record.size, dec!(100));
    assert_eq!(record.outcome, HedgeState::Unwound.as_str());
    assert_eq!(record.filled_a, dec!(100));
    assert_eq!(record.filled_b, Decimal::ZERO);

    let ledger = engine.ledger();
    assert_eq!(ledger.open_exposure(&key("btc")), Decimal::ZERO);
    assert_eq!(ledger.aggregate_exposure(), Decimal::ZERO);
    assert_eq!(ledger.unhedged_residual(&key("btc")), Decimal::ZERO);
    assert!(!ledger.has_open(&key("btc")));
    // Bought at the 0.42 ask, sold at the 0.41 bid.
    assert!(ledger.realized_pnl() < Decimal::ZERO);
    assert_eq!(report.stats.unwinds, 1);
    assert_eq!(engine.risk().breaker().snapshot().recent_failures, 1);
}

// =============================================================================
// Circuit Breaker Tests
// =============================================================================

#[tokio::test]
async fn test_six_rejections_block_a_seventh_event() {
    let scopes = ["ada", "bnb", "btc", "doge", "eth", "sol", "xrp"];
    let venues = Venues::new();
    let engine = ArbitrageEngine::from_settings(&test_settings(), registry(&scopes), venues.map());

    for (i, scope) in scopes.iter().enumerate() {
        let offset = 1_000 + i as i64 * 100;
        engine
            .ingest(quote(Venue::Polymarket, &poly_id(scope), offset, dec!(0.42), dec!(0.60), dec!(50)))
            .unwrap();
        engine
            .ingest(quote(Venue::Kalshi, &kalshi_id(scope), offset + 50, dec!(0.55), dec!(0.51), dec!(50)))
            .unwrap();
    }
    let close = base() + Duration::seconds(5);
    let approved = engine.tick(close, close);
    assert_eq!(approved.len(), 7);

    venues
        .poly
        .script_all(std::iter::repeat(PaperScript::Reject("insufficient balance".into())).take(6));
    for sized in approved.iter().take(6) {
        let outcome = engine.execute(sized.clone()).await;
        assert_eq!(outcome.state(), Some(HedgeState::LegARejected));
    }

    let seventh = &approved[6];
    assert_eq!(seventh.key(), &key("xrp"));
    match engine.risk().gate_one(&seventh.opportunity) {
        Err(RiskRejection::Breaker(CircuitBreakerError::Open { .. })) => {}
        other => panic!("expected open breaker, got {other:?}"),
    }
    assert!(engine.tick(close, close).is_empty());
    assert_eq!(venues.poly.orders_placed(), 6);
}
