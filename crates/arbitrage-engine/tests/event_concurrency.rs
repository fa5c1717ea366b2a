//! Concurrency tests for per-event execution.
//!
//! At most one hedge may be in flight per canonical event, no matter how many
//! tasks race to execute it, while hedges on different events proceed in
//! parallel.

use chrono::{DateTime, Duration, TimeZone, Utc};
use pm_arb_core::Settings;
use pm_arb_engine::{
    ArbitrageEngine, CanonicalEvent, CanonicalKey, CanonicalRegistry, ConnectorMap, ExecutionOutcome, HedgeState,
    MappingMethod, PaperConnector, PaperScript, SizedOpportunity, Venue, VenueConnector, VenueMapping, VenueQuote,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Barrier;

// =============================================================================
// Helper Functions
// =============================================================================

const SCOPES: [&str; 5] = ["ada", "btc", "eth", "sol", "xrp"];

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
}

fn key(scope: &str) -> CanonicalKey {
    CanonicalKey::build("crypto", scope, "above 100k", "2025-06-30", "yes").unwrap()
}

fn quote(venue: Venue, scope: &str, ask_yes: Decimal, ask_no: Decimal) -> VenueQuote {
    VenueQuote {
        venue,
        market_id: format!("{venue}-{scope}"),
        timestamp: base() + Duration::seconds(1),
        bid_yes: ask_yes - dec!(0.01),
        ask_yes,
        bid_no: ask_no - dec!(0.01),
        ask_no,
        bid_size: dec!(200),
        ask_size: dec!(200),
        expires_at: None,
    }
}

/// Engine whose leg-A venue rests every order until the leg timeout.
fn resting_engine() -> (Arc<ArbitrageEngine>, Arc<PaperConnector>, Vec<SizedOpportunity>) {
    let registry = CanonicalRegistry::default();
    for scope in SCOPES {
        registry
            .add_event(CanonicalEvent::new(key(scope), base() + Duration::days(29), scope))
            .unwrap();
        for venue in Venue::ALL {
            registry
                .add_mapping(VenueMapping::new(venue, format!("{venue}-{scope}"), key(scope), 1.0, MappingMethod::ManualOverride))
                .unwrap();
        }
    }

    let poly = Arc::new(PaperConnector::always_fill(Venue::Polymarket));
    let kalshi = Arc::new(PaperConnector::always_fill(Venue::Kalshi));
    poly.script_all(std::iter::repeat(PaperScript::Rest).take(64));
    let mut connectors = ConnectorMap::new();
    connectors.insert(Venue::Polymarket, poly.clone() as Arc<dyn VenueConnector>);
    connectors.insert(Venue::Kalshi, kalshi as Arc<dyn VenueConnector>);

    let settings = Settings {
        leg_timeout_ms: 300,
        poll_interval_ms: 10,
        ..Settings::default()
    };
    let engine = Arc::new(ArbitrageEngine::from_settings(&settings, Arc::new(registry), connectors));
    for scope in SCOPES {
        engine.ingest(quote(Venue::Polymarket, scope, dec!(0.42), dec!(0.60))).unwrap();
        engine.ingest(quote(Venue::Kalshi, scope, dec!(0.55), dec!(0.51))).unwrap();
    }
    let close = base() + Duration::seconds(5);
    let approved = engine.tick(close, close);
    assert_eq!(approved.len(), SCOPES.len());
    (engine, poly, approved)
}

async fn race(engine: &Arc<ArbitrageEngine>, work: Vec<SizedOpportunity>) -> Vec<ExecutionOutcome> {
    let barrier = Arc::new(Barrier::new(work.len()));
    let mut handles = Vec::new();
    for sized in work {
        let engine = Arc::clone(engine);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            engine.execute(sized).await
        }));
    }
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }
    outcomes
}

// =============================================================================
// Single Position Per Event Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_hedge_in_flight_per_event() {
    let (engine, poly, approved) = resting_engine();
    let target = approved[1].clone();
    assert_eq!(target.key(), &key("btc"));

    let outcomes = race(&engine, vec![target; 8]).await;

    let proceeded: Vec<_> = outcomes.iter().filter_map(ExecutionOutcome::position).collect();
    let busy = outcomes
        .iter()
        .filter(|o| matches!(o, ExecutionOutcome::EventBusy { .. }))
        .count();
    assert_eq!(proceeded.len(), 1);
    assert_eq!(busy, 7);
    assert_eq!(proceeded[0].state, HedgeState::LegACancelled);
    assert_eq!(poly.orders_placed(), 1);
    assert_eq!(engine.coordinator().locks().in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_property_every_event_admits_exactly_one() {
    let (engine, poly, approved) = resting_engine();

    // Four racers per event, interleaved across events.
    let mut work = Vec::new();
    for _ in 0..4 {
        work.extend(approved.iter().cloned());
    }
    let outcomes = race(&engine, work).await;

    let mut proceeded: BTreeMap<CanonicalKey, usize> = BTreeMap::new();
    let mut busy: BTreeMap<CanonicalKey, usize> = BTreeMap::new();
    for outcome in &outcomes {
        match outcome {
            ExecutionOutcome::Completed(position) => *proceeded.entry(position.key.clone()).or_default() += 1,
            ExecutionOutcome::EventBusy { key } => *busy.entry(key.clone()).or_default() += 1,
            ExecutionOutcome::Paused { key } => panic!("unexpected pause for {key}"),
            ExecutionOutcome::Blocked { key, reason } => panic!("unexpected block for {key}: {reason}"),
        }
    }
    for scope in SCOPES {
        assert_eq!(proceeded.get(&key(scope)), Some(&1), "{scope} proceeded");
        assert_eq!(busy.get(&key(scope)), Some(&3), "{scope} busy");
    }
    assert_eq!(poly.orders_placed(), SCOPES.len() as u32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_events_do_not_contend() {
    let (engine, _poly, approved) = resting_engine();
    let first = approved[0].clone();
    let second = approved[4].clone();

    let watcher = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            engine.coordinator().locks().in_flight()
        })
    };
    let outcomes = race(&engine, vec![first, second]).await;

    assert!(outcomes.iter().all(|o| o.position().is_some()));
    // Both hedges were resting at the same time.
    assert_eq!(watcher.await.unwrap(), 2);
    assert_eq!(engine.coordinator().locks().in_flight(), 0);
}
