//! Replay CLI command.
//!
//! Loads the canonical registry, builds the engine over paper venues and
//! replays a JSON-lines quote file bucket by bucket. Each executed
//! opportunity is written as one JSON line.
//!
//! ```bash
//! pm-arb run --registry data/registry --quotes data/quotes.jsonl
//! pm-arb run --quotes data/quotes.jsonl --mode backtest --output records.jsonl
//! ```

use anyhow::{bail, Context, Result};
use clap::Args;
use pm_arb_core::TradingMode;
use pm_arb_engine::{
    load_events, ArbitrageEngine, CanonicalRegistry, ConnectorMap, CsvStore, LiveGate, PaperConnector,
    PaperConnectorConfig, ReplayDriver, ReplayReport, Venue, VenueConnector,
};
use rust_decimal::Decimal;
use std::io::Write;
use std::sync::Arc;

use super::config::{load_settings, SettingsArgs};

/// Arguments for the run command.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub settings: SettingsArgs,

    /// Directory holding events.csv and mappings.csv
    #[arg(short, long, default_value = "data/registry")]
    pub registry: String,

    /// JSON-lines file of venue quotes and settlements
    #[arg(short, long)]
    pub quotes: String,

    /// Write records here instead of stdout
    #[arg(short, long)]
    pub output: Option<String>,

    /// Seed for simulated fills; omit for always-fill venues
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Runs the run command.
///
/// # Errors
/// Returns an error if settings, registry or quotes cannot be loaded, if live
/// trading is requested, or if the output cannot be written.
pub async fn run_replay(args: RunArgs) -> Result<()> {
    let settings = load_settings(&args.settings)?;
    let gate = LiveGate::from_settings(&settings);
    if gate.is_live() {
        bail!("live trading is confirmed but this binary has no live venue connectors; use paper or backtest mode");
    }
    if settings.mode == TradingMode::Live {
        tracing::warn!("CONFIRM_LIVE not set, running live mode against paper connectors");
    }

    let registry = CanonicalRegistry::load(&CsvStore::in_dir(&args.registry), settings.mapping_confidence_threshold)
        .with_context(|| format!("failed to load registry from {}", args.registry))?;
    let events = load_events(&args.quotes).with_context(|| format!("failed to read quotes from {}", args.quotes))?;

    let paper_config = match args.seed {
        Some(seed) => PaperConnectorConfig::default().with_seed(seed),
        None => PaperConnectorConfig::always_fill(),
    };
    let paper: Vec<Arc<PaperConnector>> = Venue::ALL
        .iter()
        .map(|venue| Arc::new(PaperConnector::new(*venue, paper_config.clone())))
        .collect();
    let paper_map: ConnectorMap = paper
        .iter()
        .map(|c| (c.venue(), Arc::clone(c) as Arc<dyn VenueConnector>))
        .collect();
    let connectors = gate.route(ConnectorMap::new(), paper_map);

    tracing::info!(
        mode = %settings.mode,
        events = events.len(),
        min_edge_bps = %settings.min_edge_bps,
        bucket_width_ms = settings.bucket_width_ms,
        "starting replay"
    );
    let engine = Arc::new(ArbitrageEngine::from_settings(&settings, Arc::new(registry), connectors));
    let driver = paper
        .into_iter()
        .fold(ReplayDriver::new(engine), ReplayDriver::with_paper_connector);
    let report = driver.run(events).await;

    write_records(&report, args.output.as_deref())?;
    print_summary(&report);
    Ok(())
}

fn write_records(report: &ReplayReport, output: Option<&str>) -> Result<()> {
    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(std::io::BufWriter::new(
            std::fs::File::create(path).with_context(|| format!("failed to create {path}"))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    };
    for record in &report.records {
        writeln!(out, "{}", serde_json::to_string(record)?)?;
    }
    out.flush()?;
    Ok(())
}

fn print_summary(report: &ReplayReport) {
    let p = &report.portfolio;
    let s = &report.stats;
    eprintln!();
    eprintln!("=== Replay Summary ===");
    eprintln!("Buckets:            {}", report.buckets);
    eprintln!("Quotes:             {} ({} unmapped, {} invalid)", report.quotes, s.mapping_absent, s.invalid_quotes);
    eprintln!("Pairs evaluated:    {} ({} stale quotes)", s.pairs_evaluated, s.stale_quotes);
    eprintln!("Below min edge:     {}", s.insufficient_edge);
    eprintln!("Risk rejections:    {}", s.risk_rejections);
    eprintln!(
        "Executions:         {} ({} hedged, {} unwound, {} partial, {} unwind failed, {} unresolved, {} blocked)",
        s.executions,
        s.hedges_completed,
        s.unwinds,
        s.partial_hedges,
        s.unwind_failures,
        s.unresolved_orders,
        s.blocked
    );
    eprintln!("Settlements:        {}", report.settlements);
    eprintln!("Balance:            ${}", p.cash.round_dp(2));
    eprintln!("Realized PnL:       ${}", p.realized_pnl.round_dp(2));
    eprintln!("Unrealized PnL:     ${}", p.unrealized_pnl.round_dp(2));
    eprintln!("Fees paid:          ${}", p.fees_paid.round_dp(2));
    eprintln!("Open exposure:      ${} across {} events", p.aggregate_exposure.round_dp(2), p.open_events);
    eprintln!("Drawdown:           {}%", (p.drawdown * Decimal::ONE_HUNDRED).round_dp(2));
}
