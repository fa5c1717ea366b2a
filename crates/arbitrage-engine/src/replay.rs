//! Historical replay.
//!
//! Feeds a recorded JSON-lines stream through the pipeline bucket by bucket,
//! executing against paper connectors. Each line is either a [`VenueQuote`]
//! or a settlement:
//!
//! ```text
//! {"venue":"polymarket","market_id":"0xabc","timestamp":"2025-06-01T00:00:01Z", ...}
//! {"canonical_key":"CRYPTO:BTC:ABOVE_100K:2025-06-30:YES","outcome":"YES","timestamp":"2025-06-30T23:59:00Z"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::connector::VenueConnector;
use crate::engine::{ArbitrageEngine, EngineStatsSnapshot, OpportunityRecord};
use crate::ledger::PortfolioSummary;
use crate::paper::PaperConnector;
use crate::types::{CanonicalKey, Side, Venue, VenueQuote};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read replay file: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Resolution of a canonical event at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub canonical_key: CanonicalKey,
    pub outcome: Side,
    pub timestamp: DateTime<Utc>,
}

/// One line of a replay file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplayEvent {
    Quote(VenueQuote),
    Settlement(Settlement),
}

impl ReplayEvent {
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Quote(q) => q.timestamp,
            Self::Settlement(s) => s.timestamp,
        }
    }
}

/// Parses a JSON-lines replay stream. Blank lines are skipped.
///
/// # Errors
///
/// Returns the 1-based line number of the first line that fails to parse.
pub fn parse_events(reader: impl BufRead) -> Result<Vec<ReplayEvent>, ReplayError> {
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event = serde_json::from_str(trimmed).map_err(|source| ReplayError::Parse { line: idx + 1, source })?;
        events.push(event);
    }
    Ok(events)
}

/// Reads a JSON-lines replay file.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or a line is malformed.
pub fn load_events(path: impl AsRef<Path>) -> Result<Vec<ReplayEvent>, ReplayError> {
    let file = std::fs::File::open(path)?;
    parse_events(std::io::BufReader::new(file))
}

/// What a replay produced.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub buckets: usize,
    pub quotes: usize,
    pub settlements: usize,
    pub records: Vec<OpportunityRecord>,
    pub stats: EngineStatsSnapshot,
    pub portfolio: PortfolioSummary,
}

/// Drives an [`ArbitrageEngine`] from recorded events.
pub struct ReplayDriver {
    engine: Arc<ArbitrageEngine>,
    paper: HashMap<Venue, Arc<PaperConnector>>,
}

impl ReplayDriver {
    #[must_use]
    pub fn new(engine: Arc<ArbitrageEngine>) -> Self {
        Self {
            engine,
            paper: HashMap::new(),
        }
    }

    /// Registers a paper connector whose reference book should follow the
    /// replayed quotes, so market-order unwinds price off recorded prices.
    #[must_use]
    pub fn with_paper_connector(mut self, connector: Arc<PaperConnector>) -> Self {
        self.paper.insert(connector.venue(), connector);
        self
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<ArbitrageEngine> {
        &self.engine
    }

    /// Replays `events` in timestamp order. After the last event of each
    /// bucket the bucket is evaluated as of its close, and every approved
    /// opportunity is executed before the next bucket is ingested.
    pub async fn run(&self, mut events: Vec<ReplayEvent>) -> ReplayReport {
        events.sort_by_key(ReplayEvent::timestamp);
        let sync = self.engine.synchronizer();

        let mut report_records = Vec::new();
        let mut buckets = 0;
        let mut quotes = 0;
        let mut settlements = 0;
        let mut current: Option<DateTime<Utc>> = None;

        for event in events {
            let close = sync.bucket_close_for(event.timestamp());
            if let Some(open_close) = current {
                if close != open_close {
                    report_records.extend(self.close_bucket(open_close).await);
                    buckets += 1;
                }
            }
            current = Some(close);

            match event {
                ReplayEvent::Quote(quote) => {
                    quotes += 1;
                    if let Some(paper) = self.paper.get(&quote.venue) {
                        paper.set_reference_quote(quote.clone());
                    }
                    if let Err(err) = self.engine.ingest(quote) {
                        debug!(error = %err, "replayed quote discarded");
                    }
                }
                ReplayEvent::Settlement(settlement) => {
                    settlements += 1;
                    info!(
                        canonical_key = %settlement.canonical_key,
                        outcome = %settlement.outcome,
                        "replaying settlement"
                    );
                    self.engine.settle_event(&settlement.canonical_key, settlement.outcome);
                }
            }
        }
        if let Some(close) = current {
            report_records.extend(self.close_bucket(close).await);
            buckets += 1;
        }

        let report = ReplayReport {
            buckets,
            quotes,
            settlements,
            records: report_records,
            stats: self.engine.stats(),
            portfolio: self.engine.portfolio(),
        };
        info!(
            buckets = report.buckets,
            quotes = report.quotes,
            records = report.records.len(),
            realized_pnl = %report.portfolio.realized_pnl,
            "replay complete"
        );
        report
    }

    async fn close_bucket(&self, close: DateTime<Utc>) -> Vec<OpportunityRecord> {
        let mut records = Vec::new();
        for sized in self.engine.tick(close, close) {
            let outcome = self.engine.execute(sized.clone()).await;
            records.push(OpportunityRecord::new(&sized, &outcome));
        }
        records
    }
}
