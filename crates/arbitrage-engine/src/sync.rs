//! Quote synchronizer.
//!
//! Quotes arrive independently per venue and are appended to a time-ordered
//! sequence per `(venue, canonical key)`. The timeline is cut into fixed-width
//! buckets aligned to the Unix epoch; evaluating a bucket takes, per key and
//! venue, the most recent quote inside `[close - width, close)` and forms a
//! [`QuotePair`] only when exactly two venues contribute a fresh quote.
//!
//! Evaluation reads but never mutates the stored sequences, so evaluating the
//! same bucket twice yields the same pairs.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use pm_arb_core::Settings;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::trace;

use crate::types::{CanonicalKey, Quote, QuotePair, Venue};

// =============================================================================
// Configuration
// =============================================================================

/// Synchronizer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Width of one synchronization bucket.
    pub bucket_width: Duration,
    /// Extra age beyond one bucket width a quote may have at evaluation time.
    pub staleness_tolerance: Duration,
    /// Buckets of history kept per sequence.
    pub retention_buckets: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bucket_width: Duration::from_millis(5_000),
            staleness_tolerance: Duration::ZERO,
            retention_buckets: 4,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bucket_width: Duration::from_millis(settings.bucket_width_ms),
            staleness_tolerance: Duration::from_millis(settings.staleness_tolerance_ms),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_bucket_width(mut self, width: Duration) -> Self {
        self.bucket_width = width;
        self
    }

    #[must_use]
    pub fn with_staleness_tolerance(mut self, tolerance: Duration) -> Self {
        self.staleness_tolerance = tolerance;
        self
    }

    fn width(&self) -> chrono::Duration {
        to_chrono(self.bucket_width)
    }

    /// Oldest acceptable quote age at evaluation time.
    fn max_age(&self) -> chrono::Duration {
        to_chrono(self.bucket_width + self.staleness_tolerance)
    }

    fn retention(&self) -> chrono::Duration {
        to_chrono(self.bucket_width * self.retention_buckets.max(1))
    }
}

/// Capped at one year so the conversion cannot overflow.
fn to_chrono(d: Duration) -> chrono::Duration {
    const YEAR_MS: u128 = 365 * 24 * 3_600 * 1_000;
    chrono::Duration::milliseconds(d.as_millis().min(YEAR_MS) as i64)
}

// =============================================================================
// Cycle Output
// =============================================================================

/// Result of evaluating one bucket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncCycle {
    pub bucket_close: Option<DateTime<Utc>>,
    /// Pairs formed, ordered by key.
    pub pairs: Vec<QuotePair>,
    /// `(key, venue)` whose latest in-bucket quote was stale or expired.
    pub stale: Vec<(CanonicalKey, Venue)>,
    /// Keys with fresh quotes from other than exactly two venues.
    pub unpaired: usize,
}

// =============================================================================
// Synchronizer
// =============================================================================

#[derive(Debug, Default)]
struct VenueSeries {
    by_key: HashMap<CanonicalKey, VecDeque<Quote>>,
}

/// Per-venue quote sequences and bucket evaluation.
///
/// Each venue has its own lock, so ingestion for one venue never waits on
/// another.
#[derive(Debug)]
pub struct QuoteSynchronizer {
    config: SyncConfig,
    series: HashMap<Venue, Mutex<VenueSeries>>,
}

impl QuoteSynchronizer {
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            series: Venue::ALL
                .iter()
                .map(|v| (*v, Mutex::new(VenueSeries::default())))
                .collect(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Appends a resolved quote to its venue sequence, keeping timestamp
    /// order and trimming history beyond the retention window.
    pub fn ingest(&self, quote: Quote) {
        let Some(series) = self.series.get(&quote.venue()) else {
            return;
        };
        let retention = self.config.retention();
        let mut series = series.lock();
        let seq = series.by_key.entry(quote.key.clone()).or_default();
        let ts = quote.timestamp();
        let at = seq.partition_point(|q| q.timestamp() <= ts);
        seq.insert(at, quote);

        if let Some(newest) = seq.back().map(Quote::timestamp) {
            while seq.front().is_some_and(|q| newest - q.timestamp() > retention) {
                seq.pop_front();
            }
        }
    }

    /// Close of the bucket containing `ts`.
    #[must_use]
    pub fn bucket_close_for(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.config.width().num_milliseconds().max(1);
        let close = (ts.timestamp_millis().div_euclid(width) + 1) * width;
        Utc.timestamp_millis_opt(close).single().unwrap_or(ts)
    }

    /// Latest stored quote for a venue and key, regardless of bucket.
    #[must_use]
    pub fn latest(&self, venue: Venue, key: &CanonicalKey) -> Option<Quote> {
        self.series
            .get(&venue)?
            .lock()
            .by_key
            .get(key)
            .and_then(|seq| seq.back().cloned())
    }

    /// Latest stored quote of every sequence.
    #[must_use]
    pub fn latest_all(&self) -> Vec<Quote> {
        let mut out = Vec::new();
        for venue in Venue::ALL {
            if let Some(series) = self.series.get(&venue) {
                out.extend(series.lock().by_key.values().filter_map(|s| s.back().cloned()));
            }
        }
        out
    }

    /// Total quotes currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.series
            .values()
            .map(|s| s.lock().by_key.values().map(VecDeque::len).sum::<usize>())
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluates the bucket ending at `bucket_close` against wall-clock `now`.
    ///
    /// Quotes older than one bucket width plus tolerance at `now`, or past
    /// their venue expiry, are stale and never paired.
    #[must_use]
    pub fn evaluate(&self, bucket_close: DateTime<Utc>, now: DateTime<Utc>) -> SyncCycle {
        let open = bucket_close - self.config.width();
        let max_age = self.config.max_age();

        let mut fresh: BTreeMap<CanonicalKey, Vec<Quote>> = BTreeMap::new();
        let mut stale = Vec::new();

        for venue in Venue::ALL {
            let Some(series) = self.series.get(&venue) else {
                continue;
            };
            let series = series.lock();
            for (key, seq) in &series.by_key {
                let Some(latest) = seq.iter().rev().find(|q| q.timestamp() < bucket_close) else {
                    continue;
                };
                if latest.timestamp() < open {
                    continue;
                }
                if now - latest.timestamp() > max_age || latest.is_expired(now) {
                    trace!(canonical_key = %key, venue = %venue, "stale quote excluded");
                    stale.push((key.clone(), venue));
                    continue;
                }
                fresh.entry(key.clone()).or_default().push(latest.clone());
            }
        }
        stale.sort();

        let mut cycle = SyncCycle {
            bucket_close: Some(bucket_close),
            stale,
            ..SyncCycle::default()
        };
        for (key, mut quotes) in fresh {
            quotes.sort_by_key(Quote::venue);
            quotes.dedup_by_key(|q| q.venue());
            if quotes.len() != 2 {
                cycle.unpaired += 1;
                continue;
            }
            let b = quotes.pop();
            let a = quotes.pop();
            if let (Some(a), Some(b)) = (a, b) {
                cycle.pairs.push(QuotePair {
                    key,
                    a,
                    b,
                    bucket_close,
                });
            }
        }
        cycle
    }
}
