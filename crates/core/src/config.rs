//! Operator-facing configuration surface.
//!
//! [`Settings`] is deliberately flat: every field maps one-to-one onto an
//! environment variable of the same name in upper case (`MIN_EDGE_BPS`,
//! `MAX_OPEN_RISK_USD`, `CONFIRM_LIVE`, ...). Engine components derive their
//! own typed configs from it.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Trading execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// Simulated fills against paper connectors.
    #[default]
    Paper,
    /// Real order placement (still requires `confirm_live`).
    Live,
    /// Historical quote replay through paper connectors.
    Backtest,
}

impl TradingMode {
    /// Returns the display string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Live => "live",
            Self::Backtest => "backtest",
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a stranded leg is closed out when its hedge fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwindPricing {
    /// Market order, takes whatever the book offers.
    #[default]
    Market,
    /// Limit order priced `unwind_limit_offset` through the original fill.
    AggressiveLimit,
}

/// Validation failures for [`Settings`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// A value fell outside its allowed range.
    #[error("{field} out of range: {value} (expected {expected})")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Offending value, rendered.
        value: String,
        /// Human readable bound.
        expected: &'static str,
    },
}

/// Every recognised configuration key, lower case.
pub const SETTINGS_KEYS: &[&str] = &[
    "mode",
    "starting_balance_usd",
    "kelly_fraction",
    "min_edge_bps",
    "max_open_risk_usd",
    "max_per_trade_usd",
    "max_position_per_event_usd",
    "min_order_size",
    "max_drawdown_pct",
    "slippage_buffer_bps",
    "polymarket_fee_rate",
    "kalshi_fee_rate",
    "bucket_width_ms",
    "staleness_tolerance_ms",
    "mapping_confidence_threshold",
    "circuit_breaker_failures",
    "circuit_breaker_window_secs",
    "circuit_breaker_cooldown_secs",
    "leg_timeout_ms",
    "poll_interval_ms",
    "leg_retry_attempts",
    "unwind_max_attempts",
    "unwind_backoff_base_ms",
    "unwind_backoff_max_ms",
    "unwind_pricing",
    "unwind_limit_offset",
    "confirm_live",
    "queue_capacity",
];

/// Application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Execution mode.
    pub mode: TradingMode,
    /// Bankroll the drawdown stop and sizing are measured against.
    pub starting_balance_usd: Decimal,
    /// Fractional Kelly multiplier, 0..=1.
    pub kelly_fraction: Decimal,
    /// Minimum net edge to act on, in basis points.
    pub min_edge_bps: Decimal,
    /// Aggregate open exposure cap.
    pub max_open_risk_usd: Decimal,
    /// Per-hedge notional cap.
    pub max_per_trade_usd: Decimal,
    /// Per canonical event exposure cap.
    pub max_position_per_event_usd: Decimal,
    /// Orders smaller than this (contracts) are skipped, not placed.
    pub min_order_size: Decimal,
    /// Drawdown stop as a percentage of starting balance.
    pub max_drawdown_pct: Decimal,
    /// Slippage buffer added to net cost, in basis points.
    pub slippage_buffer_bps: Decimal,
    /// Polymarket taker fee rate (decimal).
    pub polymarket_fee_rate: Decimal,
    /// Kalshi taker fee rate (decimal).
    pub kalshi_fee_rate: Decimal,
    /// Synchronization bucket width.
    pub bucket_width_ms: u64,
    /// Extra age allowed beyond one bucket before a quote is stale.
    pub staleness_tolerance_ms: u64,
    /// Mappings below this confidence are treated as absent.
    pub mapping_confidence_threshold: f64,
    /// Failures inside the window that open the breaker.
    pub circuit_breaker_failures: u32,
    /// Rolling failure window.
    pub circuit_breaker_window_secs: u64,
    /// Time an open breaker waits before allowing a trial.
    pub circuit_breaker_cooldown_secs: u64,
    /// Time a hedge leg may rest before it is cancelled.
    pub leg_timeout_ms: u64,
    /// Order status poll interval.
    pub poll_interval_ms: u64,
    /// Retries for transient placement errors on a single leg.
    pub leg_retry_attempts: u32,
    /// Unwind attempts before the position is marked unwind-failed.
    pub unwind_max_attempts: u32,
    /// First unwind retry delay; doubles per attempt.
    pub unwind_backoff_base_ms: u64,
    /// Unwind retry delay ceiling.
    pub unwind_backoff_max_ms: u64,
    /// Unwind order pricing policy.
    pub unwind_pricing: UnwindPricing,
    /// Price concession for aggressive-limit unwinds.
    pub unwind_limit_offset: Decimal,
    /// Must be explicitly true to route orders to live venues.
    pub confirm_live: bool,
    /// Opportunity queue depth between evaluation and execution.
    pub queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: TradingMode::Paper,
            starting_balance_usd: dec!(10000),
            kelly_fraction: dec!(0.25),
            min_edge_bps: dec!(80),
            max_open_risk_usd: dec!(3000),
            max_per_trade_usd: dec!(1000),
            max_position_per_event_usd: dec!(5000),
            min_order_size: dec!(1),
            max_drawdown_pct: dec!(10),
            slippage_buffer_bps: dec!(25),
            polymarket_fee_rate: dec!(0.0025),
            kalshi_fee_rate: dec!(0.0030),
            bucket_width_ms: 5_000,
            staleness_tolerance_ms: 0,
            mapping_confidence_threshold: 0.85,
            circuit_breaker_failures: 6,
            circuit_breaker_window_secs: 300,
            circuit_breaker_cooldown_secs: 300,
            leg_timeout_ms: 5_000,
            poll_interval_ms: 250,
            leg_retry_attempts: 2,
            unwind_max_attempts: 5,
            unwind_backoff_base_ms: 500,
            unwind_backoff_max_ms: 8_000,
            unwind_pricing: UnwindPricing::Market,
            unwind_limit_offset: dec!(0.02),
            confirm_live: false,
            queue_capacity: 64,
        }
    }
}

impl Settings {
    /// Live orders only when the mode is live and the operator confirmed it.
    #[must_use]
    pub fn is_live_trading_enabled(&self) -> bool {
        self.mode == TradingMode::Live && self.confirm_live
    }

    /// Drawdown stop as a fraction of starting balance.
    #[must_use]
    pub fn drawdown_stop_fraction(&self) -> Decimal {
        self.max_drawdown_pct / dec!(100)
    }

    /// Bucket width as a [`Duration`].
    #[must_use]
    pub fn bucket_width(&self) -> Duration {
        Duration::from_millis(self.bucket_width_ms)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns the first field found outside its range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn out_of_range(field: &'static str, value: impl ToString, expected: &'static str) -> ConfigError {
            ConfigError::OutOfRange {
                field,
                value: value.to_string(),
                expected,
            }
        }

        if self.kelly_fraction < Decimal::ZERO || self.kelly_fraction > Decimal::ONE {
            return Err(out_of_range("kelly_fraction", self.kelly_fraction, "0..=1"));
        }
        if self.starting_balance_usd <= Decimal::ZERO {
            return Err(out_of_range("starting_balance_usd", self.starting_balance_usd, "> 0"));
        }
        for (field, value) in [
            ("min_edge_bps", self.min_edge_bps),
            ("max_open_risk_usd", self.max_open_risk_usd),
            ("max_per_trade_usd", self.max_per_trade_usd),
            ("max_position_per_event_usd", self.max_position_per_event_usd),
            ("min_order_size", self.min_order_size),
            ("slippage_buffer_bps", self.slippage_buffer_bps),
            ("polymarket_fee_rate", self.polymarket_fee_rate),
            ("kalshi_fee_rate", self.kalshi_fee_rate),
            ("unwind_limit_offset", self.unwind_limit_offset),
        ] {
            if value < Decimal::ZERO {
                return Err(out_of_range(field, value, ">= 0"));
            }
        }
        if self.max_drawdown_pct < Decimal::ZERO || self.max_drawdown_pct > dec!(100) {
            return Err(out_of_range("max_drawdown_pct", self.max_drawdown_pct, "0..=100"));
        }
        if !(0.0..=1.0).contains(&self.mapping_confidence_threshold) {
            return Err(out_of_range(
                "mapping_confidence_threshold",
                self.mapping_confidence_threshold,
                "0..=1",
            ));
        }
        if self.bucket_width_ms == 0 {
            return Err(out_of_range("bucket_width_ms", self.bucket_width_ms, "> 0"));
        }
        if self.circuit_breaker_failures == 0 {
            return Err(out_of_range("circuit_breaker_failures", self.circuit_breaker_failures, ">= 1"));
        }
        if self.unwind_max_attempts == 0 {
            return Err(out_of_range("unwind_max_attempts", self.unwind_max_attempts, ">= 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(out_of_range("poll_interval_ms", self.poll_interval_ms, "> 0"));
        }
        if self.queue_capacity == 0 {
            return Err(out_of_range("queue_capacity", self.queue_capacity, "> 0"));
        }
        Ok(())
    }
}
