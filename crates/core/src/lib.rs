//! Shared configuration and sizing math for the cross-venue arbitrage engine.
//!
//! - [`config`]: the flat operator-facing [`Settings`] surface and [`TradingMode`]
//! - [`config_loader`]: layered loading (defaults, TOML file, environment)
//! - [`kelly`]: fractional Kelly sizing for hedged binary positions

pub mod config;
pub mod config_loader;
pub mod kelly;

pub use config::{ConfigError, Settings, TradingMode, UnwindPricing};
pub use config_loader::ConfigLoader;
pub use kelly::{hedge_fraction, HedgeKelly, HedgeStake, StakeReason};
