//! Settings resolution shared by every command, and the `config` command.

use anyhow::Result;
use clap::{Args, ValueEnum};
use pm_arb_core::config_loader::DEFAULT_CONFIG_PATH;
use pm_arb_core::{ConfigLoader, Settings, TradingMode};

/// Mode override from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Simulated fills against paper connectors
    Paper,
    /// Real orders; also needs CONFIRM_LIVE=true
    Live,
    /// Historical replay through paper connectors
    Backtest,
}

impl From<ModeArg> for TradingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Paper => TradingMode::Paper,
            ModeArg::Live => TradingMode::Live,
            ModeArg::Backtest => TradingMode::Backtest,
        }
    }
}

/// Where settings come from.
#[derive(Args, Debug, Clone)]
pub struct SettingsArgs {
    /// TOML settings file; skipped when missing
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Overrides MODE from the file and environment
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,
}

/// Arguments for the config command.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub settings: SettingsArgs,
}

/// Loads defaults, the settings file and the environment, then applies the
/// command-line mode override.
///
/// # Errors
/// Returns an error if a layer fails to parse or the result is out of range.
pub fn load_settings(args: &SettingsArgs) -> Result<Settings> {
    let mut settings = ConfigLoader::load_from(&args.config)?;
    if let Some(mode) = args.mode {
        settings.mode = mode.into();
        settings.validate()?;
    }
    Ok(settings)
}

/// Runs the config command.
///
/// # Errors
/// Returns an error if settings cannot be resolved.
pub fn run_config(args: &ConfigArgs) -> Result<()> {
    let settings = load_settings(&args.settings)?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    if settings.mode == TradingMode::Live && !settings.is_live_trading_enabled() {
        tracing::warn!("mode is live but CONFIRM_LIVE is not set, orders will be routed to paper connectors");
    }
    Ok(())
}
