//! Registry CLI commands.
//!
//! - `stats`: mapping coverage as JSON
//! - `search`: events whose title or alias matches
//! - `map`: run the alias mapper over venue market metadata and, with
//!   `--write`, persist the promoted mappings

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use pm_arb_engine::{
    promote_decision, AliasMapper, CanonicalRegistry, CsvStore, MapperDecision, VenueMapper, VenueMarket,
};
use std::io::BufRead;
use std::sync::Arc;

use super::config::{load_settings, SettingsArgs};

/// Arguments for the registry command.
#[derive(Args, Debug, Clone)]
pub struct RegistryArgs {
    #[command(flatten)]
    pub settings: SettingsArgs,

    /// Directory holding events.csv and mappings.csv
    #[arg(short, long, default_value = "data/registry")]
    pub registry: String,

    #[command(subcommand)]
    pub action: RegistryAction,
}

#[derive(Subcommand, Debug, Clone)]
pub enum RegistryAction {
    /// Print mapping coverage
    Stats,
    /// Find events by title or alias
    Search {
        /// Free-text alias, matched after case and whitespace normalization
        alias: String,
    },
    /// Propose mappings for venue markets (JSON lines of VenueMarket)
    Map {
        /// Venue market metadata file
        #[arg(long)]
        markets: String,
        /// Save promoted mappings back to the registry
        #[arg(long)]
        write: bool,
    },
}

/// Runs the registry command.
///
/// # Errors
/// Returns an error if settings or the registry cannot be loaded, or a
/// market file line is malformed.
pub fn run_registry(args: RegistryArgs) -> Result<()> {
    let settings = load_settings(&args.settings)?;
    let store = CsvStore::in_dir(&args.registry);
    let registry = Arc::new(
        CanonicalRegistry::load(&store, settings.mapping_confidence_threshold)
            .with_context(|| format!("failed to load registry from {}", args.registry))?,
    );

    match args.action {
        RegistryAction::Stats => {
            println!("{}", serde_json::to_string_pretty(&registry.coverage_stats())?);
        }
        RegistryAction::Search { alias } => {
            for event in registry.search_by_alias(&alias) {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        RegistryAction::Map { markets, write } => {
            let markets = read_markets(&markets)?;
            let mapper = AliasMapper::new(Arc::clone(&registry));
            let mut promoted = 0usize;
            for market in &markets {
                let decision = mapper.map(market);
                match promote_decision(&decision, market, registry.confidence_threshold()) {
                    Some(mapping) => match registry.add_mapping(mapping) {
                        Ok(()) => {
                            promoted += 1;
                            tracing::info!(venue = %market.venue, market_id = %market.market_id, "mapping promoted");
                        }
                        Err(err) => {
                            tracing::warn!(venue = %market.venue, market_id = %market.market_id, error = %err, "mapping refused");
                        }
                    },
                    None => {
                        if let MapperDecision::Abstain { reason } = &decision {
                            tracing::debug!(venue = %market.venue, market_id = %market.market_id, reason = %reason, "mapper abstained");
                        }
                    }
                }
                println!("{}", serde_json::to_string(&(market.venue, &market.market_id, &decision))?);
            }
            tracing::info!(mapper = mapper.name(), markets = markets.len(), promoted, "mapping pass complete");
            if write {
                registry.save(&store).context("failed to save registry")?;
            }
        }
    }
    Ok(())
}

fn read_markets(path: &str) -> Result<Vec<VenueMarket>> {
    let file = std::fs::File::open(path).with_context(|| format!("failed to open {path}"))?;
    let mut markets = Vec::new();
    for (idx, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let market = serde_json::from_str(&line).with_context(|| format!("{path}:{}: invalid market", idx + 1))?;
        markets.push(market);
    }
    Ok(markets)
}
