use crate::config::{Settings, SETTINGS_KEYS};
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::path::Path;

/// Default settings file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/pm-arb.toml";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads settings by layering defaults, `config/pm-arb.toml` and the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be parsed or the merged settings
    /// fail validation.
    pub fn load() -> Result<Settings> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads settings with an explicit TOML file. A missing file is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be parsed or the merged settings
    /// fail validation.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Settings> {
        let path = path.as_ref();
        let settings: Settings = Self::figment(path)
            .extract()
            .with_context(|| format!("failed to load settings (file: {})", path.display()))?;

        settings.validate()?;
        tracing::debug!(
            mode = %settings.mode,
            min_edge_bps = %settings.min_edge_bps,
            file = %path.display(),
            "settings loaded"
        );
        Ok(settings)
    }

    /// Environment keys are matched case-insensitively against the flat
    /// field names, so `MIN_EDGE_BPS` sets `min_edge_bps`.
    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::raw().only(SETTINGS_KEYS))
    }
}
