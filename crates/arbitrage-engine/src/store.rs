//! Registry persistence adapters.
//!
//! The registry only needs a snapshot in and a snapshot out. [`CsvStore`]
//! keeps the operator-editable two-file layout (`events.csv`,
//! `mappings.csv`); [`InMemoryStore`] backs tests.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::registry::RegistryError;
use crate::types::{CanonicalEvent, CanonicalKey, MappingMethod, SettlementUnit, Venue, VenueMapping};

/// Full registry content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    pub events: Vec<CanonicalEvent>,
    pub mappings: Vec<VenueMapping>,
}

/// Swappable persistence for the canonical registry.
pub trait RegistryStore: Send + Sync {
    /// Reads the stored snapshot. A store with nothing persisted yields an
    /// empty snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or unparseable content.
    fn load(&self) -> Result<RegistrySnapshot, RegistryError>;

    /// Replaces the stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), RegistryError>;
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemoryStore {
    snapshot: Mutex<RegistrySnapshot>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }
}

impl RegistryStore for InMemoryStore {
    fn load(&self) -> Result<RegistrySnapshot, RegistryError> {
        Ok(self.snapshot.lock().clone())
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), RegistryError> {
        *self.snapshot.lock() = snapshot.clone();
        Ok(())
    }
}

// =============================================================================
// CSV
// =============================================================================

const EVENT_COLUMNS: [&str; 8] = [
    "event_id",
    "event_type",
    "scope",
    "date_close",
    "canonical_units",
    "display_title",
    "resolution_source",
    "aliases",
];

const MAPPING_COLUMNS: [&str; 6] = [
    "venue",
    "market_id",
    "event_id",
    "title_raw",
    "confidence",
    "mapping_method",
];

/// Two-file CSV store. Multi-valued cells (aliases) are `|`-separated.
#[derive(Debug, Clone)]
pub struct CsvStore {
    events_path: PathBuf,
    mappings_path: PathBuf,
}

impl CsvStore {
    /// Store using `events.csv` and `mappings.csv` inside `dir`.
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(dir.join("events.csv"), dir.join("mappings.csv"))
    }

    /// Store using explicit file paths.
    #[must_use]
    pub fn new(events_path: impl Into<PathBuf>, mappings_path: impl Into<PathBuf>) -> Self {
        Self {
            events_path: events_path.into(),
            mappings_path: mappings_path.into(),
        }
    }

    fn file_label(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    }

    fn read_rows(path: &Path) -> Result<Vec<HashMap<String, String>>, RegistryError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(
                headers
                    .iter()
                    .cloned()
                    .zip(record.iter().map(str::to_string))
                    .collect(),
            );
        }
        Ok(rows)
    }

    fn parse_event(row: &HashMap<String, String>) -> Result<CanonicalEvent, String> {
        let field = |name: &str| row.get(name).map(|s| s.trim()).unwrap_or_default();
        let key = CanonicalKey::parse(field("event_id")).map_err(|e| e.to_string())?;
        let close_time = DateTime::parse_from_rfc3339(field("date_close"))
            .map_err(|e| format!("date_close: {e}"))?
            .with_timezone(&Utc);
        let resolution_source = Some(field("resolution_source"))
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let aliases = field("aliases")
            .split('|')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        Ok(CanonicalEvent {
            key,
            close_time,
            settlement_unit: SettlementUnit::BinaryYesNo,
            display_title: field("display_title").to_string(),
            resolution_source,
            aliases,
        })
    }

    fn parse_mapping(row: &HashMap<String, String>) -> Result<VenueMapping, String> {
        let field = |name: &str| row.get(name).map(|s| s.trim()).unwrap_or_default();
        let venue: Venue = field("venue").parse().map_err(|e: crate::types::KeyError| e.to_string())?;
        let key = CanonicalKey::parse(field("event_id")).map_err(|e| e.to_string())?;
        let confidence = match field("confidence") {
            "" => 1.0,
            raw => raw.parse::<f64>().map_err(|e| format!("confidence: {e}"))?,
        };
        let method = match field("mapping_method") {
            "" => MappingMethod::ManualOverride,
            raw => raw.parse()?,
        };
        let market_id = field("market_id");
        if market_id.is_empty() {
            return Err("empty market_id".to_string());
        }
        Ok(VenueMapping::new(venue, market_id, key, confidence, method).with_title(field("title_raw")))
    }

    fn ensure_parent(path: &Path) -> Result<(), RegistryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl RegistryStore for CsvStore {
    fn load(&self) -> Result<RegistrySnapshot, RegistryError> {
        let mut snapshot = RegistrySnapshot::default();

        let label = Self::file_label(&self.events_path);
        for (i, row) in Self::read_rows(&self.events_path)?.iter().enumerate() {
            let event = Self::parse_event(row).map_err(|reason| RegistryError::Parse {
                file: label.clone(),
                row: i + 1,
                reason,
            })?;
            snapshot.events.push(event);
        }

        let label = Self::file_label(&self.mappings_path);
        for (i, row) in Self::read_rows(&self.mappings_path)?.iter().enumerate() {
            let mapping = Self::parse_mapping(row).map_err(|reason| RegistryError::Parse {
                file: label.clone(),
                row: i + 1,
                reason,
            })?;
            snapshot.mappings.push(mapping);
        }

        Ok(snapshot)
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), RegistryError> {
        Self::ensure_parent(&self.events_path)?;
        let mut writer = csv::Writer::from_writer(File::create(&self.events_path)?);
        writer.write_record(EVENT_COLUMNS)?;
        for event in &snapshot.events {
            let parts = event.key.parts();
            writer.write_record([
                event.key.as_str(),
                parts.category,
                parts.scope,
                event.close_time.to_rfc3339().as_str(),
                "YES/NO",
                event.display_title.as_str(),
                event.resolution_source.as_deref().unwrap_or_default(),
                event.aliases.iter().cloned().collect::<Vec<_>>().join("|").as_str(),
            ])?;
        }
        writer.flush()?;

        Self::ensure_parent(&self.mappings_path)?;
        let mut writer = csv::Writer::from_writer(File::create(&self.mappings_path)?);
        writer.write_record(MAPPING_COLUMNS)?;
        for mapping in &snapshot.mappings {
            writer.write_record([
                mapping.venue.as_str(),
                mapping.market_id.as_str(),
                mapping.key.as_str(),
                mapping.title_raw.as_str(),
                mapping.confidence.to_string().as_str(),
                mapping.method.as_str(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}
