//! Canonical event registry.
//!
//! Authoritative mapping from [`CanonicalKey`] to [`CanonicalEvent`] and from
//! `(venue, native market id)` to a key. Lookups are keyed and exact; there is
//! no fuzzy fallback here. Ambiguity is settled upstream by a mapper or a
//! manual override before a mapping is registered.
//!
//! Integrity rules:
//! - a key, once registered, never changes meaning (conflicting re-registration
//!   is rejected)
//! - a mapping may only point at a registered event, and an existing
//!   `(venue, market)` mapping is never silently re-pointed at another key
//! - mappings below the confidence threshold are stored but never resolved

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, info};

use crate::store::{RegistrySnapshot, RegistryStore};
use crate::types::{CanonicalEvent, CanonicalKey, MappingMethod, Venue, VenueMapping};

/// Default minimum mapping confidence.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.85;

/// Registry maintenance and persistence errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Key already registered with different content.
    #[error("event {key} already registered with different content")]
    ConflictingEvent {
        /// Key in conflict.
        key: CanonicalKey,
    },

    /// Mapping points at a key that is not registered.
    #[error("mapping {venue}/{market_id} refers to unknown event {key}")]
    UnknownEvent {
        /// Venue of the mapping.
        venue: Venue,
        /// Native market id.
        market_id: String,
        /// Missing key.
        key: CanonicalKey,
    },

    /// `(venue, market)` already mapped to a different key.
    #[error("{venue}/{market_id} already mapped to {existing}, refusing remap to {proposed}")]
    ConflictingMapping {
        /// Venue of the mapping.
        venue: Venue,
        /// Native market id.
        market_id: String,
        /// Key currently mapped.
        existing: CanonicalKey,
        /// Key proposed.
        proposed: CanonicalKey,
    },

    /// Confidence outside `[0, 1]` or not a number.
    #[error("mapping confidence {0} outside [0, 1]")]
    InvalidConfidence(f64),

    /// A persisted row could not be parsed.
    #[error("{file} row {row}: {reason}")]
    Parse {
        /// Source file name.
        file: String,
        /// 1-based data row.
        row: usize,
        /// What was wrong.
        reason: String,
    },

    /// Filesystem failure.
    #[error("registry I/O: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding failure.
    #[error("registry CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Mapping coverage summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageStats {
    pub total_events: usize,
    pub total_mappings: usize,
    /// Events mapped on at least two venues.
    pub cross_venue_events: usize,
    /// Mappings below the confidence threshold.
    pub untrusted_mappings: usize,
    pub by_venue: BTreeMap<Venue, usize>,
    pub by_method: BTreeMap<MappingMethod, usize>,
}

#[derive(Debug, Default)]
struct RegistryIndex {
    events: HashMap<CanonicalKey, CanonicalEvent>,
    mappings: HashMap<(Venue, String), VenueMapping>,
    /// Uppercased alias -> keys carrying it.
    aliases: HashMap<String, BTreeSet<CanonicalKey>>,
}

impl RegistryIndex {
    fn index_aliases(&mut self, event: &CanonicalEvent) {
        for alias in event
            .aliases
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(event.display_title.as_str()))
        {
            let norm = normalize_alias(alias);
            if !norm.is_empty() {
                self.aliases.entry(norm).or_default().insert(event.key.clone());
            }
        }
    }
}

/// Normalizes free text for alias comparison: trimmed, uppercased,
/// single-spaced.
#[must_use]
pub fn normalize_alias(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_uppercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// In-memory canonical registry shared by reference across the pipeline.
#[derive(Debug)]
pub struct CanonicalRegistry {
    confidence_threshold: f64,
    index: RwLock<RegistryIndex>,
}

impl Default for CanonicalRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

impl CanonicalRegistry {
    /// Creates an empty registry with the given mapping confidence threshold.
    #[must_use]
    pub fn new(confidence_threshold: f64) -> Self {
        Self {
            confidence_threshold,
            index: RwLock::new(RegistryIndex::default()),
        }
    }

    /// Builds a registry from a persistence store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or its content violates
    /// registry integrity.
    pub fn load(store: &dyn RegistryStore, confidence_threshold: f64) -> Result<Self, RegistryError> {
        let snapshot = store.load()?;
        let registry = Self::new(confidence_threshold);
        for event in snapshot.events {
            registry.add_event(event)?;
        }
        for mapping in snapshot.mappings {
            registry.add_mapping(mapping)?;
        }
        let stats = registry.coverage_stats();
        info!(
            events = stats.total_events,
            mappings = stats.total_mappings,
            cross_venue = stats.cross_venue_events,
            "registry loaded"
        );
        Ok(registry)
    }

    /// Writes the current content to a persistence store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to write.
    pub fn save(&self, store: &dyn RegistryStore) -> Result<(), RegistryError> {
        store.save(&self.snapshot())
    }

    /// Copies all events and mappings out, in a stable order.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let index = self.index.read();
        let mut events: Vec<CanonicalEvent> = index.events.values().cloned().collect();
        events.sort_by(|a, b| a.key.cmp(&b.key));
        let mut mappings: Vec<VenueMapping> = index.mappings.values().cloned().collect();
        mappings.sort_by(|a, b| (a.venue, &a.market_id).cmp(&(b.venue, &b.market_id)));
        RegistrySnapshot { events, mappings }
    }

    #[must_use]
    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Registers an event. Re-registering identical content is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ConflictingEvent`] if the key is already
    /// registered with different content.
    pub fn add_event(&self, event: CanonicalEvent) -> Result<(), RegistryError> {
        let mut index = self.index.write();
        if let Some(existing) = index.events.get(&event.key) {
            if *existing == event {
                return Ok(());
            }
            return Err(RegistryError::ConflictingEvent { key: event.key });
        }
        index.index_aliases(&event);
        debug!(canonical_key = %event.key, "event registered");
        index.events.insert(event.key.clone(), event);
        Ok(())
    }

    /// Registers or refreshes a venue mapping.
    ///
    /// Refreshing the confidence or method of an existing mapping to the same
    /// key is allowed.
    ///
    /// # Errors
    ///
    /// Returns an error if the confidence is invalid, the target event is not
    /// registered, or the market is already mapped to a different key.
    pub fn add_mapping(&self, mapping: VenueMapping) -> Result<(), RegistryError> {
        if !(0.0..=1.0).contains(&mapping.confidence) {
            return Err(RegistryError::InvalidConfidence(mapping.confidence));
        }
        let mut index = self.index.write();
        if !index.events.contains_key(&mapping.key) {
            return Err(RegistryError::UnknownEvent {
                venue: mapping.venue,
                market_id: mapping.market_id,
                key: mapping.key,
            });
        }
        let slot = (mapping.venue, mapping.market_id.clone());
        if let Some(existing) = index.mappings.get(&slot) {
            if existing.key != mapping.key {
                return Err(RegistryError::ConflictingMapping {
                    venue: mapping.venue,
                    market_id: mapping.market_id,
                    existing: existing.key.clone(),
                    proposed: mapping.key,
                });
            }
        }
        if mapping.confidence < self.confidence_threshold {
            debug!(
                venue = %mapping.venue,
                market_id = %mapping.market_id,
                confidence = mapping.confidence,
                threshold = self.confidence_threshold,
                "mapping stored below confidence threshold"
            );
        }
        index.mappings.insert(slot, mapping);
        Ok(())
    }

    /// Adds an alias to a registered event. Returns false if the key is unknown.
    pub fn add_alias(&self, key: &CanonicalKey, alias: &str) -> bool {
        let mut index = self.index.write();
        let Some(event) = index.events.get_mut(key) else {
            return false;
        };
        event.aliases.insert(alias.trim().to_string());
        let norm = normalize_alias(alias);
        if !norm.is_empty() {
            index.aliases.entry(norm).or_default().insert(key.clone());
        }
        true
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Canonical key for a venue market, if mapped with sufficient confidence.
    #[must_use]
    pub fn resolve(&self, venue: Venue, market_id: &str) -> Option<CanonicalKey> {
        let index = self.index.read();
        let mapping = index.mappings.get(&(venue, market_id.to_string()))?;
        if mapping.confidence < self.confidence_threshold {
            return None;
        }
        index
            .events
            .contains_key(&mapping.key)
            .then(|| mapping.key.clone())
    }

    /// Event for a canonical key.
    #[must_use]
    pub fn lookup(&self, key: &CanonicalKey) -> Option<CanonicalEvent> {
        self.index.read().events.get(key).cloned()
    }

    /// Raw mapping for a venue market, regardless of confidence.
    #[must_use]
    pub fn mapping(&self, venue: Venue, market_id: &str) -> Option<VenueMapping> {
        self.index
            .read()
            .mappings
            .get(&(venue, market_id.to_string()))
            .cloned()
    }

    /// Events whose alias or display title matches `alias` after
    /// normalization.
    #[must_use]
    pub fn search_by_alias(&self, alias: &str) -> Vec<CanonicalEvent> {
        let index = self.index.read();
        index
            .aliases
            .get(&normalize_alias(alias))
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| index.events.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All mappings pointing at a key, trusted or not.
    #[must_use]
    pub fn mapped_markets(&self, key: &CanonicalKey) -> Vec<VenueMapping> {
        let mut out: Vec<VenueMapping> = self
            .index
            .read()
            .mappings
            .values()
            .filter(|m| &m.key == key)
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.venue, &a.market_id).cmp(&(b.venue, &b.market_id)));
        out
    }

    /// Coverage summary across all events and mappings.
    #[must_use]
    pub fn coverage_stats(&self) -> CoverageStats {
        let index = self.index.read();
        let mut stats = CoverageStats {
            total_events: index.events.len(),
            total_mappings: index.mappings.len(),
            ..CoverageStats::default()
        };
        let mut venues_per_event: HashMap<&CanonicalKey, BTreeSet<Venue>> = HashMap::new();
        for mapping in index.mappings.values() {
            *stats.by_venue.entry(mapping.venue).or_default() += 1;
            *stats.by_method.entry(mapping.method).or_default() += 1;
            if mapping.confidence < self.confidence_threshold {
                stats.untrusted_mappings += 1;
                continue;
            }
            venues_per_event
                .entry(&mapping.key)
                .or_default()
                .insert(mapping.venue);
        }
        stats.cross_venue_events = venues_per_event.values().filter(|v| v.len() >= 2).count();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::{TimeZone, Utc};

    fn key(descriptor: &str) -> CanonicalKey {
        CanonicalKey::build("election", "us", descriptor, "2024-11-05", "yes").unwrap()
    }

    fn event(descriptor: &str) -> CanonicalEvent {
        CanonicalEvent::new(
            key(descriptor),
            Utc.with_ymd_and_hms(2024, 11, 6, 0, 0, 0).unwrap(),
            format!("{descriptor} wins"),
        )
    }

    fn registry_with_pair() -> CanonicalRegistry {
        let registry = CanonicalRegistry::default();
        registry.add_event(event("president")).unwrap();
        registry
            .add_mapping(VenueMapping::new(
                Venue::Polymarket,
                "0xabc",
                key("president"),
                1.0,
                MappingMethod::Deterministic,
            ))
            .unwrap();
        registry
            .add_mapping(VenueMapping::new(
                Venue::Kalshi,
                "PRES-24",
                key("president"),
                0.95,
                MappingMethod::ManualOverride,
            ))
            .unwrap();
        registry
    }

    // ==================== Resolve / Lookup Tests ====================

    #[test]
    fn test_resolve_then_lookup_round_trip() {
        let registry = registry_with_pair();
        for (venue, market) in [(Venue::Polymarket, "0xabc"), (Venue::Kalshi, "PRES-24")] {
            let resolved = registry.resolve(venue, market).unwrap();
            let event = registry.lookup(&resolved).unwrap();
            assert_eq!(event.key, resolved);
        }
    }

    #[test]
    fn test_resolve_unknown_market_is_absent() {
        let registry = registry_with_pair();
        assert!(registry.resolve(Venue::Kalshi, "OTHER").is_none());
        assert!(registry.resolve(Venue::Polymarket, "PRES-24").is_none());
    }

    #[test]
    fn test_low_confidence_mapping_treated_as_absent() {
        let registry = CanonicalRegistry::new(0.85);
        registry.add_event(event("senate")).unwrap();
        registry
            .add_mapping(VenueMapping::new(
                Venue::Kalshi,
                "SEN",
                key("senate"),
                0.84,
                MappingMethod::Deterministic,
            ))
            .unwrap();
        assert!(registry.resolve(Venue::Kalshi, "SEN").is_none());
        assert!(registry.mapping(Venue::Kalshi, "SEN").is_some());
        assert_eq!(registry.coverage_stats().untrusted_mappings, 1);
    }

    // ==================== Integrity Tests ====================

    #[test]
    fn test_conflicting_event_rejected() {
        let registry = CanonicalRegistry::default();
        registry.add_event(event("president")).unwrap();
        registry.add_event(event("president")).unwrap();

        let mut changed = event("president");
        changed.display_title = "something else".into();
        assert!(matches!(
            registry.add_event(changed),
            Err(RegistryError::ConflictingEvent { .. })
        ));
    }

    #[test]
    fn test_mapping_to_unknown_event_rejected() {
        let registry = CanonicalRegistry::default();
        let err = registry
            .add_mapping(VenueMapping::new(
                Venue::Kalshi,
                "X",
                key("ghost"),
                1.0,
                MappingMethod::ManualOverride,
            ))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownEvent { .. }));
    }

    #[test]
    fn test_remap_to_different_key_rejected() {
        let registry = registry_with_pair();
        registry.add_event(event("senate")).unwrap();
        let err = registry
            .add_mapping(VenueMapping::new(
                Venue::Kalshi,
                "PRES-24",
                key("senate"),
                1.0,
                MappingMethod::ManualOverride,
            ))
            .unwrap_err();
        assert!(matches!(err, RegistryError::ConflictingMapping { .. }));
        assert_eq!(registry.resolve(Venue::Kalshi, "PRES-24"), Some(key("president")));
    }

    #[test]
    fn test_invalid_confidence_rejected() {
        let registry = registry_with_pair();
        let err = registry
            .add_mapping(VenueMapping::new(
                Venue::Kalshi,
                "PRES-24",
                key("president"),
                f64::NAN,
                MappingMethod::ManualOverride,
            ))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfidence(_)));
    }

    // ==================== Search / Coverage Tests ====================

    #[test]
    fn test_search_by_alias_normalizes() {
        let registry = CanonicalRegistry::default();
        registry
            .add_event(event("president").with_alias("Presidential Election Winner 2024"))
            .unwrap();
        let found = registry.search_by_alias("  presidential   election winner 2024 ");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, key("president"));

        assert!(registry.add_alias(&key("president"), "POTUS 2024"));
        assert_eq!(registry.search_by_alias("potus 2024").len(), 1);
        assert!(registry.search_by_alias("nothing").is_empty());
    }

    #[test]
    fn test_coverage_stats() {
        let registry = registry_with_pair();
        registry.add_event(event("senate")).unwrap();
        let stats = registry.coverage_stats();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.total_mappings, 2);
        assert_eq!(stats.cross_venue_events, 1);
        assert_eq!(stats.by_venue.get(&Venue::Kalshi), Some(&1));
        assert_eq!(stats.by_method.get(&MappingMethod::Deterministic), Some(&1));
        assert_eq!(registry.mapped_markets(&key("president")).len(), 2);
    }

    #[test]
    fn test_save_and_load_through_store() {
        let registry = registry_with_pair();
        let store = InMemoryStore::default();
        registry.save(&store).unwrap();

        let loaded = CanonicalRegistry::load(&store, 0.85).unwrap();
        assert_eq!(loaded.snapshot(), registry.snapshot());
        assert_eq!(loaded.resolve(Venue::Polymarket, "0xabc"), Some(key("president")));
    }
}
