//! Venue mapper contract.
//!
//! A mapper turns venue market metadata into a canonical key or an explicit
//! abstention. It never guesses: a decision below the registry's confidence
//! threshold is promoted to nothing. Mappers only ever produce registry
//! entries; quotes are matched through the registry alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::registry::{normalize_alias, CanonicalRegistry};
use crate::types::{CanonicalKey, MappingMethod, Venue, VenueMapping};

/// Venue-side market metadata a mapper works from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueMarket {
    pub venue: Venue,
    pub market_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub outcomes: Vec<String>,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
}

/// Outcome of mapping one venue market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MapperDecision {
    Mapped {
        key: CanonicalKey,
        confidence: f64,
        method: MappingMethod,
    },
    Abstain {
        reason: String,
    },
}

impl MapperDecision {
    #[must_use]
    pub fn abstain(reason: impl Into<String>) -> Self {
        Self::Abstain {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped { .. })
    }
}

/// Pure `market metadata -> key | abstain` capability.
pub trait VenueMapper: Send + Sync {
    /// Maps a market, or abstains.
    fn map(&self, market: &VenueMarket) -> MapperDecision;

    /// Name used in logs.
    fn name(&self) -> &'static str;
}

/// Turns a decision into a registry mapping, only when its confidence meets
/// `threshold`.
#[must_use]
pub fn promote_decision(
    decision: &MapperDecision,
    market: &VenueMarket,
    threshold: f64,
) -> Option<VenueMapping> {
    match decision {
        MapperDecision::Mapped {
            key,
            confidence,
            method,
        } if *confidence >= threshold => Some(
            VenueMapping::new(market.venue, &market.market_id, key.clone(), *confidence, *method)
                .with_title(&market.title),
        ),
        _ => None,
    }
}

/// Exact alias mapper.
///
/// Matches the market title against registered aliases and display titles
/// after whitespace/case normalization. A unique hit maps with confidence
/// 1.0; no hit or several hits abstain.
#[derive(Debug, Clone)]
pub struct AliasMapper {
    registry: Arc<CanonicalRegistry>,
}

impl AliasMapper {
    #[must_use]
    pub fn new(registry: Arc<CanonicalRegistry>) -> Self {
        Self { registry }
    }
}

impl VenueMapper for AliasMapper {
    fn map(&self, market: &VenueMarket) -> MapperDecision {
        let normalized = normalize_alias(&market.title);
        if normalized.is_empty() {
            return MapperDecision::abstain("empty title");
        }
        let hits = self.registry.search_by_alias(&normalized);
        match hits.as_slice() {
            [] => MapperDecision::abstain(format!("no alias matches {normalized:?}")),
            [event] => {
                if let Some(market_close) = market.close_time {
                    if market_close.date_naive() != event.close_time.date_naive() {
                        return MapperDecision::abstain(format!(
                            "close date {} differs from {}",
                            market_close.date_naive(),
                            event.close_time.date_naive()
                        ));
                    }
                }
                MapperDecision::Mapped {
                    key: event.key.clone(),
                    confidence: 1.0,
                    method: MappingMethod::Deterministic,
                }
            }
            many => MapperDecision::abstain(format!("{} events share alias {normalized:?}", many.len())),
        }
    }

    fn name(&self) -> &'static str {
        "alias"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CanonicalEvent;
    use chrono::TimeZone;

    fn close() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 2, 23, 0, 0).unwrap()
    }

    fn registry() -> Arc<CanonicalRegistry> {
        let registry = CanonicalRegistry::default();
        let key = CanonicalKey::build("awards", "oscars", "best picture", "2025-03-02", "anora").unwrap();
        registry
            .add_event(CanonicalEvent::new(key, close(), "Anora wins Best Picture").with_alias("Best Picture: Anora"))
            .unwrap();
        Arc::new(registry)
    }

    fn market(title: &str) -> VenueMarket {
        VenueMarket {
            venue: Venue::Polymarket,
            market_id: "0x01".into(),
            title: title.into(),
            description: String::new(),
            outcomes: vec!["Yes".into(), "No".into()],
            close_time: Some(close()),
        }
    }

    // ==================== Alias Mapper Tests ====================

    #[test]
    fn test_alias_mapper_maps_unique_hit() {
        let mapper = AliasMapper::new(registry());
        let decision = mapper.map(&market("best picture:  ANORA"));
        match decision {
            MapperDecision::Mapped { key, confidence, method } => {
                assert_eq!(key.parts().outcome, "ANORA");
                assert!((confidence - 1.0).abs() < f64::EPSILON);
                assert_eq!(method, MappingMethod::Deterministic);
            }
            other => panic!("expected mapping, got {other:?}"),
        }
    }

    #[test]
    fn test_alias_mapper_abstains_without_match() {
        let mapper = AliasMapper::new(registry());
        assert!(!mapper.map(&market("Will Conclave win Best Picture?")).is_mapped());
        assert!(!mapper.map(&market("   ")).is_mapped());
    }

    #[test]
    fn test_alias_mapper_abstains_on_close_date_mismatch() {
        let mapper = AliasMapper::new(registry());
        let mut m = market("Anora wins Best Picture");
        m.close_time = Some(close() + chrono::Duration::days(2));
        assert!(!mapper.map(&m).is_mapped());
    }

    #[test]
    fn test_alias_mapper_abstains_on_ambiguity() {
        let registry = registry();
        let other = CanonicalKey::build("awards", "oscars", "best picture", "2026-03-02", "anora").unwrap();
        registry
            .add_event(CanonicalEvent::new(other, close(), "Other").with_alias("Best Picture: Anora"))
            .unwrap();
        let mapper = AliasMapper::new(registry);
        let decision = mapper.map(&market("Best Picture: Anora"));
        assert!(matches!(decision, MapperDecision::Abstain { ref reason } if reason.contains("2 events")));
    }

    // ==================== Promotion Tests ====================

    #[test]
    fn test_promote_respects_threshold() {
        let key = CanonicalKey::parse("AWARDS:OSCARS:BEST_PICTURE:2025-03-02:ANORA").unwrap();
        let m = market("x");
        let weak = MapperDecision::Mapped {
            key: key.clone(),
            confidence: 0.8,
            method: MappingMethod::Deterministic,
        };
        assert!(promote_decision(&weak, &m, 0.85).is_none());

        let strong = MapperDecision::Mapped {
            key,
            confidence: 0.9,
            method: MappingMethod::Deterministic,
        };
        let mapping = promote_decision(&strong, &m, 0.85).unwrap();
        assert_eq!(mapping.venue, Venue::Polymarket);
        assert_eq!(mapping.market_id, "0x01");

        assert!(promote_decision(&MapperDecision::abstain("no"), &m, 0.0).is_none());
    }
}
