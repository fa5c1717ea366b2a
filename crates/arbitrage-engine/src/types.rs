//! Shared domain types for cross-venue arbitrage.
//!
//! Canonical event identity, venue quotes, synchronized quote pairs and the
//! opportunities derived from them. Everything here is an immutable value;
//! stateful components live in their own modules.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// Venue and Side
// =============================================================================

/// Identifies which trading venue a quote, order or holding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    /// Polymarket CLOB.
    Polymarket,
    /// Kalshi exchange.
    Kalshi,
}

impl Venue {
    /// Every supported venue.
    pub const ALL: [Venue; 2] = [Venue::Polymarket, Venue::Kalshi];

    /// Returns the lowercase identifier used in files and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Polymarket => "polymarket",
            Self::Kalshi => "kalshi",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Venue {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polymarket" => Ok(Self::Polymarket),
            "kalshi" => Ok(Self::Kalshi),
            other => Err(KeyError::UnknownVenue(other.to_string())),
        }
    }
}

/// Binary contract side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Pays one unit if the event resolves YES.
    Yes,
    /// Pays one unit if the event resolves NO.
    No,
}

impl Side {
    /// Returns the opposite side.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Yes => Self::No,
            Self::No => Self::Yes,
        }
    }

    /// Returns the display string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "YES",
            Self::No => "NO",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Canonical Keys
// =============================================================================

/// Maximum length of a single key token.
pub const MAX_TOKEN_LEN: usize = 64;

/// Errors building or parsing canonical identifiers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    /// A component normalized to nothing.
    #[error("empty key component: {0}")]
    EmptyComponent(&'static str),

    /// Wrong number of `:`-separated components.
    #[error("malformed canonical key {raw:?}: expected 5 components, found {found}")]
    Malformed {
        /// Input string.
        raw: String,
        /// Components found.
        found: usize,
    },

    /// A parsed component is not in normalized form.
    #[error("component {component} of {raw:?} is not normalized")]
    NotNormalized {
        /// Component name.
        component: &'static str,
        /// Input string.
        raw: String,
    },

    /// Venue name not recognised.
    #[error("unknown venue: {0}")]
    UnknownVenue(String),
}

/// Normalizes one key token: trim, uppercase, whitespace runs to `_`,
/// characters outside `[A-Z0-9_.-]` dropped, bounded length.
#[must_use]
pub fn normalize_token(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.trim().chars() {
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        let upper = ch.to_ascii_uppercase();
        if upper.is_ascii_alphanumeric() || matches!(upper, '_' | '.' | '-') {
            if pending_space && !out.is_empty() {
                out.push('_');
            }
            pending_space = false;
            out.push(upper);
        }
    }
    out.truncate(MAX_TOKEN_LEN);
    out
}

/// Structured identifier of a canonical event:
/// `CATEGORY:SCOPE:DESCRIPTOR:DATE:OUTCOME`.
///
/// Two quotes with different keys are unrelated regardless of title similarity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalKey(String);

/// Named components of a [`CanonicalKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParts<'a> {
    pub category: &'a str,
    pub scope: &'a str,
    pub descriptor: &'a str,
    pub date: &'a str,
    pub outcome: &'a str,
}

const COMPONENTS: [&str; 5] = ["category", "scope", "descriptor", "date", "outcome"];

impl CanonicalKey {
    /// Builds a key from raw components, normalizing each one.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::EmptyComponent`] when a component normalizes to
    /// an empty token.
    pub fn build(
        category: &str,
        scope: &str,
        descriptor: &str,
        date: &str,
        outcome: &str,
    ) -> Result<Self, KeyError> {
        let raw = [category, scope, descriptor, date, outcome];
        let mut tokens = Vec::with_capacity(raw.len());
        for (name, value) in COMPONENTS.into_iter().zip(raw) {
            let token = normalize_token(value);
            if token.is_empty() {
                return Err(KeyError::EmptyComponent(name));
            }
            tokens.push(token);
        }
        Ok(Self(tokens.join(":")))
    }

    /// Parses an already-rendered key. Components must be in normalized form.
    ///
    /// # Errors
    ///
    /// Returns an error if the string has the wrong shape or any component
    /// would change under normalization.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != COMPONENTS.len() {
            return Err(KeyError::Malformed {
                raw: raw.to_string(),
                found: parts.len(),
            });
        }
        for (name, part) in COMPONENTS.into_iter().zip(&parts) {
            if part.is_empty() {
                return Err(KeyError::EmptyComponent(name));
            }
            if normalize_token(part) != *part {
                return Err(KeyError::NotNormalized {
                    component: name,
                    raw: raw.to_string(),
                });
            }
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the rendered key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the key into its named components.
    #[must_use]
    pub fn parts(&self) -> KeyParts<'_> {
        let mut it = self.0.splitn(5, ':');
        let mut next = || it.next().unwrap_or_default();
        KeyParts {
            category: next(),
            scope: next(),
            descriptor: next(),
            date: next(),
            outcome: next(),
        }
    }
}

impl std::fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CanonicalKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CanonicalKey> for String {
    fn from(key: CanonicalKey) -> Self {
        key.0
    }
}

impl FromStr for CanonicalKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// =============================================================================
// Reference Data
// =============================================================================

/// Settlement unit of a canonical event. Only binary YES/NO contracts exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementUnit {
    #[default]
    BinaryYesNo,
}

/// A single real-world binary outcome, independent of venue phrasing.
/// Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub key: CanonicalKey,
    pub close_time: DateTime<Utc>,
    #[serde(default)]
    pub settlement_unit: SettlementUnit,
    pub display_title: String,
    #[serde(default)]
    pub resolution_source: Option<String>,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
}

impl CanonicalEvent {
    /// Creates an event with no aliases.
    #[must_use]
    pub fn new(key: CanonicalKey, close_time: DateTime<Utc>, display_title: impl Into<String>) -> Self {
        Self {
            key,
            close_time,
            settlement_unit: SettlementUnit::BinaryYesNo,
            display_title: display_title.into(),
            resolution_source: None,
            aliases: BTreeSet::new(),
        }
    }

    /// Adds an alias.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.insert(alias.into());
        self
    }

    /// Sets the resolution source.
    #[must_use]
    pub fn with_resolution_source(mut self, source: impl Into<String>) -> Self {
        self.resolution_source = Some(source.into());
        self
    }
}

/// How a venue mapping was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMethod {
    /// Produced by a deterministic mapper.
    Deterministic,
    /// Entered by an operator.
    ManualOverride,
}

impl MappingMethod {
    /// Returns the identifier used in files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::ManualOverride => "manual_override",
        }
    }
}

impl std::fmt::Display for MappingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MappingMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deterministic" | "regex" | "pattern" => Ok(Self::Deterministic),
            "manual_override" | "manual" | "override" => Ok(Self::ManualOverride),
            other => Err(format!("unknown mapping method: {other}")),
        }
    }
}

/// `(venue, native market id) -> canonical key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueMapping {
    pub venue: Venue,
    pub market_id: String,
    pub key: CanonicalKey,
    pub confidence: f64,
    pub method: MappingMethod,
    #[serde(default)]
    pub title_raw: String,
}

impl VenueMapping {
    /// Creates a mapping.
    #[must_use]
    pub fn new(
        venue: Venue,
        market_id: impl Into<String>,
        key: CanonicalKey,
        confidence: f64,
        method: MappingMethod,
    ) -> Self {
        Self {
            venue,
            market_id: market_id.into(),
            key,
            confidence,
            method,
            title_raw: String::new(),
        }
    }

    /// Sets the raw venue title the mapping was derived from.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title_raw = title.into();
        self
    }
}

// =============================================================================
// Quotes
// =============================================================================

/// Top-of-book snapshot as reported by a venue, before canonical resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueQuote {
    pub venue: Venue,
    pub market_id: String,
    pub timestamp: DateTime<Utc>,
    pub bid_yes: Decimal,
    pub ask_yes: Decimal,
    pub bid_no: Decimal,
    pub ask_no: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl VenueQuote {
    /// Checks prices are in `[0, 1]` and sizes are non-negative.
    ///
    /// # Errors
    ///
    /// Returns a description of the first offending field.
    pub fn validate(&self) -> Result<(), String> {
        for (name, price) in [
            ("bid_yes", self.bid_yes),
            ("ask_yes", self.ask_yes),
            ("bid_no", self.bid_no),
            ("ask_no", self.ask_no),
        ] {
            if price < Decimal::ZERO || price > Decimal::ONE {
                return Err(format!("{name} {price} outside [0, 1]"));
            }
        }
        if self.bid_size < Decimal::ZERO || self.ask_size < Decimal::ZERO {
            return Err("negative liquidity".to_string());
        }
        Ok(())
    }

    /// Attaches the resolved canonical key.
    #[must_use]
    pub fn resolved(self, key: CanonicalKey) -> Quote {
        Quote { key, inner: self }
    }

    /// Best ask for a side.
    #[must_use]
    pub fn ask(&self, side: Side) -> Decimal {
        match side {
            Side::Yes => self.ask_yes,
            Side::No => self.ask_no,
        }
    }

    /// Best bid for a side.
    #[must_use]
    pub fn bid(&self, side: Side) -> Decimal {
        match side {
            Side::Yes => self.bid_yes,
            Side::No => self.bid_no,
        }
    }
}

/// A venue quote bound to a canonical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub key: CanonicalKey,
    #[serde(flatten)]
    pub inner: VenueQuote,
}

impl Quote {
    #[must_use]
    pub fn venue(&self) -> Venue {
        self.inner.venue
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.inner.timestamp
    }

    #[must_use]
    pub fn ask(&self, side: Side) -> Decimal {
        self.inner.ask(side)
    }

    #[must_use]
    pub fn bid(&self, side: Side) -> Decimal {
        self.inner.bid(side)
    }

    /// Mid price for a side, used for marking open holdings.
    #[must_use]
    pub fn mid(&self, side: Side) -> Decimal {
        (self.bid(side) + self.ask(side)) / Decimal::TWO
    }

    /// True once the venue-declared expiry has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.inner.expires_at.is_some_and(|exp| now >= exp)
    }
}

/// Two same-bucket quotes for one canonical key from two distinct venues.
/// `a` is always the lower-ordered venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotePair {
    pub key: CanonicalKey,
    pub a: Quote,
    pub b: Quote,
    pub bucket_close: DateTime<Utc>,
}

impl QuotePair {
    /// Returns the pair with the venue roles exchanged.
    #[must_use]
    pub fn swapped(&self) -> Self {
        Self {
            key: self.key.clone(),
            a: self.b.clone(),
            b: self.a.clone(),
            bucket_close: self.bucket_close,
        }
    }

    /// Absolute timestamp difference between the two quotes.
    #[must_use]
    pub fn timestamp_spread(&self) -> chrono::Duration {
        (self.a.timestamp() - self.b.timestamp()).abs()
    }
}

// =============================================================================
// Opportunities
// =============================================================================

/// Which side is bought on which venue of a [`QuotePair`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Buy YES on venue A, buy NO on venue B.
    YesANoB,
    /// Buy NO on venue A, buy YES on venue B.
    NoAYesB,
}

impl Strategy {
    /// Side bought on venue A; venue B takes the opposite side.
    #[must_use]
    pub fn side_a(self) -> Side {
        match self {
            Self::YesANoB => Side::Yes,
            Self::NoAYesB => Side::No,
        }
    }

    /// Side bought on venue B.
    #[must_use]
    pub fn side_b(self) -> Side {
        self.side_a().opposite()
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::YesANoB => "yes_a_no_b",
            Self::NoAYesB => "no_a_yes_b",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One side of a planned hedge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgeLeg {
    pub venue: Venue,
    pub market_id: String,
    pub side: Side,
    /// Observed ask the leg is priced at.
    pub price: Decimal,
    /// Top-of-book liquidity at that ask.
    pub available: Decimal,
}

/// A detected cross-venue discrepancy. Consumed once by sizing/execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub key: CanonicalKey,
    pub strategy: Strategy,
    pub edge_bps: Decimal,
    pub gross_cost: Decimal,
    pub net_cost: Decimal,
    /// Liquidity bound, in contracts.
    pub max_size: Decimal,
    pub leg_a: HedgeLeg,
    pub leg_b: HedgeLeg,
    pub pair: QuotePair,
    pub computed_at: DateTime<Utc>,
}

/// An opportunity with an approved order size (contracts per leg).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizedOpportunity {
    pub opportunity: ArbitrageOpportunity,
    pub size: Decimal,
    /// `size * net_cost`, the capital committed if both legs fill.
    pub notional: Decimal,
    /// Admitted as the circuit breaker's half-open trial.
    #[serde(default)]
    pub breaker_trial: bool,
}

impl SizedOpportunity {
    #[must_use]
    pub fn key(&self) -> &CanonicalKey {
        &self.opportunity.key
    }
}
