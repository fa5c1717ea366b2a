//! Error taxonomy for the arbitrage pipeline.
//!
//! Most variants describe expected no-op outcomes (a discarded quote, an
//! edge below threshold) and are counted rather than surfaced. `UnwindFailed`
//! and `InvariantViolation` are fatal for trading on the affected event.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{CanonicalKey, Venue};

/// Errors raised along the discovery and execution path.
#[derive(Debug, Clone, Error)]
pub enum ArbError {
    /// Quote for a market with no trusted registry mapping. Discarded.
    #[error("no registry mapping for {venue}/{market_id}")]
    MappingAbsent {
        /// Venue of the quote.
        venue: Venue,
        /// Native market id.
        market_id: String,
    },

    /// Quote failed basic range checks.
    #[error("invalid quote from {venue}/{market_id}: {reason}")]
    InvalidQuote {
        /// Venue of the quote.
        venue: Venue,
        /// Native market id.
        market_id: String,
        /// What was wrong.
        reason: String,
    },

    /// Pair rejected for the cycle because a quote was too old.
    #[error("stale quote for {key} on {venue}")]
    StaleQuote {
        /// Canonical event.
        key: CanonicalKey,
        /// Venue whose quote was stale.
        venue: Venue,
    },

    /// Best edge below the configured minimum.
    #[error("edge {edge_bps} bps below minimum {min_edge_bps} bps")]
    InsufficientEdge {
        /// Best edge found.
        edge_bps: Decimal,
        /// Configured minimum.
        min_edge_bps: Decimal,
    },

    /// A leg was rejected by the venue; that leg never opened.
    #[error("{venue} rejected order: {reason}")]
    VenueRejected {
        /// Rejecting venue.
        venue: Venue,
        /// Venue-reported reason.
        reason: String,
    },

    /// Hedge leg only partially filled; residual exposure is tracked.
    #[error("partial fill on {key}: residual {residual}")]
    PartialFill {
        /// Canonical event.
        key: CanonicalKey,
        /// Unhedged contracts.
        residual: Decimal,
    },

    /// Unwind attempts exhausted. Requires operator intervention.
    #[error("unwind failed for {key} after {attempts} attempts, {remaining} contracts still open")]
    UnwindFailed {
        /// Canonical event.
        key: CanonicalKey,
        /// Attempts made.
        attempts: u32,
        /// Contracts that could not be closed.
        remaining: Decimal,
    },

    /// Opportunity blocked by a risk limit.
    #[error("risk limit breached: {limit}")]
    RiskLimitBreach {
        /// Which limit, rendered.
        limit: String,
    },

    /// A pipeline invariant was found broken.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl ArbError {
    /// True for errors that halt trading on an event or globally.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnwindFailed { .. } | Self::InvariantViolation(_))
    }

    /// True for outcomes that are normal, counted no-ops.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::MappingAbsent { .. } | Self::StaleQuote { .. } | Self::InsufficientEdge { .. }
        )
    }
}
