//! Venue connector contract.
//!
//! The coordinator depends only on this trait: fetch quotes, place an order,
//! poll it, cancel it. Connectors must report fills with size and average
//! price, and must keep a definite rejection ([`ConnectorError::Rejected`])
//! distinct from an unknown outcome ([`ConnectorError::Timeout`]).

use async_trait::async_trait;
use pm_arb_core::Settings;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::types::{Side, Venue, VenueQuote};

// =============================================================================
// Orders
// =============================================================================

/// Buy or sell of a binary contract side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderAction {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Accepted, resting, no fills yet.
    Pending,
    /// Some size filled, remainder still working.
    PartiallyFilled,
    /// Completely filled.
    Filled,
    /// Cancelled; may carry a partial fill.
    Cancelled,
    /// Rejected by the venue.
    Rejected,
}

impl OrderStatus {
    /// Returns true if no further changes are expected.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Order submission parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub venue: Venue,
    pub market_id: String,
    pub side: Side,
    pub action: OrderAction,
    /// `None` for a market order.
    pub limit_price: Option<Decimal>,
    pub size: Decimal,
}

impl OrderRequest {
    /// Limit buy at `price`.
    #[must_use]
    pub fn buy_limit(venue: Venue, market_id: impl Into<String>, side: Side, price: Decimal, size: Decimal) -> Self {
        Self {
            venue,
            market_id: market_id.into(),
            side,
            action: OrderAction::Buy,
            limit_price: Some(price),
            size,
        }
    }

    /// Sell at market.
    #[must_use]
    pub fn sell_market(venue: Venue, market_id: impl Into<String>, side: Side, size: Decimal) -> Self {
        Self {
            venue,
            market_id: market_id.into(),
            side,
            action: OrderAction::Sell,
            limit_price: None,
            size,
        }
    }

    /// Replaces the limit price.
    #[must_use]
    pub fn with_limit(mut self, price: Decimal) -> Self {
        self.limit_price = Some(price);
        self
    }
}

/// Venue view of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub venue: Venue,
    pub market_id: String,
    pub side: Side,
    pub action: OrderAction,
    pub limit_price: Option<Decimal>,
    pub size: Decimal,
    pub status: OrderStatus,
    pub filled_size: Decimal,
    /// Volume-weighted average fill price, when anything filled.
    pub avg_fill_price: Option<Decimal>,
    /// Venue-reported reason for rejection.
    #[serde(default)]
    pub reason: Option<String>,
}

impl Order {
    /// Fresh order for a request, nothing filled.
    #[must_use]
    pub fn pending(id: impl Into<String>, request: &OrderRequest) -> Self {
        Self {
            id: id.into(),
            venue: request.venue,
            market_id: request.market_id.clone(),
            side: request.side,
            action: request.action,
            limit_price: request.limit_price,
            size: request.size,
            status: OrderStatus::Pending,
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            reason: None,
        }
    }

    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    #[must_use]
    pub fn has_fills(&self) -> bool {
        self.filled_size > Decimal::ZERO
    }

    /// Unfilled remainder.
    #[must_use]
    pub fn remaining(&self) -> Decimal {
        (self.size - self.filled_size).max(Decimal::ZERO)
    }

    /// Total notional value of fills.
    #[must_use]
    pub fn fill_notional(&self) -> Decimal {
        self.avg_fill_price.unwrap_or(Decimal::ZERO) * self.filled_size
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by venue connectors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectorError {
    /// Definite rejection; nothing was opened.
    #[error("order rejected: {reason}")]
    Rejected {
        /// Venue-reported reason.
        reason: String,
    },

    /// No answer in time; the outcome is unknown.
    #[error("timed out: {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },

    /// Network or venue hiccup; safe to retry.
    #[error("transient venue error: {0}")]
    Transient(String),

    /// Order id unknown to the venue.
    #[error("order not found: {0}")]
    NotFound(String),

    /// Request failed local validation.
    #[error("invalid order: {0}")]
    InvalidOrder(String),
}

impl ConnectorError {
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Returns true if the same request may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transient(_))
    }
}

// =============================================================================
// Connector Trait
// =============================================================================

/// One trading venue, as seen by the engine.
#[async_trait]
pub trait VenueConnector: Send + Sync {
    /// Venue served by this connector.
    fn venue(&self) -> Venue;

    /// Current top-of-book quotes for the markets this connector follows.
    async fn fetch_quotes(&self) -> Result<Vec<VenueQuote>, ConnectorError>;

    /// Submits an order.
    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ConnectorError>;

    /// Current state of an order.
    async fn poll_order(&self, order_id: &str) -> Result<Order, ConnectorError>;

    /// Cancels an order. Returns false if it was already terminal.
    async fn cancel_order(&self, order_id: &str) -> Result<bool, ConnectorError>;
}

/// Connectors keyed by venue.
pub type ConnectorMap = HashMap<Venue, Arc<dyn VenueConnector>>;

// =============================================================================
// Live Gate
// =============================================================================

/// Routes order flow to live connectors only when live trading is both
/// selected and explicitly confirmed; otherwise every venue gets its paper
/// connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveGate {
    live: bool,
}

impl LiveGate {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            live: settings.is_live_trading_enabled(),
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Chooses, per venue, the live connector (when enabled and available)
    /// or the paper one.
    #[must_use]
    pub fn route(&self, live: ConnectorMap, paper: ConnectorMap) -> ConnectorMap {
        if !self.live {
            info!(venues = paper.len(), "live trading not confirmed, routing orders to paper connectors");
            return paper;
        }
        let mut routed = paper;
        for (venue, connector) in live {
            info!(venue = %venue, "live connector enabled");
            routed.insert(venue, connector);
        }
        for venue in Venue::ALL {
            if !routed.contains_key(&venue) {
                warn!(venue = %venue, "no connector available for venue");
            }
        }
        routed
    }
}
