//! Paper venue connector.
//!
//! Simulates a venue for paper and backtest modes and for tests. Fills are
//! drawn from a seeded RNG (fill rate, partial-fill rate) unless an outcome
//! has been scripted for the next order. Every order is kept so it can be
//! polled and cancelled like a real one. Quote batches pushed onto the feed
//! are handed out by [`VenueConnector::fetch_quotes`] and double as the
//! reference prices for market orders.

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::connector::{ConnectorError, Order, OrderAction, OrderRequest, OrderStatus, VenueConnector};
use crate::types::{Venue, VenueQuote};

// =============================================================================
// Configuration
// =============================================================================

/// Fill simulation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConnectorConfig {
    /// Probability that an unscripted order fills (0.0 to 1.0).
    pub fill_rate: f64,

    /// Probability that a fill is partial.
    pub partial_fill_rate: f64,

    /// Partial fill fraction bounds.
    pub min_partial_fill_pct: f64,
    pub max_partial_fill_pct: f64,

    /// Simulated latency per call.
    pub simulate_latency_ms: u64,

    /// Seed for reproducible runs; `None` uses system entropy.
    pub random_seed: Option<u64>,
}

impl Default for PaperConnectorConfig {
    fn default() -> Self {
        Self {
            fill_rate: 0.85,
            partial_fill_rate: 0.10,
            min_partial_fill_pct: 0.25,
            max_partial_fill_pct: 0.95,
            simulate_latency_ms: 0,
            random_seed: None,
        }
    }
}

impl PaperConnectorConfig {
    /// Every unscripted order fills completely.
    #[must_use]
    pub fn always_fill() -> Self {
        Self {
            fill_rate: 1.0,
            partial_fill_rate: 0.0,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    #[must_use]
    pub fn fill_rate(mut self, rate: f64) -> Self {
        self.fill_rate = rate.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn partial_fill_rate(mut self, rate: f64) -> Self {
        self.partial_fill_rate = rate.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.simulate_latency_ms = ms;
        self
    }
}

/// Forced outcome for the next placed order.
#[derive(Debug, Clone, PartialEq)]
pub enum PaperScript {
    /// Fill completely at the order price.
    Fill,
    /// Fill `fraction` of the size (whole contracts) and rest the remainder.
    PartialFill(Decimal),
    /// Venue refuses the order.
    Reject(String),
    /// Accept and rest without filling.
    Rest,
    /// Rest, then fill completely on the n-th poll.
    FillAfterPolls(u32),
    /// Rest and refuse every cancel, like a venue that stopped answering.
    Unresponsive,
    /// Placement call fails with this error.
    Fail(ConnectorError),
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Default)]
struct PaperState {
    orders: HashMap<String, Order>,
    /// Insertion order of `orders`.
    order_ids: Vec<String>,
    /// Polls remaining before a resting order fills.
    countdowns: HashMap<String, u32>,
    /// Orders whose cancels always fail.
    unresponsive: HashSet<String>,
    reference: HashMap<String, VenueQuote>,
    feed: VecDeque<Vec<VenueQuote>>,
    script: VecDeque<PaperScript>,
    orders_placed: u32,
    rejected_orders: u32,
}

// =============================================================================
// Paper Connector
// =============================================================================

/// Simulated venue.
pub struct PaperConnector {
    venue: Venue,
    config: PaperConnectorConfig,
    state: RwLock<PaperState>,
    rng: RwLock<StdRng>,
}

impl std::fmt::Debug for PaperConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperConnector")
            .field("venue", &self.venue)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PaperConnector {
    #[must_use]
    pub fn new(venue: Venue, config: PaperConnectorConfig) -> Self {
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            venue,
            config,
            state: RwLock::new(PaperState::default()),
            rng: RwLock::new(rng),
        }
    }

    /// Connector that fills every unscripted order.
    #[must_use]
    pub fn always_fill(venue: Venue) -> Self {
        Self::new(venue, PaperConnectorConfig::always_fill())
    }

    /// Queues a forced outcome for the next placed order.
    pub fn script(&self, outcome: PaperScript) {
        self.state.write().script.push_back(outcome);
    }

    /// Queues several forced outcomes, in order.
    pub fn script_all(&self, outcomes: impl IntoIterator<Item = PaperScript>) {
        self.state.write().script.extend(outcomes);
    }

    /// Queues a batch for the next `fetch_quotes` call.
    pub fn push_quotes(&self, batch: Vec<VenueQuote>) {
        self.state.write().feed.push_back(batch);
    }

    /// Sets the reference quote used to price market orders.
    pub fn set_reference_quote(&self, quote: VenueQuote) {
        self.state
            .write()
            .reference
            .insert(quote.market_id.clone(), quote);
    }

    /// All orders placed so far, oldest first.
    #[must_use]
    pub fn orders(&self) -> Vec<Order> {
        let state = self.state.read();
        state
            .order_ids
            .iter()
            .filter_map(|id| state.orders.get(id).cloned())
            .collect()
    }

    #[must_use]
    pub fn orders_placed(&self) -> u32 {
        self.state.read().orders_placed
    }

    #[must_use]
    pub fn rejected_orders(&self) -> u32 {
        self.state.read().rejected_orders
    }

    async fn simulate_latency(&self) {
        if self.config.simulate_latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.simulate_latency_ms)).await;
        }
    }

    fn random_outcome(&self) -> PaperScript {
        let mut rng = self.rng.write();
        if rng.gen::<f64>() >= self.config.fill_rate {
            return PaperScript::Reject("no fill - simulated market conditions".to_string());
        }
        if rng.gen::<f64>() < self.config.partial_fill_rate {
            let lo = self.config.min_partial_fill_pct.min(self.config.max_partial_fill_pct);
            let hi = self.config.max_partial_fill_pct.max(lo);
            let pct = rng.gen_range(lo..=hi);
            let fraction = Decimal::from_f64_retain(pct).unwrap_or(Decimal::ONE / Decimal::TWO);
            return PaperScript::PartialFill(fraction);
        }
        PaperScript::Fill
    }

    /// Price an order executes at: its limit, or the reference book for
    /// market orders.
    fn execution_price(state: &PaperState, request: &OrderRequest) -> Option<Decimal> {
        if let Some(limit) = request.limit_price {
            return Some(limit);
        }
        let quote = state.reference.get(&request.market_id)?;
        Some(match request.action {
            OrderAction::Buy => quote.ask(request.side),
            OrderAction::Sell => quote.bid(request.side),
        })
    }
}

#[async_trait]
impl VenueConnector for PaperConnector {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn fetch_quotes(&self) -> Result<Vec<VenueQuote>, ConnectorError> {
        self.simulate_latency().await;
        let mut state = self.state.write();
        let batch = state.feed.pop_front().unwrap_or_default();
        for quote in &batch {
            state.reference.insert(quote.market_id.clone(), quote.clone());
        }
        Ok(batch)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ConnectorError> {
        self.simulate_latency().await;

        if request.size <= Decimal::ZERO {
            return Err(ConnectorError::InvalidOrder(format!("size {}", request.size)));
        }
        if let Some(limit) = request.limit_price {
            if limit < Decimal::ZERO || limit > Decimal::ONE {
                return Err(ConnectorError::InvalidOrder(format!("price {limit}")));
            }
        }

        let scripted = self.state.write().script.pop_front();
        let outcome = scripted.unwrap_or_else(|| self.random_outcome());

        let mut state = self.state.write();
        state.orders_placed += 1;

        let id = format!("paper-{}-{}", self.venue, Uuid::new_v4());
        let mut order = Order::pending(&id, request);

        let fill_size = match outcome {
            PaperScript::Fail(err) => {
                state.rejected_orders += 1;
                return Err(err);
            }
            PaperScript::Reject(reason) => {
                state.rejected_orders += 1;
                debug!(venue = %self.venue, market_id = %request.market_id, reason = %reason, "paper order rejected");
                return Err(ConnectorError::Rejected { reason });
            }
            PaperScript::Rest => None,
            PaperScript::Unresponsive => {
                state.unresponsive.insert(id.clone());
                None
            }
            PaperScript::FillAfterPolls(polls) => {
                state.countdowns.insert(id.clone(), polls.max(1));
                None
            }
            PaperScript::Fill => Some(request.size),
            PaperScript::PartialFill(fraction) => {
                Some((request.size * fraction.clamp(Decimal::ZERO, Decimal::ONE)).trunc())
            }
        };

        if let Some(filled) = fill_size {
            let Some(price) = Self::execution_price(&state, request) else {
                state.rejected_orders += 1;
                return Err(ConnectorError::rejected("no reference price for market order"));
            };
            order.filled_size = filled;
            if filled > Decimal::ZERO {
                order.avg_fill_price = Some(price);
            }
            order.status = if filled == request.size {
                OrderStatus::Filled
            } else if filled > Decimal::ZERO {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Pending
            };
        }

        debug!(
            venue = %self.venue,
            order_id = %id,
            status = %order.status,
            filled = %order.filled_size,
            "paper order placed"
        );
        state.order_ids.push(id.clone());
        state.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn poll_order(&self, order_id: &str) -> Result<Order, ConnectorError> {
        self.simulate_latency().await;
        let mut state = self.state.write();

        let due = match state.countdowns.get_mut(order_id) {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if due {
            state.countdowns.remove(order_id);
            let order = state
                .orders
                .get(order_id)
                .cloned()
                .ok_or_else(|| ConnectorError::NotFound(order_id.to_string()))?;
            if !order.is_terminal() {
                let request = OrderRequest {
                    venue: order.venue,
                    market_id: order.market_id.clone(),
                    side: order.side,
                    action: order.action,
                    limit_price: order.limit_price,
                    size: order.size,
                };
                let price = Self::execution_price(&state, &request);
                if let (Some(price), Some(stored)) = (price, state.orders.get_mut(order_id)) {
                    stored.filled_size = stored.size;
                    stored.avg_fill_price = Some(price);
                    stored.status = OrderStatus::Filled;
                }
            }
        }

        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ConnectorError::NotFound(order_id.to_string()))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, ConnectorError> {
        self.simulate_latency().await;
        let mut state = self.state.write();
        if state.unresponsive.contains(order_id) {
            return Err(ConnectorError::Transient(format!("no response cancelling {order_id}")));
        }
        state.countdowns.remove(order_id);
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ConnectorError::NotFound(order_id.to_string()))?;
        if order.is_terminal() {
            return Ok(false);
        }
        order.status = OrderStatus::Cancelled;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn buy(size: Decimal) -> OrderRequest {
        OrderRequest::buy_limit(Venue::Kalshi, "KX-1", Side::Yes, dec!(0.42), size)
    }

    fn reference() -> VenueQuote {
        VenueQuote {
            venue: Venue::Kalshi,
            market_id: "KX-1".into(),
            timestamp: Utc::now(),
            bid_yes: dec!(0.40),
            ask_yes: dec!(0.42),
            bid_no: dec!(0.57),
            ask_no: dec!(0.59),
            bid_size: dec!(500),
            ask_size: dec!(500),
            expires_at: None,
        }
    }

    // ==================== Scripted Outcome Tests ====================

    #[tokio::test]
    async fn test_scripted_fill() {
        let paper = PaperConnector::new(Venue::Kalshi, PaperConnectorConfig::default().fill_rate(0.0));
        paper.script(PaperScript::Fill);
        let order = paper.place_order(&buy(dec!(100))).await.unwrap();
        assert!(order.is_filled());
        assert_eq!(order.avg_fill_price, Some(dec!(0.42)));
        assert_eq!(paper.poll_order(&order.id).await.unwrap(), order);
    }

    #[tokio::test]
    async fn test_scripted_reject_is_error() {
        let paper = PaperConnector::always_fill(Venue::Kalshi);
        paper.script(PaperScript::Reject("price moved".into()));
        let err = paper.place_order(&buy(dec!(10))).await.unwrap_err();
        assert_eq!(err, ConnectorError::rejected("price moved"));
        assert_eq!(paper.rejected_orders(), 1);
    }

    #[tokio::test]
    async fn test_partial_fill_rests_then_cancels() {
        let paper = PaperConnector::always_fill(Venue::Kalshi);
        paper.script(PaperScript::PartialFill(dec!(0.4)));
        let order = paper.place_order(&buy(dec!(100))).await.unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_size, dec!(40));

        assert!(paper.cancel_order(&order.id).await.unwrap());
        let after = paper.poll_order(&order.id).await.unwrap();
        assert_eq!(after.status, OrderStatus::Cancelled);
        assert_eq!(after.filled_size, dec!(40));
        assert!(!paper.cancel_order(&order.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_fill_after_polls() {
        let paper = PaperConnector::always_fill(Venue::Kalshi);
        paper.script(PaperScript::FillAfterPolls(2));
        let order = paper.place_order(&buy(dec!(5))).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(paper.poll_order(&order.id).await.unwrap().status, OrderStatus::Pending);
        assert!(paper.poll_order(&order.id).await.unwrap().is_filled());
    }

    #[tokio::test]
    async fn test_unresponsive_order_refuses_cancel() {
        let paper = PaperConnector::always_fill(Venue::Kalshi);
        paper.script(PaperScript::Unresponsive);
        let order = paper.place_order(&buy(dec!(5))).await.unwrap();

        let err = paper.cancel_order(&order.id).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(paper.poll_order(&order.id).await.unwrap().status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_market_sell_uses_reference_bid() {
        let paper = PaperConnector::always_fill(Venue::Kalshi);
        let sell = OrderRequest::sell_market(Venue::Kalshi, "KX-1", Side::Yes, dec!(10));
        assert!(paper.place_order(&sell).await.is_err());

        paper.set_reference_quote(reference());
        let order = paper.place_order(&sell).await.unwrap();
        assert_eq!(order.avg_fill_price, Some(dec!(0.40)));
    }

    #[tokio::test]
    async fn test_invalid_order_rejected_locally() {
        let paper = PaperConnector::always_fill(Venue::Kalshi);
        assert!(matches!(
            paper.place_order(&buy(Decimal::ZERO)).await,
            Err(ConnectorError::InvalidOrder(_))
        ));
        assert!(matches!(
            paper.poll_order("nope").await,
            Err(ConnectorError::NotFound(_))
        ));
    }

    // ==================== Simulation Tests ====================

    #[tokio::test]
    async fn test_seeded_runs_are_reproducible() {
        let run = |seed| async move {
            let paper = PaperConnector::new(
                Venue::Polymarket,
                PaperConnectorConfig::default().with_seed(seed).partial_fill_rate(0.3),
            );
            let mut statuses = Vec::new();
            for _ in 0..20 {
                statuses.push(
                    paper
                        .place_order(&buy(dec!(100)))
                        .await
                        .map(|o| (o.status, o.filled_size))
                        .ok(),
                );
            }
            statuses
        };
        assert_eq!(run(7).await, run(7).await);
    }

    #[tokio::test]
    async fn test_feed_updates_reference() {
        let paper = PaperConnector::always_fill(Venue::Kalshi);
        paper.push_quotes(vec![reference()]);
        assert_eq!(paper.fetch_quotes().await.unwrap().len(), 1);
        assert!(paper.fetch_quotes().await.unwrap().is_empty());

        let sell = OrderRequest::sell_market(Venue::Kalshi, "KX-1", Side::No, dec!(3));
        assert_eq!(paper.place_order(&sell).await.unwrap().avg_fill_price, Some(dec!(0.57)));
    }
}
