use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::models::{Direction, Order, OrderStatus, OrderType, ProductType};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{broker} rejected the request: {reason}")]
    Rejected { broker: String, reason: String },
    #[error("{broker} request failed: {reason}")]
    Transport { broker: String, reason: String },
    #[error("{broker} returned an unexpected response: {reason}")]
    InvalidResponse { broker: String, reason: String },
    #[error("broker call did not finish within {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    pub fn rejected(broker: &str, reason: impl Into<String>) -> Self {
        Self::Rejected {
            broker: broker.to_string(),
            reason: reason.into(),
        }
    }

    pub fn transport(broker: &str, reason: impl Into<String>) -> Self {
        Self::Transport {
            broker: broker.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_response(broker: &str, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            broker: broker.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceOrderParams {
    pub symbol: String,
    pub exchange: String,
    pub is_derivative: bool,
    pub direction: Direction,
    pub product_type: ProductType,
    pub order_type: OrderType,
    pub qty: u32,
    pub price: f64,
    pub trigger_price: f64,
}

/// Fields left as `None` (or zero) keep their current broker-side value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModifyOrderParams {
    pub new_price: Option<f64>,
    pub new_trigger_price: Option<f64>,
    pub new_qty: Option<u32>,
    pub new_order_type: Option<OrderType>,
}

impl ModifyOrderParams {
    pub fn price(&self) -> Option<f64> {
        self.new_price.filter(|value| *value > 0.0)
    }

    pub fn trigger_price(&self) -> Option<f64> {
        self.new_trigger_price.filter(|value| *value > 0.0)
    }

    pub fn qty(&self) -> Option<u32> {
        self.new_qty.filter(|value| *value > 0)
    }
}

#[async_trait]
pub trait OrderGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn place_order(&self, params: &PlaceOrderParams) -> Result<Order, GatewayError>;

    async fn modify_order(
        &self,
        order: &Order,
        params: &ModifyOrderParams,
    ) -> Result<Order, GatewayError>;

    async fn modify_order_to_market(&self, order: &Order) -> Result<Order, GatewayError>;

    async fn cancel_order(&self, order: &Order) -> Result<Order, GatewayError>;

    /// Refreshes every passed order from the broker's order book in one round trip.
    /// Returns how many of them the broker reported on.
    async fn fetch_and_update_all_order_details(
        &self,
        orders: &mut [&mut Order],
    ) -> Result<usize, GatewayError>;
}

/// One order as the broker reports it, already in engine vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerOrderUpdate {
    pub order_id: String,
    pub status: OrderStatus,
    pub order_type: Option<OrderType>,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub qty: Option<u32>,
    pub filled_qty: u32,
    pub pending_qty: Option<u32>,
    pub average_price: Option<f64>,
    pub message: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Applies broker-reported details to a local order. A cancellation that already
/// filled something counts as COMPLETE for the filled part.
pub fn apply_broker_update(order: &mut Order, update: &BrokerOrderUpdate) {
    let mut status = update.status;
    if status == OrderStatus::Cancelled && update.filled_qty > 0 {
        status = OrderStatus::Complete;
    }

    order.order_status = status;
    order.filled_qty = update.filled_qty;
    if let Some(qty) = update.qty.filter(|qty| *qty > 0) {
        order.qty = qty;
    }
    order.pending_qty = match status {
        OrderStatus::Open => update
            .pending_qty
            .unwrap_or_else(|| order.qty.saturating_sub(update.filled_qty)),
        _ => 0,
    };
    if let Some(order_type) = update.order_type {
        order.order_type = order_type;
    }
    if let Some(price) = update.price {
        order.price = price;
    }
    if let Some(trigger_price) = update.trigger_price {
        order.trigger_price = trigger_price;
    }
    if let Some(average_price) = update.average_price.filter(|price| *price > 0.0) {
        order.average_price = average_price;
    }
    if update.message.is_some() {
        order.message = update.message.clone();
    }
    order.last_order_update_timestamp = update.updated_at.unwrap_or_else(Utc::now);
}

/// Matches a full order-book listing against the local orders by id.
pub fn update_orders_from_book(
    broker: &str,
    orders: &mut [&mut Order],
    book: &[BrokerOrderUpdate],
) -> usize {
    let mut matched = 0;
    for order in orders.iter_mut() {
        match book.iter().find(|update| update.order_id == order.order_id) {
            Some(update) => {
                apply_broker_update(order, update);
                matched += 1;
            }
            None => warn!(
                "{} order book has no entry for order {} ({})",
                broker, order.order_id, order.trading_symbol
            ),
        }
    }
    matched
}

/// Bounds a broker call so a stuck connection cannot hold the trade registry.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(deadline)),
    }
}

/// Local view of an order the broker just accepted.
pub fn new_local_order(order_id: String, params: &PlaceOrderParams, now: DateTime<Utc>) -> Order {
    Order {
        order_id,
        trading_symbol: params.symbol.clone(),
        exchange: params.exchange.clone(),
        product_type: params.product_type,
        direction: params.direction,
        order_type: params.order_type,
        order_status: OrderStatus::Open,
        price: params.price,
        trigger_price: params.trigger_price,
        qty: params.qty,
        filled_qty: 0,
        pending_qty: params.qty,
        average_price: 0.0,
        order_place_timestamp: now,
        last_order_update_timestamp: now,
        message: None,
    }
}
