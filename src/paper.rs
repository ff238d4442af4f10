use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::gateway::{
    apply_broker_update, new_local_order, update_orders_from_book, BrokerOrderUpdate,
    GatewayError, ModifyOrderParams, OrderGateway, PlaceOrderParams,
};
use crate::models::{Direction, Order, OrderStatus, OrderType};

const BROKER_NAME: &str = "paper";

#[derive(Default)]
struct PaperBook {
    next_id: u64,
    orders: Vec<Order>,
    marks: HashMap<String, f64>,
    reject_next: Option<String>,
    fail_next_fetch: Option<String>,
}

impl PaperBook {
    fn order_mut(&mut self, order_id: &str) -> Option<&mut Order> {
        self.orders.iter_mut().find(|order| order.order_id == order_id)
    }
}

/// In-memory broker that fills orders against marked prices.
#[derive(Default)]
pub struct PaperGateway {
    book: Mutex<PaperBook>,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn book(&self) -> Result<MutexGuard<'_, PaperBook>, GatewayError> {
        self.book
            .lock()
            .map_err(|_| GatewayError::transport(BROKER_NAME, "order book lock poisoned"))
    }

    /// Records a new market price and fills any working order it crosses.
    pub fn mark_price(&self, symbol: &str, price: f64) {
        if price <= 0.0 || !price.is_finite() {
            return;
        }
        let Ok(mut book) = self.book() else {
            return;
        };
        book.marks.insert(symbol.to_string(), price);
        for order in book
            .orders
            .iter_mut()
            .filter(|order| order.trading_symbol == symbol && order.is_open())
        {
            if let Some(fill_price) = crossing_fill_price(order, price) {
                let remaining = order.pending_qty;
                fill(order, remaining, fill_price);
            }
        }
    }

    pub fn orders(&self) -> Vec<Order> {
        self.book().map(|book| book.orders.clone()).unwrap_or_default()
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.book()
            .ok()?
            .orders
            .iter()
            .find(|order| order.order_id == order_id)
            .cloned()
    }

    pub fn fill_order(&self, order_id: &str, average_price: f64) -> bool {
        let Ok(mut book) = self.book() else {
            return false;
        };
        match book.order_mut(order_id).filter(|order| order.is_open()) {
            Some(order) => {
                let remaining = order.pending_qty;
                fill(order, remaining, average_price);
                true
            }
            None => false,
        }
    }

    pub fn fill_order_partially(&self, order_id: &str, qty: u32, average_price: f64) -> bool {
        let Ok(mut book) = self.book() else {
            return false;
        };
        match book.order_mut(order_id).filter(|order| order.is_open()) {
            Some(order) => {
                fill(order, qty, average_price);
                true
            }
            None => false,
        }
    }

    /// Cancels an order as if someone did it from the broker's own terminal.
    pub fn cancel_externally(&self, order_id: &str) -> bool {
        let Ok(mut book) = self.book() else {
            return false;
        };
        match book.order_mut(order_id).filter(|order| order.is_open()) {
            Some(order) => {
                close_unfilled_remainder(order, Some("cancelled outside the engine".to_string()));
                true
            }
            None => false,
        }
    }

    pub fn reject_next_placement(&self, reason: &str) {
        if let Ok(mut book) = self.book() {
            book.reject_next = Some(reason.to_string());
        }
    }

    pub fn fail_next_order_book_fetch(&self, reason: &str) {
        if let Ok(mut book) = self.book() {
            book.fail_next_fetch = Some(reason.to_string());
        }
    }
}

fn crossing_fill_price(order: &Order, mark: f64) -> Option<f64> {
    let buying = order.direction == Direction::Long;
    match order.order_type {
        OrderType::Market => Some(mark),
        OrderType::Limit => {
            let crossed = if buying { mark <= order.price } else { mark >= order.price };
            crossed.then_some(order.price)
        }
        OrderType::SlMarket => {
            let triggered = stop_triggered(buying, order.trigger_price, mark);
            triggered.then_some(mark)
        }
        OrderType::SlLimit => {
            let triggered = stop_triggered(buying, order.trigger_price, mark);
            let marketable = if buying { mark <= order.price } else { mark >= order.price };
            (triggered && marketable).then_some(order.price)
        }
    }
}

fn stop_triggered(buying: bool, trigger: f64, mark: f64) -> bool {
    trigger > 0.0 && if buying { mark >= trigger } else { mark <= trigger }
}

fn fill(order: &mut Order, qty: u32, price: f64) {
    let qty = qty.min(order.pending_qty);
    if qty == 0 {
        return;
    }
    let filled_before = order.filled_qty as f64;
    let total = filled_before + qty as f64;
    order.average_price = (order.average_price * filled_before + price * qty as f64) / total;
    order.filled_qty += qty;
    order.pending_qty -= qty;
    if order.pending_qty == 0 {
        order.order_status = OrderStatus::Complete;
    }
    order.last_order_update_timestamp = Utc::now();
}

fn close_unfilled_remainder(order: &mut Order, message: Option<String>) {
    order.pending_qty = 0;
    order.order_status = if order.filled_qty > 0 {
        OrderStatus::Complete
    } else {
        OrderStatus::Cancelled
    };
    order.message = message;
    order.last_order_update_timestamp = Utc::now();
}

fn to_update(order: &Order) -> BrokerOrderUpdate {
    BrokerOrderUpdate {
        order_id: order.order_id.clone(),
        status: order.order_status,
        order_type: Some(order.order_type),
        price: Some(order.price),
        trigger_price: Some(order.trigger_price),
        qty: Some(order.qty),
        filled_qty: order.filled_qty,
        pending_qty: Some(order.pending_qty),
        average_price: Some(order.average_price),
        message: order.message.clone(),
        updated_at: Some(order.last_order_update_timestamp),
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    fn name(&self) -> &str {
        BROKER_NAME
    }

    async fn place_order(&self, params: &PlaceOrderParams) -> Result<Order, GatewayError> {
        let mut book = self.book()?;
        if let Some(reason) = book.reject_next.take() {
            warn!("Paper broker rejecting {} order: {}", params.symbol, reason);
            return Err(GatewayError::rejected(BROKER_NAME, reason));
        }
        if params.qty == 0 {
            return Err(GatewayError::rejected(BROKER_NAME, "quantity must be positive"));
        }

        book.next_id += 1;
        let order_id = format!("PAPER-{}", book.next_id);
        let local = new_local_order(order_id, params, Utc::now());
        let mut working = local.clone();
        if let Some(mark) = book.marks.get(&params.symbol).copied() {
            if let Some(fill_price) = crossing_fill_price(&working, mark) {
                let qty = working.pending_qty;
                fill(&mut working, qty, fill_price);
            }
        }
        info!(
            "Paper order {} accepted: {} {} {} x{}",
            working.order_id,
            params.direction.as_str(),
            params.order_type.as_str(),
            params.symbol,
            params.qty
        );
        book.orders.push(working);
        Ok(local)
    }

    async fn modify_order(
        &self,
        order: &Order,
        params: &ModifyOrderParams,
    ) -> Result<Order, GatewayError> {
        let mut book = self.book()?;
        let mark = book.marks.get(&order.trading_symbol).copied();
        let working = book
            .order_mut(&order.order_id)
            .ok_or_else(|| GatewayError::rejected(BROKER_NAME, format!("unknown order {}", order.order_id)))?;
        if !working.is_open() {
            return Err(GatewayError::rejected(
                BROKER_NAME,
                format!("order {} is no longer open", order.order_id),
            ));
        }

        if let Some(price) = params.price() {
            working.price = price;
        }
        if let Some(trigger_price) = params.trigger_price() {
            working.trigger_price = trigger_price;
        }
        if let Some(qty) = params.qty() {
            working.qty = qty.max(working.filled_qty);
            working.pending_qty = working.qty - working.filled_qty;
        }
        if let Some(order_type) = params.new_order_type {
            working.order_type = order_type;
        }
        working.last_order_update_timestamp = Utc::now();

        let mut local = order.clone();
        local.price = working.price;
        local.trigger_price = working.trigger_price;
        local.qty = working.qty;
        local.order_type = working.order_type;
        local.last_order_update_timestamp = working.last_order_update_timestamp;

        if let Some(mark) = mark {
            if let Some(fill_price) = crossing_fill_price(working, mark) {
                let qty = working.pending_qty;
                fill(working, qty, fill_price);
            }
        }
        Ok(local)
    }

    async fn modify_order_to_market(&self, order: &Order) -> Result<Order, GatewayError> {
        let params = ModifyOrderParams {
            new_order_type: Some(OrderType::Market),
            ..ModifyOrderParams::default()
        };
        self.modify_order(order, &params).await
    }

    async fn cancel_order(&self, order: &Order) -> Result<Order, GatewayError> {
        let mut book = self.book()?;
        let working = book
            .order_mut(&order.order_id)
            .ok_or_else(|| GatewayError::rejected(BROKER_NAME, format!("unknown order {}", order.order_id)))?;
        if !working.is_open() {
            return Err(GatewayError::rejected(
                BROKER_NAME,
                format!("order {} is no longer open", order.order_id),
            ));
        }
        close_unfilled_remainder(working, None);

        let mut local = order.clone();
        apply_broker_update(&mut local, &to_update(working));
        Ok(local)
    }

    async fn fetch_and_update_all_order_details(
        &self,
        orders: &mut [&mut Order],
    ) -> Result<usize, GatewayError> {
        let book = {
            let mut book = self.book()?;
            if let Some(reason) = book.fail_next_fetch.take() {
                return Err(GatewayError::transport(BROKER_NAME, reason));
            }
            book.orders.iter().map(to_update).collect::<Vec<_>>()
        };
        Ok(update_orders_from_book(BROKER_NAME, orders, &book))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProductType;

    fn params(direction: Direction, order_type: OrderType, price: f64, trigger: f64) -> PlaceOrderParams {
        PlaceOrderParams {
            symbol: "SBIN".to_string(),
            exchange: "NSE".to_string(),
            is_derivative: false,
            direction,
            product_type: ProductType::Mis,
            order_type,
            qty: 10,
            price,
            trigger_price: trigger,
        }
    }

    #[tokio::test]
    async fn market_orders_fill_at_the_mark() {
        let paper = PaperGateway::new();
        paper.mark_price("SBIN", 501.0);
        let order = paper
            .place_order(&params(Direction::Long, OrderType::Market, 0.0, 0.0))
            .await
            .unwrap();
        assert!(order.is_open());

        let broker_side = paper.order(&order.order_id).unwrap();
        assert!(broker_side.is_complete());
        assert_eq!(broker_side.average_price, 501.0);
    }

    #[tokio::test]
    async fn stop_orders_trigger_on_crossing() {
        let paper = PaperGateway::new();
        let order = paper
            .place_order(&params(Direction::Short, OrderType::SlMarket, 0.0, 495.0))
            .await
            .unwrap();
        paper.mark_price("SBIN", 496.0);
        assert!(paper.order(&order.order_id).unwrap().is_open());
        paper.mark_price("SBIN", 494.8);
        let filled = paper.order(&order.order_id).unwrap();
        assert!(filled.is_complete());
        assert_eq!(filled.average_price, 494.8);
    }

    #[tokio::test]
    async fn fetch_refreshes_local_orders() {
        let paper = PaperGateway::new();
        let mut order = paper
            .place_order(&params(Direction::Long, OrderType::Limit, 500.0, 0.0))
            .await
            .unwrap();
        paper.fill_order_partially(&order.order_id, 4, 500.0);
        let updated = paper
            .fetch_and_update_all_order_details(&mut [&mut order])
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(order.filled_qty, 4);
        assert!(order.is_open());

        paper.fail_next_order_book_fetch("network down");
        assert!(paper
            .fetch_and_update_all_order_details(&mut [&mut order])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn rejected_placement_and_closed_order_cancel() {
        let paper = PaperGateway::new();
        paper.reject_next_placement("insufficient margin");
        assert!(matches!(
            paper
                .place_order(&params(Direction::Long, OrderType::Limit, 500.0, 0.0))
                .await,
            Err(GatewayError::Rejected { .. })
        ));

        let order = paper
            .place_order(&params(Direction::Long, OrderType::Limit, 500.0, 0.0))
            .await
            .unwrap();
        paper.fill_order_partially(&order.order_id, 3, 500.0);
        let cancelled = paper.cancel_order(&order).await.unwrap();
        assert!(cancelled.is_complete());
        assert_eq!(cancelled.filled_qty, 3);
        assert!(paper.cancel_order(&order).await.is_err());
    }
}
