use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use dashmap::{DashMap, DashSet};
use log::{error, info, warn};
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::gateway::{with_deadline, GatewayError, ModifyOrderParams, OrderGateway, PlaceOrderParams};
use crate::journal::{Journal, JournalError};
use crate::market_clock::{sleep_or_shutdown, wait_until, Clock, MarketHours, Shutdown};
use crate::models::{ExitReason, Order, OrderType, Trade, TradeState};
use crate::strategy::{DisableReason, GateContext, Strategy, TradeDecision};
use crate::strategy_utils::is_tighter_stop;
use crate::ticker::{Tick, TickSource};

pub const TICK_QUEUE_CAPACITY: usize = 10_000;
const TICK_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub reconcile_interval: Duration,
    pub broker_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            broker_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub active: usize,
    pub orders_updated: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Copy)]
enum OrderSlot {
    Entry,
    StopLoss,
    Target,
}

impl OrderSlot {
    fn label(self) -> &'static str {
        match self {
            OrderSlot::Entry => "entry",
            OrderSlot::StopLoss => "SL",
            OrderSlot::Target => "target",
        }
    }

    fn get(self, trade: &Trade) -> Option<&Order> {
        match self {
            OrderSlot::Entry => trade.entry_order.as_ref(),
            OrderSlot::StopLoss => trade.sl_order.as_ref(),
            OrderSlot::Target => trade.target_order.as_ref(),
        }
    }

    fn set(self, trade: &mut Trade, order: Order) {
        match self {
            OrderSlot::Entry => trade.entry_order = Some(order),
            OrderSlot::StopLoss => trade.sl_order = Some(order),
            OrderSlot::Target => trade.target_order = Some(order),
        }
    }
}

/// Owns every trade of the session and drives it from CREATED to a terminal
/// state against the broker.
pub struct TradeManager {
    gateway: Arc<dyn OrderGateway>,
    ticker: Arc<dyn TickSource>,
    journal: Journal,
    clock: Arc<dyn Clock>,
    market: MarketHours,
    settings: ManagerSettings,
    trades: Mutex<Vec<Trade>>,
    subscribed: Arc<DashSet<String>>,
    strategies: RwLock<Vec<Arc<dyn Strategy>>>,
    last_prices: DashMap<String, f64>,
}

impl TradeManager {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        ticker: Arc<dyn TickSource>,
        journal: Journal,
        clock: Arc<dyn Clock>,
        market: MarketHours,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            gateway,
            ticker,
            journal,
            clock,
            market,
            settings,
            trades: Mutex::new(Vec::new()),
            subscribed: Arc::new(DashSet::new()),
            strategies: RwLock::new(Vec::new()),
            last_prices: DashMap::new(),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn market_hours(&self) -> &MarketHours {
        &self.market
    }

    pub fn register_strategy(&self, strategy: Arc<dyn Strategy>) {
        let Ok(mut strategies) = self.strategies.write() else {
            error!("Strategy registry is poisoned; {} not registered", strategy.name());
            return;
        };
        match strategies.iter_mut().find(|s| s.name() == strategy.name()) {
            Some(existing) => {
                warn!("Strategy {} registered again, replacing it", strategy.name());
                *existing = strategy;
            }
            None => {
                info!("Registered strategy {}", strategy.name());
                strategies.push(strategy);
            }
        }
    }

    pub fn strategy(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.strategies
            .read()
            .ok()?
            .iter()
            .find(|strategy| strategy.name() == name)
            .cloned()
    }

    fn strategies_snapshot(&self) -> Vec<Arc<dyn Strategy>> {
        self.strategies
            .read()
            .map(|strategies| strategies.clone())
            .unwrap_or_default()
    }

    /// Adds a trade unless an equivalent one already exists. Returns whether it was added.
    pub async fn add_new_trade(&self, trade: Trade) -> bool {
        let mut trades = self.trades.lock().await;
        if let Some(existing) = trades.iter().find(|existing| existing.is_duplicate_of(&trade)) {
            info!(
                "Trade for {} by {} already exists as {}, ignoring duplicate",
                trade.trading_symbol, trade.strategy, existing.trade_id
            );
            return false;
        }

        info!(
            "New trade {} added: {} {} x{} @ {} (SL {}, target {}) by {}",
            trade.trade_id,
            trade.direction.as_str(),
            trade.trading_symbol,
            trade.qty,
            trade.requested_entry,
            trade.stop_loss,
            trade.target,
            trade.strategy
        );
        let symbol = trade.trading_symbol.clone();
        trades.push(trade);
        drop(trades);

        self.ensure_subscribed(symbol);
        true
    }

    fn ensure_subscribed(&self, symbol: String) {
        if self.subscribed.insert(symbol.clone()) {
            self.ticker.subscribe(&[symbol]);
        }
    }

    pub async fn disable_trade(&self, trade_id: &str, reason: DisableReason) -> bool {
        let now = self.clock.now();
        let mut trades = self.trades.lock().await;
        match trades.iter_mut().find(|trade| trade.trade_id == trade_id) {
            Some(trade) => disable_in_place(trade, reason, now),
            None => {
                warn!("Cannot disable unknown trade {}", trade_id);
                false
            }
        }
    }

    pub async fn number_of_trades_placed_by_strategy(&self, strategy: &str) -> usize {
        let trades = self.trades.lock().await;
        count_placed(&trades, strategy)
    }

    pub async fn trades_by_strategy(&self, strategy: &str) -> Vec<Trade> {
        let trades = self.trades.lock().await;
        trades
            .iter()
            .filter(|trade| trade.strategy == strategy)
            .cloned()
            .collect()
    }

    pub async fn all_trades(&self) -> Vec<Trade> {
        self.trades.lock().await.clone()
    }

    pub async fn trade(&self, trade_id: &str) -> Option<Trade> {
        let trades = self.trades.lock().await;
        trades.iter().find(|trade| trade.trade_id == trade_id).cloned()
    }

    pub fn last_traded_price(&self, symbol: &str) -> Option<f64> {
        self.last_prices.get(symbol).map(|price| *price.value())
    }

    /// Gates and places the oldest waiting trade of each strategy for the tick's symbol.
    pub async fn on_tick(&self, tick: &Tick) {
        if tick.last_price > 0.0 {
            self.last_prices.insert(tick.symbol.clone(), tick.last_price);
        }

        let strategies = self.strategies_snapshot();
        if strategies.is_empty() {
            return;
        }

        let now = self.clock.now();
        let mut trades = self.trades.lock().await;
        for strategy in strategies {
            let name = strategy.name();
            let Some(index) = trades.iter().position(|trade| {
                trade.trade_state == TradeState::Created
                    && trade.trading_symbol == tick.symbol
                    && trade.strategy == name
            }) else {
                continue;
            };

            let ctx = GateContext {
                now,
                stop_timestamp: self.market.at_time_of_day(now, strategy.config().stop_time),
                trades_placed: count_placed(&trades, name),
            };
            match strategy.should_place_trade(&trades[index], tick, &ctx) {
                TradeDecision::Wait => {}
                TradeDecision::Disable(reason) => {
                    disable_in_place(&mut trades[index], reason, now);
                }
                TradeDecision::Place => {
                    let _ = self.execute_trade(&mut trades[index], now).await;
                }
            }
        }
    }

    async fn execute_trade(&self, trade: &mut Trade, now: DateTime<Utc>) -> Result<(), GatewayError> {
        let order_type = if trade.place_market_order {
            OrderType::Market
        } else {
            OrderType::Limit
        };
        let params = PlaceOrderParams {
            symbol: trade.trading_symbol.clone(),
            exchange: trade.exchange.clone(),
            is_derivative: trade.is_derivative(),
            direction: trade.direction,
            product_type: trade.product_type,
            order_type,
            qty: trade.qty,
            price: if order_type == OrderType::Market {
                0.0
            } else {
                trade.requested_entry
            },
            trigger_price: 0.0,
        };

        match self.call(self.gateway.place_order(&params)).await {
            Ok(order) => {
                info!(
                    "Entry order {} placed for trade {} ({} {} x{} @ {})",
                    order.order_id,
                    trade.trade_id,
                    trade.direction.as_str(),
                    trade.trading_symbol,
                    trade.qty,
                    trade.requested_entry
                );
                trade.entry_order = Some(order);
                trade.set_state(TradeState::Active, now);
                trade.set_start_timestamp(now);
                Ok(())
            }
            Err(err) => {
                error!(
                    "Entry order for trade {} ({}) failed on {}: {}",
                    trade.trade_id,
                    trade.trading_symbol,
                    self.gateway.name(),
                    err
                );
                Err(err)
            }
        }
    }

    /// One reconciliation cycle: refresh every working order from the broker,
    /// advance each ACTIVE trade, then persist the day's journal.
    pub async fn reconcile_once(&self) -> Result<ReconcileSummary, GatewayError> {
        let now = self.clock.now();
        let mut summary = ReconcileSummary::default();

        let snapshot = {
            // held for the whole cycle; ticks and new trades wait behind at most
            // one broker call per order step, each bounded by the broker timeout
            let mut trades = self.trades.lock().await;

            {
                let mut orders: Vec<&mut Order> = trades
                    .iter_mut()
                    .filter(|trade| trade.trade_state == TradeState::Active)
                    .flat_map(|trade| trade.orders_mut())
                    .collect();
                if !orders.is_empty() {
                    match self
                        .call(self.gateway.fetch_and_update_all_order_details(&mut orders))
                        .await
                    {
                        Ok(updated) => summary.orders_updated = updated,
                        Err(err) => {
                            error!(
                                "Order book refresh from {} failed, skipping this cycle: {}",
                                self.gateway.name(),
                                err
                            );
                            return Err(err);
                        }
                    }
                }
            }

            for trade in trades
                .iter_mut()
                .filter(|trade| trade.trade_state == TradeState::Active)
            {
                summary.active += 1;
                summary.failures += self.track_trade(trade, now).await;
                match trade.trade_state {
                    TradeState::Completed => summary.completed += 1,
                    TradeState::Cancelled => summary.cancelled += 1,
                    _ => {}
                }
            }

            trades.clone()
        };

        self.save_snapshot(&snapshot).await;
        Ok(summary)
    }

    /// Runs reconciliation on a fixed interval from market open until close or shutdown.
    pub async fn reconcile_loop(self: Arc<Self>, mut shutdown: Shutdown) {
        let now = self.clock.now();
        if self.market.is_market_closed_for_the_day(now) {
            warn!("Market is closed for the day, reconciliation not started");
            return;
        }
        let open = self.market.open_at(now);
        if now < open {
            info!("Reconciliation waiting for market open at {}", open);
            if wait_until(self.clock.as_ref(), open, &mut shutdown).await {
                self.persist().await;
                return;
            }
        }

        info!(
            "Reconciliation started (every {:?})",
            self.settings.reconcile_interval
        );
        loop {
            if self.market.is_market_closed_for_the_day(self.clock.now()) {
                info!("Market closed, running final reconciliation");
                let _ = self.reconcile_once().await;
                break;
            }
            match self.reconcile_once().await {
                Ok(summary) if summary.active > 0 => info!(
                    "Reconciled {} active trades ({} orders updated, {} completed, {} cancelled, {} failures)",
                    summary.active,
                    summary.orders_updated,
                    summary.completed,
                    summary.cancelled,
                    summary.failures
                ),
                Ok(_) | Err(_) => {}
            }
            if sleep_or_shutdown(self.settings.reconcile_interval, &mut shutdown).await {
                break;
            }
        }
        self.persist().await;
        info!("Reconciliation stopped");
    }

    pub async fn persist(&self) {
        let snapshot = self.all_trades().await;
        self.save_snapshot(&snapshot).await;
    }

    async fn save_snapshot(&self, trades: &[Trade]) {
        let date = self.market.local_date(self.clock.now());
        if let Err(err) = self.journal.save(date, trades).await {
            error!("Failed to persist {} trades: {}", trades.len(), err);
        }
    }

    /// Loads today's journal after a restart and resubscribes every symbol.
    pub async fn load_journal(&self) -> Result<usize, JournalError> {
        let date = self.market.local_date(self.clock.now());
        let loaded = self.journal.load(date).await?;

        let mut symbols = Vec::new();
        let mut added = 0;
        {
            let mut trades = self.trades.lock().await;
            for trade in loaded {
                if trades.iter().any(|existing| existing.trade_id == trade.trade_id) {
                    continue;
                }
                symbols.push(trade.trading_symbol.clone());
                trades.push(trade);
                added += 1;
            }
        }
        for symbol in symbols {
            self.ensure_subscribed(symbol);
        }

        info!(
            "Loaded {} trades from {}",
            added,
            self.journal.path_for(date).display()
        );
        Ok(added)
    }

    /// Hooks the manager into the tick source. Ticks are queued without blocking
    /// the source; `run_tick_pump` drains the queue.
    pub fn attach_to_ticker(&self) -> Receiver<Tick> {
        let (sender, receiver) = crossbeam_channel::bounded(TICK_QUEUE_CAPACITY);
        self.ticker.register_tick_listener(Box::new(move |tick| {
            sender
                .try_send(tick.clone())
                .map_err(|err| anyhow!("tick queue rejected {}: {}", tick.symbol, err))
        }));

        let ticker = Arc::downgrade(&self.ticker);
        let subscribed = Arc::clone(&self.subscribed);
        self.ticker.register_connection_listener(Box::new(move || {
            let Some(ticker) = ticker.upgrade() else {
                return;
            };
            let symbols: Vec<String> = subscribed.iter().map(|symbol| symbol.key().clone()).collect();
            if !symbols.is_empty() {
                info!("Tick source connected, resubscribing {} symbols", symbols.len());
                ticker.subscribe(&symbols);
            }
        }));

        receiver
    }

    /// Processes queued ticks one at a time until shutdown.
    pub async fn run_tick_pump(self: Arc<Self>, ticks: Receiver<Tick>, shutdown: Shutdown) -> Result<()> {
        let runtime = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || loop {
            if *shutdown.borrow() {
                break;
            }
            match ticks.recv_timeout(TICK_POLL_INTERVAL) {
                Ok(tick) => runtime.block_on(self.on_tick(&tick)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .await
        .context("tick pump task failed")?;
        info!("Tick pump stopped");
        Ok(())
    }

    async fn call<T, F>(&self, call: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        with_deadline(self.settings.broker_timeout, call).await
    }

    /// Advances one ACTIVE trade: entry, then SL, then target, then square-off.
    /// Returns the number of broker failures; each is logged and retried next cycle.
    async fn track_trade(&self, trade: &mut Trade, now: DateTime<Utc>) -> usize {
        let mut failures = 0;

        self.track_entry(trade, now);
        if trade.trade_state != TradeState::Active {
            return failures;
        }

        if self.track_stop_loss(trade, now).await.is_err() {
            failures += 1;
        }
        if trade.trade_state != TradeState::Active {
            return failures;
        }

        if self.track_target(trade, now).await.is_err() {
            failures += 1;
        }
        if trade.trade_state != TradeState::Active {
            return failures;
        }

        if self.check_square_off(trade, now).await.is_err() {
            failures += 1;
        }
        failures
    }

    fn track_entry(&self, trade: &mut Trade, now: DateTime<Utc>) {
        let Some(entry) = trade.entry_order.clone() else {
            error!("Active trade {} ({}) has no entry order", trade.trade_id, trade.trading_symbol);
            return;
        };

        if entry.is_dead() && trade.exit_reason.is_none() {
            warn!(
                "Entry order {} of trade {} ({}) ended {:?} without a fill: {}",
                entry.order_id,
                trade.trade_id,
                trade.trading_symbol,
                entry.order_status,
                entry.message.as_deref().unwrap_or("no message")
            );
            trade.cancel(ExitReason::EntryCancelled, now);
            return;
        }

        apply_entry_fill(trade, &entry, now);
        let cmp = self
            .last_traded_price(&trade.trading_symbol)
            .unwrap_or(trade.cmp);
        trade.mark_to_market(cmp);
    }

    async fn track_stop_loss(&self, trade: &mut Trade, now: DateTime<Utc>) -> Result<(), GatewayError> {
        if is_squaring_off(trade) || trade.filled_qty == 0 {
            return Ok(());
        }

        match trade.sl_order.clone() {
            None => {
                if trade.stop_loss <= 0.0 {
                    return Ok(());
                }
                let order = self
                    .place_exit_order(trade, OrderType::SlMarket, 0.0, trade.stop_loss, OrderSlot::StopLoss)
                    .await?;
                trade.sl_order = Some(order);
                Ok(())
            }
            Some(order) if order.is_complete() => {
                self.settle_entry_before_exit(trade).await?;
                self.cancel_if_open(trade, OrderSlot::Target).await?;
                let exit = if order.average_price > 0.0 {
                    order.average_price
                } else {
                    trade.stop_loss
                };
                trade.complete(exit, ExitReason::SlHit, now);
                info!(
                    "Trade {} ({}) stopped out at {}, pnl {}",
                    trade.trade_id, trade.trading_symbol, exit, trade.pnl
                );
                Ok(())
            }
            Some(order) if order.is_dead() => {
                error!(
                    "SL order {} of trade {} ({}) was {:?} outside the engine: {}",
                    order.order_id,
                    trade.trade_id,
                    trade.trading_symbol,
                    order.order_status,
                    order.message.as_deref().unwrap_or("no message")
                );
                self.settle_entry_before_exit(trade).await?;
                self.cancel_if_open(trade, OrderSlot::Target).await?;
                trade.complete(trade.cmp, ExitReason::SlCancelled, now);
                Ok(())
            }
            Some(order) => {
                if order.qty < trade.filled_qty {
                    self.resize_exit_order(trade, &order, OrderSlot::StopLoss).await?;
                }
                self.trail_stop_loss(trade, now).await
            }
        }
    }

    async fn trail_stop_loss(&self, trade: &mut Trade, now: DateTime<Utc>) -> Result<(), GatewayError> {
        let Some(strategy) = self.strategy(&trade.strategy) else {
            return Ok(());
        };
        let Some(order) = trade.sl_order.clone().filter(|order| order.is_open()) else {
            return Ok(());
        };
        let candidate = strategy.trailing_stop_loss(trade, trade.cmp);
        if !is_tighter_stop(trade.direction, trade.stop_loss, candidate) {
            return Ok(());
        }

        let params = ModifyOrderParams {
            new_trigger_price: Some(candidate),
            ..ModifyOrderParams::default()
        };
        match self.call(self.gateway.modify_order(&order, &params)).await {
            Ok(updated) => {
                info!(
                    "Trailed SL of trade {} ({}) from {} to {}",
                    trade.trade_id, trade.trading_symbol, trade.stop_loss, candidate
                );
                trade.sl_order = Some(updated);
                trade.set_stop_loss(candidate, now);
                Ok(())
            }
            Err(err) => {
                error!(
                    "Failed to trail SL order {} of trade {} ({}) to {}: {}",
                    order.order_id, trade.trade_id, trade.trading_symbol, candidate, err
                );
                Err(err)
            }
        }
    }

    async fn track_target(&self, trade: &mut Trade, now: DateTime<Utc>) -> Result<(), GatewayError> {
        if trade.filled_qty == 0 {
            return Ok(());
        }
        let squaring_off = is_squaring_off(trade);

        match trade.target_order.clone() {
            None => {
                if squaring_off || trade.target <= 0.0 {
                    return Ok(());
                }
                let order = self
                    .place_exit_order(trade, OrderType::Limit, trade.target, 0.0, OrderSlot::Target)
                    .await?;
                trade.target_order = Some(order);
                Ok(())
            }
            Some(order) if order.is_complete() => {
                self.settle_entry_before_exit(trade).await?;
                self.cancel_if_open(trade, OrderSlot::StopLoss).await?;
                let exit = if order.average_price > 0.0 {
                    order.average_price
                } else if order.price > 0.0 {
                    order.price
                } else {
                    trade.cmp
                };
                let reason = if squaring_off {
                    ExitReason::SquareOff
                } else {
                    ExitReason::TargetHit
                };
                trade.complete(exit, reason, now);
                info!(
                    "Trade {} ({}) exited at {} ({}), pnl {}",
                    trade.trade_id,
                    trade.trading_symbol,
                    exit,
                    reason.as_str(),
                    trade.pnl
                );
                Ok(())
            }
            Some(order) if order.is_dead() => {
                if squaring_off {
                    // the square-off step sends a fresh market exit
                    return Ok(());
                }
                error!(
                    "Target order {} of trade {} ({}) was {:?} outside the engine: {}",
                    order.order_id,
                    trade.trade_id,
                    trade.trading_symbol,
                    order.order_status,
                    order.message.as_deref().unwrap_or("no message")
                );
                self.settle_entry_before_exit(trade).await?;
                self.cancel_if_open(trade, OrderSlot::StopLoss).await?;
                trade.complete(trade.cmp, ExitReason::TargetCancelled, now);
                Ok(())
            }
            Some(order) => {
                if order.qty < trade.filled_qty && order.order_type != OrderType::Market {
                    self.resize_exit_order(trade, &order, OrderSlot::Target).await?;
                }
                Ok(())
            }
        }
    }

    async fn check_square_off(&self, trade: &mut Trade, now: DateTime<Utc>) -> Result<(), GatewayError> {
        let Some(square_off_at) = trade.intraday_square_off_timestamp else {
            return Ok(());
        };
        if now < square_off_at {
            return Ok(());
        }

        if !is_squaring_off(trade) {
            info!(
                "Square-off time reached for trade {} ({}), exiting at market",
                trade.trade_id, trade.trading_symbol
            );
            if let Some(cancelled) = self.cancel_entry_remainder(trade).await? {
                apply_entry_fill(trade, &cancelled, now);
            }
            if trade.filled_qty == 0 {
                trade.cancel(ExitReason::SquareOff, now);
                info!(
                    "Trade {} ({}) cancelled at square-off with nothing filled",
                    trade.trade_id, trade.trading_symbol
                );
                return Ok(());
            }
            self.cancel_if_open(trade, OrderSlot::StopLoss).await?;
            trade.set_exit_reason(Some(ExitReason::SquareOff), now);
        }

        match trade.target_order.clone() {
            Some(order) if order.is_open() && order.order_type != OrderType::Market => {
                match self.call(self.gateway.modify_order_to_market(&order)).await {
                    Ok(updated) => {
                        info!(
                            "Converted target order {} of trade {} ({}) to market",
                            order.order_id, trade.trade_id, trade.trading_symbol
                        );
                        trade.target_order = Some(updated);
                        Ok(())
                    }
                    Err(err) => {
                        error!(
                            "Failed to convert target order {} of trade {} ({}) to market: {}",
                            order.order_id, trade.trade_id, trade.trading_symbol, err
                        );
                        Err(err)
                    }
                }
            }
            Some(order) if order.is_open() || order.is_complete() => Ok(()),
            _ => {
                let order = self
                    .place_exit_order(trade, OrderType::Market, 0.0, 0.0, OrderSlot::Target)
                    .await?;
                trade.target_order = Some(order);
                Ok(())
            }
        }
    }

    async fn place_exit_order(
        &self,
        trade: &Trade,
        order_type: OrderType,
        price: f64,
        trigger_price: f64,
        slot: OrderSlot,
    ) -> Result<Order, GatewayError> {
        let params = PlaceOrderParams {
            symbol: trade.trading_symbol.clone(),
            exchange: trade.exchange.clone(),
            is_derivative: trade.is_derivative(),
            direction: trade.direction.opposite(),
            product_type: trade.product_type,
            order_type,
            qty: trade.filled_qty,
            price,
            trigger_price,
        };
        match self.call(self.gateway.place_order(&params)).await {
            Ok(order) => {
                info!(
                    "Placed {} order {} for trade {} ({} {} x{} price {} trigger {})",
                    slot.label(),
                    order.order_id,
                    trade.trade_id,
                    params.direction.as_str(),
                    trade.trading_symbol,
                    params.qty,
                    price,
                    trigger_price
                );
                Ok(order)
            }
            Err(err) => {
                error!(
                    "Failed to place {} order for trade {} ({}): {}",
                    slot.label(),
                    trade.trade_id,
                    trade.trading_symbol,
                    err
                );
                Err(err)
            }
        }
    }

    async fn resize_exit_order(
        &self,
        trade: &mut Trade,
        order: &Order,
        slot: OrderSlot,
    ) -> Result<(), GatewayError> {
        let params = ModifyOrderParams {
            new_qty: Some(trade.filled_qty),
            ..ModifyOrderParams::default()
        };
        match self.call(self.gateway.modify_order(order, &params)).await {
            Ok(updated) => {
                slot.set(trade, updated);
                Ok(())
            }
            Err(err) => {
                error!(
                    "Failed to resize {} order {} of trade {} ({}) to {}: {}",
                    slot.label(),
                    order.order_id,
                    trade.trade_id,
                    trade.trading_symbol,
                    trade.filled_qty,
                    err
                );
                Err(err)
            }
        }
    }

    /// Cancels the unfilled part of a still-working entry order.
    async fn cancel_entry_remainder(&self, trade: &mut Trade) -> Result<Option<Order>, GatewayError> {
        let Some(entry) = trade.entry_order.clone().filter(|order| order.is_open()) else {
            return Ok(None);
        };
        let cancelled = self.cancel_order(trade, &entry, OrderSlot::Entry).await?;
        trade.entry_order = Some(cancelled.clone());
        Ok(Some(cancelled))
    }

    /// Runs before any exit completes the trade.
    async fn settle_entry_before_exit(&self, trade: &mut Trade) -> Result<(), GatewayError> {
        let Some(cancelled) = self.cancel_entry_remainder(trade).await? else {
            return Ok(());
        };
        if cancelled.filled_qty > trade.filled_qty {
            warn!(
                "Entry order {} of trade {} ({}) filled {} before it was cancelled, exit covered {}",
                cancelled.order_id,
                trade.trade_id,
                trade.trading_symbol,
                cancelled.filled_qty,
                trade.filled_qty
            );
        }
        Ok(())
    }

    async fn cancel_if_open(&self, trade: &mut Trade, slot: OrderSlot) -> Result<(), GatewayError> {
        let Some(order) = slot.get(trade).filter(|order| order.is_open()).cloned() else {
            return Ok(());
        };
        let cancelled = self.cancel_order(trade, &order, slot).await?;
        slot.set(trade, cancelled);
        Ok(())
    }

    async fn cancel_order(
        &self,
        trade: &Trade,
        order: &Order,
        slot: OrderSlot,
    ) -> Result<Order, GatewayError> {
        match self.call(self.gateway.cancel_order(order)).await {
            Ok(cancelled) => {
                info!(
                    "Cancelled {} order {} of trade {} ({})",
                    slot.label(),
                    order.order_id,
                    trade.trade_id,
                    trade.trading_symbol
                );
                Ok(cancelled)
            }
            Err(err) => {
                error!(
                    "Failed to cancel {} order {} of trade {} ({}): {}",
                    slot.label(),
                    order.order_id,
                    trade.trade_id,
                    trade.trading_symbol,
                    err
                );
                Err(err)
            }
        }
    }
}

fn is_squaring_off(trade: &Trade) -> bool {
    trade.exit_reason == Some(ExitReason::SquareOff)
}

fn apply_entry_fill(trade: &mut Trade, entry: &Order, now: DateTime<Utc>) {
    if entry.filled_qty == 0 {
        return;
    }
    if entry.filled_qty != trade.filled_qty {
        trade.set_filled_qty(entry.filled_qty, now);
    }
    let price = if entry.average_price > 0.0 {
        entry.average_price
    } else {
        trade.requested_entry
    };
    if price > 0.0 && price != trade.entry {
        trade.set_entry(price, now);
    }
}

fn count_placed(trades: &[Trade], strategy: &str) -> usize {
    trades
        .iter()
        .filter(|trade| trade.strategy == strategy)
        .filter(|trade| !matches!(trade.trade_state, TradeState::Created | TradeState::Disabled))
        .count()
}

fn disable_in_place(trade: &mut Trade, reason: DisableReason, now: DateTime<Utc>) -> bool {
    if trade.trade_state != TradeState::Created {
        warn!(
            "Trade {} ({}) is {} and cannot be disabled",
            trade.trade_id,
            trade.trading_symbol,
            trade.trade_state.as_str()
        );
        return false;
    }
    let changed = trade.set_state(TradeState::Disabled, now);
    if changed {
        trade.record_change("disableReason", &None::<&str>, &Some(reason.as_str()), now);
        warn!(
            "Trade {} ({}) of {} disabled: {}",
            trade.trade_id,
            trade.trading_symbol,
            trade.strategy,
            reason.as_str()
        );
    }
    changed
}
