use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use log::{error, info, warn};
use std::sync::Arc;

use crate::config::SampleStrategySettings;
use crate::market_clock::{
    next_cadence_wait, sleep_or_shutdown, wait_until, Shutdown, PROCESS_CADENCE_SECS,
};
use crate::models::{ProductType, Trade};
use crate::ticker::{QuoteProvider, Tick};
use crate::trade_manager::TradeManager;

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub name: String,
    pub enabled: bool,
    pub product_type: ProductType,
    pub symbols: Vec<String>,
    pub sl_percentage: f64,
    pub target_percentage: f64,
    pub start_time: NaiveTime,
    pub stop_time: NaiveTime,
    pub square_off_time: NaiveTime,
    pub capital: f64,
    pub leverage: f64,
    pub max_trades_per_day: u32,
    pub is_fno: bool,
    pub capital_per_set: f64,
}

impl StrategyConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            product_type: ProductType::Mis,
            symbols: Vec::new(),
            sl_percentage: 0.0,
            target_percentage: 0.0,
            start_time: time_of_day(9, 15),
            stop_time: time_of_day(15, 0),
            square_off_time: time_of_day(15, 15),
            capital: 10000.0,
            leverage: 1.0,
            max_trades_per_day: 1,
            is_fno: false,
            capital_per_set: 0.0,
        }
    }

    pub fn calculate_capital_per_trade(&self) -> f64 {
        let leverage = self.leverage.max(1.0);
        let trades = self.max_trades_per_day.max(1) as f64;
        (self.capital * leverage / trades).floor()
    }

    pub fn calculate_lots_per_trade(&self) -> u32 {
        if !self.is_fno || self.capital_per_set <= 0.0 {
            return 0;
        }
        (self.capital / self.capital_per_set).floor().max(0.0) as u32
    }
}

fn time_of_day(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    InvalidQuantity,
    NoNewTradesCutOffTimeReached,
    MaxTradesPerDayReached,
}

impl DisableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisableReason::InvalidQuantity => "InvalidQuantity",
            DisableReason::NoNewTradesCutOffTimeReached => "NoNewTradesCutOffTimeReached",
            DisableReason::MaxTradesPerDayReached => "MaxTradesPerDayReached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeDecision {
    Place,
    Wait,
    Disable(DisableReason),
}

/// What the manager knows at the moment it asks a strategy about a trade.
#[derive(Debug, Clone, Copy)]
pub struct GateContext {
    pub now: DateTime<Utc>,
    pub stop_timestamp: DateTime<Utc>,
    pub trades_placed: usize,
}

pub fn check_base_conditions(
    config: &StrategyConfig,
    trade: &Trade,
    ctx: &GateContext,
) -> Result<(), DisableReason> {
    if trade.qty == 0 {
        return Err(DisableReason::InvalidQuantity);
    }
    if ctx.now >= ctx.stop_timestamp {
        return Err(DisableReason::NoNewTradesCutOffTimeReached);
    }
    if ctx.trades_placed >= config.max_trades_per_day as usize {
        return Err(DisableReason::MaxTradesPerDayReached);
    }
    Ok(())
}

#[async_trait]
pub trait Strategy: Send + Sync {
    fn config(&self) -> &StrategyConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    /// One scan: inspect the market and hand new trade intents to the manager.
    async fn process(&self, manager: &TradeManager) -> Result<()>;

    fn entry_triggered(&self, _trade: &Trade, _tick: &Tick) -> bool {
        true
    }

    fn should_place_trade(&self, trade: &Trade, tick: &Tick, ctx: &GateContext) -> TradeDecision {
        if let Err(reason) = check_base_conditions(self.config(), trade, ctx) {
            return TradeDecision::Disable(reason);
        }
        if self.entry_triggered(trade, tick) {
            TradeDecision::Place
        } else {
            TradeDecision::Wait
        }
    }

    /// New stop level for an open trade, or 0 to leave the stop alone.
    fn trailing_stop_loss(&self, _trade: &Trade, _cmp: f64) -> f64 {
        0.0
    }

    fn can_trade_today(&self, _date: NaiveDate) -> bool {
        true
    }
}

/// Drives one strategy for the trading day: waits for its start time, then
/// calls `process` on every 30-second boundary until market close or shutdown.
pub async fn run_strategy(
    strategy: Arc<dyn Strategy>,
    manager: Arc<TradeManager>,
    mut shutdown: Shutdown,
) {
    let name = strategy.name().to_string();
    let config = strategy.config().clone();
    let clock = manager.clock();
    let market = manager.market_hours().clone();

    if !config.enabled {
        warn!("Strategy {} is disabled, not running", name);
        return;
    }
    let now = clock.now();
    if market.is_market_closed_for_the_day(now) {
        warn!("Market is closed for the day, strategy {} will not run", name);
        return;
    }
    if !strategy.can_trade_today(market.local_date(now)) {
        warn!("Strategy {} cannot trade today, not running", name);
        return;
    }

    let start = market
        .open_at(now)
        .max(market.at_time_of_day(now, config.start_time));
    if clock.now() < start {
        info!("Strategy {} waiting until {} to start", name, start);
        if wait_until(clock.as_ref(), start, &mut shutdown).await {
            info!("Strategy {} stopped before start", name);
            return;
        }
    }

    info!("Strategy {} started", name);
    loop {
        let now = clock.now();
        if market.is_market_closed_for_the_day(now) {
            info!("Market closed, strategy {} exiting", name);
            break;
        }
        if let Err(err) = strategy.process(manager.as_ref()).await {
            error!("Strategy {} failed to process: {:#}", name, err);
        }
        let wait = next_cadence_wait(clock.now(), PROCESS_CADENCE_SECS);
        if sleep_or_shutdown(wait, &mut shutdown).await {
            info!("Strategy {} stopping on shutdown", name);
            break;
        }
    }
}

#[path = "strategies/sample.rs"]
pub mod sample;

pub use sample::SampleStrategy;

pub fn create_strategy(
    name: &str,
    settings: &SampleStrategySettings,
    quotes: Arc<dyn QuoteProvider>,
) -> Result<Arc<dyn Strategy>> {
    match name {
        sample::SAMPLE_STRATEGY_NAME => Ok(Arc::new(SampleStrategy::new(
            sample::default_config(settings),
            quotes,
        ))),
        _ => Err(anyhow!("Unknown strategy: {}", name)),
    }
}
