use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::config::SampleStrategySettings;
use crate::market_clock::MarketHours;
use crate::models::{Direction, Trade};
use crate::strategy_utils::{
    breakout_levels, stop_loss_from_percentage, step_trailing_stop, target_from_percentage,
};
use crate::ticker::{QuoteProvider, Tick};
use crate::trade_manager::TradeManager;

use super::{Strategy, StrategyConfig};

pub const SAMPLE_STRATEGY_NAME: &str = "SAMPLE";
const BREAKOUT_PERCENTAGE: f64 = 0.5;

pub fn default_config(settings: &SampleStrategySettings) -> StrategyConfig {
    let mut config = StrategyConfig::new(SAMPLE_STRATEGY_NAME);
    config.enabled = settings.enabled;
    config.symbols = settings.symbols.clone();
    config.capital = settings.capital;
    config.sl_percentage = 1.0;
    config.target_percentage = 2.0;
    config.max_trades_per_day = 3;
    config.start_time = chrono::NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(config.start_time);
    config.stop_time = chrono::NaiveTime::from_hms_opt(14, 30, 0).unwrap_or(config.stop_time);
    config
}

/// Breakout of the previous close by half a percent in either direction.
pub struct SampleStrategy {
    config: StrategyConfig,
    quotes: Arc<dyn QuoteProvider>,
    trailing_step: f64,
    scanned: Mutex<HashSet<String>>,
}

impl SampleStrategy {
    pub fn new(config: StrategyConfig, quotes: Arc<dyn QuoteProvider>) -> Self {
        Self {
            config,
            quotes,
            trailing_step: 0.0,
            scanned: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_trailing_step(mut self, step: f64) -> Self {
        self.trailing_step = step.max(0.0);
        self
    }

    fn already_scanned(&self, symbol: &str) -> bool {
        self.scanned
            .lock()
            .map(|scanned| scanned.contains(symbol))
            .unwrap_or(false)
    }

    fn mark_scanned(&self, symbol: &str) {
        if let Ok(mut scanned) = self.scanned.lock() {
            scanned.insert(symbol.to_string());
        }
    }

    pub fn build_trade(
        &self,
        symbol: &str,
        direction: Direction,
        breakout: f64,
        now: DateTime<Utc>,
        market: &MarketHours,
    ) -> Trade {
        let capital_per_trade = self.config.calculate_capital_per_trade();
        let qty = ((capital_per_trade / breakout).floor() as u32).max(1);

        let mut trade = Trade::new(symbol, self.config.name.clone(), direction);
        trade.product_type = self.config.product_type;
        trade.requested_entry = breakout;
        trade.qty = qty;
        trade.initial_stop_loss =
            stop_loss_from_percentage(direction, breakout, self.config.sl_percentage);
        trade.stop_loss = trade.initial_stop_loss;
        trade.target = target_from_percentage(direction, breakout, self.config.target_percentage);
        trade.timestamp = Some(market.at_time_of_day(now, self.config.start_time));
        trade.intraday_square_off_timestamp =
            Some(market.at_time_of_day(now, self.config.square_off_time));
        trade
    }
}

#[async_trait]
impl Strategy for SampleStrategy {
    fn config(&self) -> &StrategyConfig {
        &self.config
    }

    async fn process(&self, manager: &TradeManager) -> Result<()> {
        let placed = manager
            .number_of_trades_placed_by_strategy(&self.config.name)
            .await;
        if placed >= self.config.max_trades_per_day as usize {
            return Ok(());
        }

        let existing: HashSet<String> = manager
            .trades_by_strategy(&self.config.name)
            .await
            .into_iter()
            .map(|trade| trade.trading_symbol)
            .collect();
        let now = manager.clock().now();

        for symbol in &self.config.symbols {
            if self.already_scanned(symbol) {
                continue;
            }
            if existing.contains(symbol) {
                self.mark_scanned(symbol);
                continue;
            }

            let Some(quote) = self.quotes.quote(symbol).await? else {
                warn!("{}: no quote for {}, skipping this scan", self.config.name, symbol);
                continue;
            };
            let previous_close = quote.ohlc.close;
            if previous_close <= 0.0 || quote.last_price <= 0.0 {
                warn!(
                    "{}: incomplete quote for {} (close {}, ltp {})",
                    self.config.name, symbol, previous_close, quote.last_price
                );
                continue;
            }

            let (long_level, short_level) = breakout_levels(previous_close, BREAKOUT_PERCENTAGE);
            let cmp = quote.last_price;
            let (direction, breakout) = if cmp > long_level {
                (Direction::Long, long_level)
            } else if cmp < short_level {
                (Direction::Short, short_level)
            } else {
                continue;
            };

            info!(
                "{}: {} broke {} at {} (previous close {})",
                self.config.name,
                symbol,
                direction.as_str(),
                cmp,
                previous_close
            );
            let trade = self.build_trade(symbol, direction, breakout, now, manager.market_hours());
            manager.add_new_trade(trade).await;
            self.mark_scanned(symbol);
        }
        Ok(())
    }

    fn entry_triggered(&self, trade: &Trade, tick: &Tick) -> bool {
        match trade.direction {
            Direction::Long => tick.last_price > trade.requested_entry,
            Direction::Short => tick.last_price < trade.requested_entry,
        }
    }

    fn trailing_stop_loss(&self, trade: &Trade, cmp: f64) -> f64 {
        if self.trailing_step <= 0.0 {
            return 0.0;
        }
        step_trailing_stop(
            trade.direction,
            trade.entry,
            trade.initial_stop_loss,
            cmp,
            self.trailing_step,
        )
    }
}
