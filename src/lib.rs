pub mod commands {
    pub mod run;
    pub mod trades;
}
pub mod config;
pub mod context;
pub mod gateway;
pub mod instruments;
pub mod journal;
pub mod kite;
pub mod market_clock;
pub mod models;
pub mod paper;
pub mod retry;
pub mod strategy;
pub mod strategy_utils;
pub mod ticker;
pub mod trade_manager;
