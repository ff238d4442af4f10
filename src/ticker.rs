use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::market_clock::{sleep_or_shutdown, Shutdown};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub symbol: String,
    pub last_price: f64,
    #[serde(default)]
    pub last_qty: u32,
    #[serde(default)]
    pub avg_price: f64,
    #[serde(default)]
    pub volume: u64,
    #[serde(default)]
    pub ohlc: Ohlc,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn new(symbol: impl Into<String>, last_price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            last_price,
            last_qty: 0,
            avg_price: 0.0,
            volume: 0,
            ohlc: Ohlc::default(),
            timestamp: Utc::now(),
        }
    }
}

/// Point-in-time quote lookups. A symbol the provider knows nothing about is
/// `Ok(None)`; errors are reserved for failed lookups.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<Option<Tick>>;
}

pub type TickListener = Box<dyn Fn(&Tick) -> Result<()> + Send + Sync>;
pub type ConnectionListener = Box<dyn Fn() + Send + Sync>;

pub trait TickSource: Send + Sync {
    fn subscribe(&self, symbols: &[String]);
    fn unsubscribe(&self, symbols: &[String]);
    fn register_tick_listener(&self, listener: TickListener);
    fn register_connection_listener(&self, listener: ConnectionListener);
}

/// Fans ticks out to listeners in registration order. Only subscribed symbols
/// reach the listeners, but the last tick of every symbol is cached for quotes.
#[derive(Default)]
pub struct TickDispatcher {
    listeners: RwLock<Vec<TickListener>>,
    connection_listeners: RwLock<Vec<ConnectionListener>>,
    subscribed: RwLock<BTreeSet<String>>,
    last_ticks: DashMap<String, Tick>,
}

impl TickDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, ticks: &[Tick]) {
        for tick in ticks {
            self.last_ticks.insert(tick.symbol.clone(), tick.clone());
        }

        let Ok(subscribed) = self.subscribed.read() else {
            error!("Tick subscription set is poisoned; dropping {} ticks", ticks.len());
            return;
        };
        let Ok(listeners) = self.listeners.read() else {
            error!("Tick listener list is poisoned; dropping {} ticks", ticks.len());
            return;
        };

        for tick in ticks.iter().filter(|tick| subscribed.contains(&tick.symbol)) {
            for (index, listener) in listeners.iter().enumerate() {
                if let Err(err) = listener(tick) {
                    error!(
                        "Tick listener #{} failed on {} @ {}: {:#}",
                        index, tick.symbol, tick.last_price, err
                    );
                }
            }
        }
    }

    pub fn notify_connected(&self) {
        match self.connection_listeners.read() {
            Ok(listeners) => {
                for listener in listeners.iter() {
                    listener();
                }
            }
            Err(_) => error!("Connection listener list is poisoned"),
        }
    }

    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.subscribed
            .read()
            .map(|symbols| symbols.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_tick(&self, symbol: &str) -> Option<Tick> {
        self.last_ticks.get(symbol).map(|entry| entry.value().clone())
    }
}

impl TickSource for TickDispatcher {
    fn subscribe(&self, symbols: &[String]) {
        if let Ok(mut subscribed) = self.subscribed.write() {
            for symbol in symbols {
                if subscribed.insert(symbol.clone()) {
                    info!("Subscribed to ticks for {}", symbol);
                }
            }
        }
    }

    fn unsubscribe(&self, symbols: &[String]) {
        if let Ok(mut subscribed) = self.subscribed.write() {
            for symbol in symbols {
                subscribed.remove(symbol);
            }
        }
    }

    fn register_tick_listener(&self, listener: TickListener) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    fn register_connection_listener(&self, listener: ConnectionListener) {
        if let Ok(mut listeners) = self.connection_listeners.write() {
            listeners.push(listener);
        }
    }
}

#[async_trait]
impl QuoteProvider for TickDispatcher {
    async fn quote(&self, symbol: &str) -> Result<Option<Tick>> {
        Ok(self.last_tick(symbol))
    }
}

/// Polls `quotes` for every subscribed symbol and publishes the results as ticks.
pub async fn run_polling_feed(
    dispatcher: Arc<TickDispatcher>,
    quotes: Arc<dyn QuoteProvider>,
    interval: Duration,
    mut shutdown: Shutdown,
) {
    info!("Quote polling feed started (every {:?})", interval);
    dispatcher.notify_connected();

    loop {
        let symbols = dispatcher.subscribed_symbols();
        let mut ticks = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            match quotes.quote(symbol).await {
                Ok(Some(tick)) if tick.last_price > 0.0 => ticks.push(tick),
                Ok(_) => warn!("No quote available for {}", symbol),
                Err(err) => warn!("Quote lookup for {} failed: {:#}", symbol, err),
            }
        }
        if !ticks.is_empty() {
            dispatcher.publish(&ticks);
        }

        if sleep_or_shutdown(interval, &mut shutdown).await {
            break;
        }
    }
    info!("Quote polling feed stopped");
}

/// Replays ticks recorded as JSON lines, one line per `interval`.
pub async fn run_replay_feed(
    dispatcher: Arc<TickDispatcher>,
    path: PathBuf,
    interval: Duration,
    mut shutdown: Shutdown,
) -> Result<()> {
    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read tick replay file {}", path.display()))?;
    let ticks = parse_tick_lines(&raw)
        .with_context(|| format!("Invalid tick replay file {}", path.display()))?;
    info!("Replaying {} ticks from {}", ticks.len(), path.display());
    dispatcher.notify_connected();

    for tick in ticks {
        dispatcher.publish(std::slice::from_ref(&tick));
        if sleep_or_shutdown(interval, &mut shutdown).await {
            break;
        }
    }
    info!("Tick replay finished");
    Ok(())
}

pub fn parse_tick_lines(raw: &str) -> Result<Vec<Tick>> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str::<Tick>(line)
                .with_context(|| format!("line {} is not a tick", index + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;

    #[test]
    fn listeners_run_in_order_and_failures_are_isolated() {
        let dispatcher = TickDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        dispatcher.register_tick_listener(Box::new(move |tick| {
            first.lock().unwrap().push(format!("first:{}", tick.symbol));
            Err(anyhow!("boom"))
        }));
        let second = Arc::clone(&seen);
        dispatcher.register_tick_listener(Box::new(move |tick| {
            second.lock().unwrap().push(format!("second:{}", tick.symbol));
            Ok(())
        }));

        dispatcher.subscribe(&["SBIN".to_string()]);
        dispatcher.publish(&[Tick::new("SBIN", 500.0), Tick::new("INFY", 1500.0)]);

        assert_eq!(*seen.lock().unwrap(), vec!["first:SBIN", "second:SBIN"]);
        assert_eq!(dispatcher.last_tick("INFY").unwrap().last_price, 1500.0);
    }

    #[test]
    fn unsubscribed_symbols_stop_reaching_listeners() {
        let dispatcher = TickDispatcher::new();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        dispatcher.register_tick_listener(Box::new(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        }));
        let symbols = vec!["SBIN".to_string()];
        dispatcher.subscribe(&symbols);
        dispatcher.publish(&[Tick::new("SBIN", 500.0)]);
        dispatcher.unsubscribe(&symbols);
        dispatcher.publish(&[Tick::new("SBIN", 501.0)]);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn tick_lines_parse_with_defaults() {
        let ticks = parse_tick_lines(
            "{\"symbol\":\"SBIN\",\"lastPrice\":500.5,\"ohlc\":{\"open\":498,\"high\":502,\"low\":497,\"close\":499}}\n\n{\"symbol\":\"INFY\",\"lastPrice\":1500}\n",
        )
        .unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].ohlc.close, 499.0);
        assert_eq!(ticks[1].volume, 0);
        assert!(parse_tick_lines("{\"symbol\":1}").is_err());
    }
}
