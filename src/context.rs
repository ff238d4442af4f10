use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{load_settings_map, BrokerKind, EngineSettings};
use crate::gateway::OrderGateway;
use crate::instruments::{InMemoryCatalog, InstrumentCatalog};
use crate::journal::Journal;
use crate::kite::{KiteGateway, KiteQuotes};
use crate::market_clock::{Clock, SystemClock};
use crate::paper::PaperGateway;
use crate::retry::retry_operation;
use crate::ticker::{QuoteProvider, TickDispatcher, TickSource};
use crate::trade_manager::{ManagerSettings, TradeManager};

#[derive(Clone)]
pub struct AppContext {
    settings: EngineSettings,
}

/// Where the session's ticks come from.
pub enum TickFeed {
    Polling(Arc<dyn QuoteProvider>),
    Replay(PathBuf),
}

/// Everything one trading session runs on, wired together.
pub struct Session {
    pub manager: Arc<TradeManager>,
    pub dispatcher: Arc<TickDispatcher>,
    pub quotes: Arc<dyn QuoteProvider>,
    pub catalog: Arc<dyn InstrumentCatalog>,
    pub feed: TickFeed,
    pub paper: Option<Arc<PaperGateway>>,
}

/// The broker-specific half of a session.
pub struct BrokerHandles {
    pub gateway: Arc<dyn OrderGateway>,
    pub kite: Option<Arc<KiteGateway>>,
    pub paper: Option<Arc<PaperGateway>>,
}

impl AppContext {
    pub async fn initialize(settings_path: Option<&Path>) -> Result<Self> {
        let map = load_settings_map(settings_path)?;
        let settings = EngineSettings::from_settings_map(&map)?;
        Ok(Self { settings })
    }

    pub fn from_settings(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn journal(&self) -> Journal {
        Journal::new(self.settings.trades_dir.clone())
    }

    /// Builds the gateway, instrument catalog, tick plumbing and trade manager.
    pub async fn build_session(&self) -> Result<Session> {
        let broker = create_gateway(&self.settings)?;
        let catalog = self.load_catalog(broker.kite.as_deref()).await?;
        self.check_strategy_symbols(catalog.as_ref());

        let dispatcher = Arc::new(TickDispatcher::new());
        let quotes: Arc<dyn QuoteProvider> = match &broker.kite {
            Some(kite) => Arc::new(KiteQuotes::new(Arc::clone(kite), Arc::clone(&catalog))),
            None => Arc::clone(&dispatcher) as Arc<dyn QuoteProvider>,
        };

        let feed = match (&self.settings.tick_replay_file, self.settings.broker) {
            (Some(path), _) => TickFeed::Replay(path.clone()),
            (None, BrokerKind::Zerodha) => TickFeed::Polling(Arc::clone(&quotes)),
            (None, BrokerKind::Paper) => {
                return Err(anyhow!(
                    "Missing required setting TICK_REPLAY_FILE (the paper broker needs recorded ticks for prices)"
                ))
            }
        };

        if let Some(paper) = &broker.paper {
            let paper = Arc::clone(paper);
            dispatcher.register_tick_listener(Box::new(move |tick| {
                paper.mark_price(&tick.symbol, tick.last_price);
                Ok(())
            }));
        }

        let ticker: Arc<dyn TickSource> = Arc::clone(&dispatcher) as Arc<dyn TickSource>;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let manager = Arc::new(TradeManager::new(
            broker.gateway,
            ticker,
            self.journal(),
            clock,
            self.settings.market_hours.clone(),
            ManagerSettings {
                reconcile_interval: self.settings.reconcile_interval,
                broker_timeout: self.settings.broker_timeout,
            },
        ));

        Ok(Session {
            manager,
            dispatcher,
            quotes,
            catalog,
            feed,
            paper: broker.paper,
        })
    }

    async fn load_catalog(&self, kite: Option<&KiteGateway>) -> Result<Arc<dyn InstrumentCatalog>> {
        let catalog = match (&self.settings.instruments_file, kite) {
            (Some(path), _) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read instruments file {}", path.display()))?;
                InMemoryCatalog::parse_kite_csv(&raw)
                    .with_context(|| format!("Invalid instruments file {}", path.display()))?
            }
            (None, Some(kite)) => {
                let raw = retry_operation!("instrument download", kite.fetch_instruments_csv())
                    .context("Failed to download instruments")?;
                InMemoryCatalog::parse_kite_csv(&raw).context("Invalid instrument dump")?
            }
            (None, None) => return Err(anyhow!("No instrument source configured")),
        };
        if catalog.is_empty() {
            return Err(anyhow!("Instrument catalog is empty"));
        }
        info!("Loaded {} instruments", catalog.len());
        Ok(Arc::new(catalog))
    }

    fn check_strategy_symbols(&self, catalog: &dyn InstrumentCatalog) {
        let sample = &self.settings.sample_strategy;
        if !sample.enabled {
            return;
        }
        for symbol in &sample.symbols {
            if catalog.lookup(symbol).is_none() {
                warn!("Symbol {} is not in the instrument catalog", symbol);
            }
        }
    }
}

/// Picks the order gateway named by the BROKER setting.
pub fn create_gateway(settings: &EngineSettings) -> Result<BrokerHandles> {
    match settings.broker {
        BrokerKind::Zerodha => {
            let kite_settings = settings
                .kite
                .as_ref()
                .ok_or_else(|| anyhow!("Zerodha broker selected without Kite credentials"))?;
            let http = Client::builder()
                .timeout(settings.broker_timeout)
                .build()
                .context("failed to construct HTTP client")?;
            let kite = Arc::new(KiteGateway::new(http, kite_settings)?);
            info!("Using Zerodha Kite gateway at {}", kite_settings.base_url);
            Ok(BrokerHandles {
                gateway: Arc::clone(&kite) as Arc<dyn OrderGateway>,
                kite: Some(kite),
                paper: None,
            })
        }
        BrokerKind::Paper => {
            let paper = Arc::new(PaperGateway::new());
            info!("Using paper broker");
            Ok(BrokerHandles {
                gateway: Arc::clone(&paper) as Arc<dyn OrderGateway>,
                kite: None,
                paper: Some(paper),
            })
        }
    }
}
