use anyhow::{Context, Result};
use futures::future::join_all;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::context::{AppContext, TickFeed};
use crate::strategy::{create_strategy, run_strategy, sample::SAMPLE_STRATEGY_NAME};
use crate::ticker::{run_polling_feed, run_replay_feed};

/// Runs one trading session until market close or Ctrl-C.
pub async fn run(app: &AppContext) -> Result<()> {
    let session = app.build_session().await?;
    let manager = Arc::clone(&session.manager);

    let restored = manager
        .load_journal()
        .await
        .context("Failed to load today's trade journal")?;
    if restored > 0 {
        info!("Resuming with {} trades from the journal", restored);
    }

    let sample = &app.settings().sample_strategy;
    if sample.enabled {
        let strategy = create_strategy(SAMPLE_STRATEGY_NAME, sample, Arc::clone(&session.quotes))?;
        manager.register_strategy(strategy);
    } else {
        warn!("No strategies enabled, only tracking journaled trades");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                let _ = signal_tx.send(true);
            }
            Err(err) => error!("Failed to listen for Ctrl-C: {}", err),
        }
    });

    let ticks = manager.attach_to_ticker();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let dispatcher = Arc::clone(&session.dispatcher);
    let poll_interval = app.settings().quote_poll_interval;
    let feed_shutdown = shutdown_rx.clone();
    tasks.push(match session.feed {
        TickFeed::Polling(quotes) => tokio::spawn(run_polling_feed(
            dispatcher,
            quotes,
            poll_interval,
            feed_shutdown,
        )),
        TickFeed::Replay(path) => tokio::spawn(async move {
            if let Err(err) = run_replay_feed(dispatcher, path, poll_interval, feed_shutdown).await {
                error!("Tick replay failed: {:#}", err);
            }
        }),
    });

    let pump = Arc::clone(&manager).run_tick_pump(ticks, shutdown_rx.clone());
    tasks.push(tokio::spawn(async move {
        if let Err(err) = pump.await {
            error!("Tick pump failed: {:#}", err);
        }
    }));

    let reconcile = tokio::spawn(Arc::clone(&manager).reconcile_loop(shutdown_rx.clone()));

    let strategy_tasks: Vec<JoinHandle<()>> = manager
        .strategy(SAMPLE_STRATEGY_NAME)
        .into_iter()
        .map(|strategy| {
            tokio::spawn(run_strategy(
                strategy,
                Arc::clone(&manager),
                shutdown_rx.clone(),
            ))
        })
        .collect();

    for result in join_all(strategy_tasks).await {
        if let Err(err) = result {
            error!("Strategy task panicked: {}", err);
        }
    }
    info!("Strategies finished, waiting for reconciliation to wind down");

    if let Err(err) = reconcile.await {
        error!("Reconciliation task panicked: {}", err);
    }
    // reconciliation only ends at close or shutdown; stop the feed and pump with it
    let _ = shutdown_tx.send(true);
    for result in join_all(tasks).await {
        if let Err(err) = result {
            error!("Session task panicked: {}", err);
        }
    }

    manager.persist().await;
    let trades = manager.all_trades().await;
    info!("Session finished with {} trades", trades.len());
    Ok(())
}
