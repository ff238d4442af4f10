use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use log::info;
use std::collections::BTreeMap;

use crate::context::AppContext;
use crate::models::{Trade, TradeState};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct JournalSummary {
    pub trades: usize,
    pub by_state: BTreeMap<&'static str, usize>,
    pub realized_pnl: f64,
    pub open_pnl: f64,
}

pub fn summarize(trades: &[Trade]) -> JournalSummary {
    let mut summary = JournalSummary {
        trades: trades.len(),
        ..JournalSummary::default()
    };
    for trade in trades {
        *summary.by_state.entry(trade.trade_state.as_str()).or_default() += 1;
        match trade.trade_state {
            TradeState::Completed => summary.realized_pnl += trade.pnl,
            TradeState::Active => summary.open_pnl += trade.pnl,
            _ => {}
        }
    }
    summary.realized_pnl = (summary.realized_pnl * 100.0).round() / 100.0;
    summary.open_pnl = (summary.open_pnl * 100.0).round() / 100.0;
    summary
}

/// Prints the journal of one trading day (today in market time by default).
pub async fn run(app: &AppContext, date: Option<NaiveDate>) -> Result<()> {
    let date = date.unwrap_or_else(|| app.settings().market_hours.local_date(Utc::now()));
    let journal = app.journal();
    let trades = journal
        .load(date)
        .await
        .with_context(|| format!("Failed to load the trade journal for {}", date))?;

    if trades.is_empty() {
        info!("No trades recorded for {} in {}", date, journal.root().display());
        return Ok(());
    }

    for trade in &trades {
        info!(
            "{} {} {} {} x{}/{} entry {} exit {} ({}) pnl {} [{}]",
            trade.trade_id,
            trade.strategy,
            trade.direction.as_str(),
            trade.trading_symbol,
            trade.filled_qty,
            trade.qty,
            trade.entry,
            trade.exit,
            trade.exit_reason.map(|reason| reason.as_str()).unwrap_or("-"),
            trade.pnl,
            trade.trade_state.as_str()
        );
    }

    let summary = summarize(&trades);
    let states: Vec<String> = summary
        .by_state
        .iter()
        .map(|(state, count)| format!("{}={}", state, count))
        .collect();
    info!(
        "{}: {} trades ({}), realized pnl {}, open pnl {}",
        date,
        summary.trades,
        states.join(", "),
        summary.realized_pnl,
        summary.open_pnl
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;

    fn trade(state: TradeState, pnl: f64) -> Trade {
        let mut trade = Trade::new("SBIN", "SAMPLE", Direction::Long);
        trade.trade_state = state;
        trade.pnl = pnl;
        trade
    }

    #[test]
    fn splits_realized_and_open_pnl() {
        let summary = summarize(&[
            trade(TradeState::Completed, -57.0),
            trade(TradeState::Completed, 20.1),
            trade(TradeState::Active, 12.5),
            trade(TradeState::Disabled, 0.0),
        ]);
        assert_eq!(summary.trades, 4);
        assert_eq!(summary.realized_pnl, -36.9);
        assert_eq!(summary.open_pnl, 12.5);
        assert_eq!(summary.by_state.get("COMPLETED"), Some(&2));
        assert_eq!(summary.by_state.get("DISABLED"), Some(&1));
    }
}
