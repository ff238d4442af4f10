use chrono::NaiveDate;
use log::info;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::Trade;

const JOURNAL_FILE: &str = "trades.json";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("journal {path} is not a valid trade list: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-day JSON snapshot of every trade the engine knows about.
#[derive(Debug, Clone)]
pub struct Journal {
    root: PathBuf,
}

impl Journal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join(date.format("%Y-%m-%d").to_string())
            .join(JOURNAL_FILE)
    }

    /// Trades recorded for `date`; a day without a journal yet is empty.
    pub async fn load(&self, date: NaiveDate) -> Result<Vec<Trade>, JournalError> {
        let path = self.path_for(date);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(JournalError::Io { path, source }),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|source| JournalError::Format { path, source })
    }

    /// Replaces the day's journal. Writes go to a sibling temp file first so a
    /// crash never leaves a truncated journal behind.
    pub async fn save(&self, date: NaiveDate, trades: &[Trade]) -> Result<(), JournalError> {
        let path = self.path_for(date);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| JournalError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        let payload = serde_json::to_string_pretty(trades).map_err(|source| JournalError::Format {
            path: path.clone(),
            source,
        })?;
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|source| JournalError::Io {
                path: temp_path.clone(),
                source,
            })?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|source| JournalError::Io {
                path: path.clone(),
                source,
            })?;

        info!("Saved {} trades to {}", trades.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, TradeState};

    #[tokio::test]
    async fn missing_journal_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        assert!(journal.load(date).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn saves_under_dated_directory_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();

        let mut trade = Trade::new("SBIN", "SAMPLE", Direction::Short);
        trade.qty = 10;
        trade.trade_state = TradeState::Active;
        journal.save(date, &[trade.clone()]).await.unwrap();

        let expected = dir.path().join("2024-06-03").join("trades.json");
        assert_eq!(journal.path_for(date), expected);
        assert!(expected.exists());
        assert!(!expected.with_extension("json.tmp").exists());

        let loaded = journal.load(date).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].trade_id, trade.trade_id);
        assert_eq!(loaded[0].trade_state, TradeState::Active);
    }

    #[tokio::test]
    async fn corrupt_journal_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let path = journal.path_for(date);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            journal.load(date).await,
            Err(JournalError::Format { .. })
        ));
    }
}
