use anyhow::{anyhow, Context, Result};
use chrono::{FixedOffset, NaiveDate, NaiveTime};
use log::info;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::market_clock::MarketHours;

pub const DEFAULT_KITE_BASE_URL: &str = "https://api.kite.trade";

/// Every key the engine reads. Environment variables with these names
/// override values from the settings file.
pub const SETTING_KEYS: &[&str] = &[
    "BROKER",
    "KITE_API_KEY",
    "KITE_ACCESS_TOKEN",
    "KITE_BASE_URL",
    "TRADES_DIR",
    "INSTRUMENTS_FILE",
    "RECONCILE_INTERVAL_SECS",
    "BROKER_TIMEOUT_SECS",
    "QUOTE_POLL_INTERVAL_SECS",
    "TICK_REPLAY_FILE",
    "MARKET_OPEN",
    "MARKET_CLOSE",
    "MARKET_UTC_OFFSET_MINUTES",
    "HOLIDAYS",
    "SAMPLE_STRATEGY_ENABLED",
    "SAMPLE_STRATEGY_SYMBOLS",
    "SAMPLE_STRATEGY_CAPITAL",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Zerodha,
    Paper,
}

impl BrokerKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "zerodha" | "kite" => Ok(Self::Zerodha),
            "paper" => Ok(Self::Paper),
            other => Err(anyhow!("BROKER must be zerodha or paper (value: {})", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KiteSettings {
    pub api_key: String,
    pub access_token: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct SampleStrategySettings {
    pub enabled: bool,
    pub symbols: Vec<String>,
    pub capital: f64,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub broker: BrokerKind,
    pub kite: Option<KiteSettings>,
    pub trades_dir: PathBuf,
    pub instruments_file: Option<PathBuf>,
    pub reconcile_interval: Duration,
    pub broker_timeout: Duration,
    pub quote_poll_interval: Duration,
    pub tick_replay_file: Option<PathBuf>,
    pub market_hours: MarketHours,
    pub sample_strategy: SampleStrategySettings,
}

impl EngineSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let broker = BrokerKind::parse(optional_setting(settings, "BROKER").unwrap_or("paper"))?;

        let kite = match broker {
            BrokerKind::Zerodha => Some(KiteSettings {
                api_key: require_setting(settings, "KITE_API_KEY")?.to_string(),
                access_token: require_setting(settings, "KITE_ACCESS_TOKEN")?.to_string(),
                base_url: optional_setting(settings, "KITE_BASE_URL")
                    .unwrap_or(DEFAULT_KITE_BASE_URL)
                    .trim_end_matches('/')
                    .to_string(),
            }),
            BrokerKind::Paper => None,
        };

        let trades_dir =
            PathBuf::from(optional_setting(settings, "TRADES_DIR").unwrap_or("trades"));
        let instruments_file = optional_setting(settings, "INSTRUMENTS_FILE").map(PathBuf::from);
        let tick_replay_file = optional_setting(settings, "TICK_REPLAY_FILE").map(PathBuf::from);

        if broker == BrokerKind::Paper && instruments_file.is_none() {
            return Err(anyhow!(
                "Missing required setting INSTRUMENTS_FILE (the paper broker has no instrument download)"
            ));
        }

        let reconcile_interval =
            setting_secs_or(settings, "RECONCILE_INTERVAL_SECS", 30, 1)?;
        let broker_timeout = setting_secs_or(settings, "BROKER_TIMEOUT_SECS", 10, 1)?;
        let quote_poll_interval = setting_secs_or(settings, "QUOTE_POLL_INTERVAL_SECS", 2, 1)?;

        let open = setting_time_or(settings, "MARKET_OPEN", "09:15")?;
        let close = setting_time_or(settings, "MARKET_CLOSE", "15:30")?;
        if close <= open {
            return Err(anyhow!(
                "MARKET_CLOSE ({}) must be after MARKET_OPEN ({})",
                close,
                open
            ));
        }
        let offset_minutes = match optional_setting(settings, "MARKET_UTC_OFFSET_MINUTES") {
            Some(_) => require_setting_i32(settings, "MARKET_UTC_OFFSET_MINUTES", -12 * 60)?,
            None => 330,
        };
        let utc_offset = FixedOffset::east_opt(offset_minutes * 60).ok_or_else(|| {
            anyhow!(
                "Setting MARKET_UTC_OFFSET_MINUTES is out of range (value: {})",
                offset_minutes
            )
        })?;
        let holidays = setting_date_list(settings, "HOLIDAYS")?;

        let sample_strategy = SampleStrategySettings {
            enabled: setting_bool_or(settings, "SAMPLE_STRATEGY_ENABLED", true)?,
            symbols: optional_setting(settings, "SAMPLE_STRATEGY_SYMBOLS")
                .unwrap_or("SBIN,INFY")
                .split(',')
                .map(|symbol| symbol.trim().to_ascii_uppercase())
                .filter(|symbol| !symbol.is_empty())
                .collect(),
            capital: match optional_setting(settings, "SAMPLE_STRATEGY_CAPITAL") {
                Some(_) => require_setting_f64(settings, "SAMPLE_STRATEGY_CAPITAL", Some(0.0), None)?,
                None => 100000.0,
            },
        };

        Ok(Self {
            broker,
            kite,
            trades_dir,
            instruments_file,
            reconcile_interval,
            broker_timeout,
            quote_poll_interval,
            tick_replay_file,
            market_hours: MarketHours {
                open,
                close,
                utc_offset,
                holidays,
            },
            sample_strategy,
        })
    }
}

/// Reads the flat JSON settings file (if any) and applies environment overrides.
pub fn load_settings_map(path: Option<&Path>) -> Result<HashMap<String, String>> {
    let mut settings = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read settings file {}", path.display()))?;
            let parsed = parse_settings_json(&raw)
                .with_context(|| format!("Invalid settings file {}", path.display()))?;
            info!("Loaded {} settings from {}", parsed.len(), path.display());
            parsed
        }
        None => HashMap::new(),
    };

    for key in SETTING_KEYS {
        if let Ok(value) = std::env::var(key) {
            settings.insert((*key).to_string(), value);
        }
    }

    Ok(settings)
}

pub fn parse_settings_json(raw: &str) -> Result<HashMap<String, String>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let object = value
        .as_object()
        .ok_or_else(|| anyhow!("settings must be a JSON object of key/value pairs"))?;

    let mut settings = HashMap::with_capacity(object.len());
    for (key, value) in object {
        let text = match value {
            serde_json::Value::String(text) => text.clone(),
            serde_json::Value::Number(number) => number.to_string(),
            serde_json::Value::Bool(flag) => flag.to_string(),
            serde_json::Value::Null => continue,
            other => {
                return Err(anyhow!(
                    "Setting {} must be a string, number or boolean (value: {})",
                    key,
                    other
                ))
            }
        };
        settings.insert(key.clone(), text);
    }
    Ok(settings)
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn require_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    optional_setting(settings, key).ok_or_else(|| anyhow!("Missing required setting {}", key))
}

pub fn parse_date(key: &str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        anyhow!(
            "{} must be a date in YYYY-MM-DD format (value: {})",
            key,
            raw
        )
    })
}

fn require_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn require_setting_u64(settings: &HashMap<String, String>, key: &str, min: u64) -> Result<u64> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as u64)
}

fn require_setting_i32(settings: &HashMap<String, String>, key: &str, min: i32) -> Result<i32> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<i32>()
        .map_err(|_| anyhow!("Setting {} must be an integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value)
}

fn setting_secs_or(
    settings: &HashMap<String, String>,
    key: &str,
    default: u64,
    min: u64,
) -> Result<Duration> {
    let secs = match optional_setting(settings, key) {
        Some(_) => require_setting_u64(settings, key, min)?,
        None => default,
    };
    Ok(Duration::from_secs(secs))
}

fn setting_time_or(settings: &HashMap<String, String>, key: &str, default: &str) -> Result<NaiveTime> {
    let raw = optional_setting(settings, key).unwrap_or(default);
    parse_time_of_day(raw).ok_or_else(|| {
        anyhow!(
            "Setting {} must be a time of day in HH:MM or HH:MM:SS format (value: {})",
            key,
            raw
        )
    })
}

pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

fn setting_bool_or(settings: &HashMap<String, String>, key: &str, default: bool) -> Result<bool> {
    match optional_setting(settings, key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("Setting {} must be true or false (value: {})", key, raw)),
        },
    }
}

fn setting_date_list(settings: &HashMap<String, String>, key: &str) -> Result<HashSet<NaiveDate>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(HashSet::new());
    };
    raw.split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| parse_date(key, part))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn paper_settings_fall_back_to_defaults() {
        let parsed =
            EngineSettings::from_settings_map(&settings(&[("INSTRUMENTS_FILE", "instruments.csv")]))
                .unwrap();
        assert_eq!(parsed.broker, BrokerKind::Paper);
        assert!(parsed.kite.is_none());
        assert_eq!(parsed.reconcile_interval, Duration::from_secs(30));
        assert_eq!(parsed.broker_timeout, Duration::from_secs(10));
        assert_eq!(parsed.market_hours.open, NaiveTime::from_hms_opt(9, 15, 0).unwrap());
        assert_eq!(parsed.market_hours.utc_offset.local_minus_utc(), 330 * 60);
        assert_eq!(parsed.sample_strategy.symbols, vec!["SBIN", "INFY"]);
    }

    #[test]
    fn zerodha_requires_credentials() {
        let err = EngineSettings::from_settings_map(&settings(&[("BROKER", "zerodha")]))
            .unwrap_err();
        assert!(err.to_string().contains("KITE_API_KEY"));

        let parsed = EngineSettings::from_settings_map(&settings(&[
            ("BROKER", "zerodha"),
            ("KITE_API_KEY", "key"),
            ("KITE_ACCESS_TOKEN", "token"),
            ("KITE_BASE_URL", "http://127.0.0.1:9000/"),
        ]))
        .unwrap();
        let kite = parsed.kite.unwrap();
        assert_eq!(kite.base_url, "http://127.0.0.1:9000");
    }

    #[test]
    fn invalid_values_are_reported_with_the_key() {
        let err = EngineSettings::from_settings_map(&settings(&[
            ("INSTRUMENTS_FILE", "i.csv"),
            ("RECONCILE_INTERVAL_SECS", "1.5"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("RECONCILE_INTERVAL_SECS"));

        let err = EngineSettings::from_settings_map(&settings(&[
            ("INSTRUMENTS_FILE", "i.csv"),
            ("MARKET_OPEN", "16:00"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("MARKET_CLOSE"));

        let err = EngineSettings::from_settings_map(&settings(&[
            ("INSTRUMENTS_FILE", "i.csv"),
            ("HOLIDAYS", "2024-01-26,26/01/2024"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("HOLIDAYS"));
    }

    #[test]
    fn holidays_are_parsed_from_a_comma_list() {
        let parsed = EngineSettings::from_settings_map(&settings(&[
            ("INSTRUMENTS_FILE", "i.csv"),
            ("HOLIDAYS", "2024-01-26, 2024-03-08"),
        ]))
        .unwrap();
        assert!(parsed
            .market_hours
            .holidays
            .contains(&NaiveDate::from_ymd_opt(2024, 3, 8).unwrap()));
    }

    #[test]
    fn settings_json_accepts_scalars() {
        let parsed =
            parse_settings_json(r#"{"BROKER":"paper","BROKER_TIMEOUT_SECS":5,"SAMPLE_STRATEGY_ENABLED":false,"X":null}"#)
                .unwrap();
        assert_eq!(parsed.get("BROKER_TIMEOUT_SECS").map(String::as_str), Some("5"));
        assert_eq!(parsed.get("SAMPLE_STRATEGY_ENABLED").map(String::as_str), Some("false"));
        assert!(!parsed.contains_key("X"));
        assert!(parse_settings_json("[1,2]").is_err());
    }
}
