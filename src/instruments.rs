use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub trading_symbol: String,
    pub token: u64,
    pub lot_size: u32,
    pub exchange: String,
    pub exchange_segment: String,
}

pub trait InstrumentCatalog: Send + Sync {
    fn lookup(&self, symbol: &str) -> Option<Instrument>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryCatalog {
    by_symbol: HashMap<String, Instrument>,
}

impl InMemoryCatalog {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        let by_symbol = instruments
            .into_iter()
            .map(|instrument| (instrument.trading_symbol.to_uppercase(), instrument))
            .collect();
        Self { by_symbol }
    }

    /// Parses the broker's instrument dump. Rows for the same symbol on several
    /// exchanges keep the NSE/NFO listing.
    pub fn parse_kite_csv(raw: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(raw.as_bytes());
        let headers = reader
            .headers()
            .context("failed to read instrument dump header")?
            .clone();
        if headers.is_empty() {
            return Err(anyhow!("instrument dump is empty"));
        }
        let column = |name: &str| {
            headers
                .iter()
                .position(|col| col.eq_ignore_ascii_case(name))
                .ok_or_else(|| anyhow!("instrument dump has no {} column", name))
        };
        let token_idx = column("instrument_token")?;
        let symbol_idx = column("tradingsymbol")?;
        let lot_idx = column("lot_size")?;
        let segment_idx = column("segment")?;
        let exchange_idx = column("exchange")?;

        let mut by_symbol: HashMap<String, Instrument> = HashMap::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("failed to read instrument row {}", idx + 2))?;
            let field = |col: usize| record.get(col).unwrap_or("");

            let symbol = field(symbol_idx).to_uppercase();
            if symbol.is_empty() {
                continue;
            }
            let token = field(token_idx).parse::<u64>().map_err(|_| {
                anyhow!(
                    "instrument dump row {} has an invalid instrument_token: {}",
                    idx + 2,
                    field(token_idx)
                )
            })?;
            let lot_size = field(lot_idx)
                .parse::<f64>()
                .ok()
                .filter(|lot| lot.is_finite() && *lot >= 1.0)
                .map(|lot| lot.round() as u32)
                .unwrap_or(1);

            let instrument = Instrument {
                trading_symbol: symbol.clone(),
                token,
                lot_size,
                exchange: field(exchange_idx).to_uppercase(),
                exchange_segment: field(segment_idx).to_uppercase(),
            };

            let preferred = matches!(instrument.exchange.as_str(), "NSE" | "NFO");
            match by_symbol.get(&symbol) {
                Some(existing) if !preferred || existing.exchange == "NSE" => {}
                _ => {
                    by_symbol.insert(symbol, instrument);
                }
            }
        }

        Ok(Self { by_symbol })
    }
}

impl InstrumentCatalog for InMemoryCatalog {
    fn lookup(&self, symbol: &str) -> Option<Instrument> {
        self.by_symbol.get(&symbol.trim().to_uppercase()).cloned()
    }

    fn len(&self) -> usize {
        self.by_symbol.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "instrument_token,exchange_token,tradingsymbol,name,last_price,expiry,strike,tick_size,lot_size,instrument_type,segment,exchange\n\
779521,3045,SBIN,\"STATE BANK OF INDIA\",0,,0,0.05,1,EQ,NSE,NSE\n\
128028676,500112,SBIN,\"STATE BANK, OF INDIA\",0,,0,0.05,1,EQ,BSE,BSE\n\
13238786,51714,NIFTY24JUNFUT,\"NIFTY\",0,2024-06-27,0,0.05,25,FUT,NFO-FUT,NFO\n";

    #[test]
    fn parses_lot_sizes_and_prefers_nse_listing() {
        let catalog = InMemoryCatalog::parse_kite_csv(DUMP).unwrap();
        assert_eq!(catalog.len(), 2);

        let sbin = catalog.lookup("sbin").unwrap();
        assert_eq!(sbin.exchange, "NSE");
        assert_eq!(sbin.token, 779521);

        let future = catalog.lookup("NIFTY24JUNFUT").unwrap();
        assert_eq!(future.lot_size, 25);
        assert_eq!(future.exchange_segment, "NFO-FUT");
        assert!(catalog.lookup("UNKNOWN").is_none());
    }

    #[test]
    fn rejects_dumps_without_required_columns() {
        assert!(InMemoryCatalog::parse_kite_csv("").is_err());
        assert!(InMemoryCatalog::parse_kite_csv("tradingsymbol,exchange\nSBIN,NSE").is_err());
    }

    #[test]
    fn quoted_names_with_commas_keep_columns_aligned() {
        let dump = "instrument_token,exchange_token,tradingsymbol,name,last_price,expiry,strike,tick_size,lot_size,instrument_type,segment,exchange\n\
128028676,500112,SBIN,\"STATE BANK, OF INDIA\",0,,0,0.05,1,EQ,BSE,BSE\n";
        let catalog = InMemoryCatalog::parse_kite_csv(dump).unwrap();
        let sbin = catalog.lookup("SBIN").unwrap();
        assert_eq!(sbin.token, 128028676);
        assert_eq!(sbin.exchange, "BSE");
        assert_eq!(sbin.lot_size, 1);
    }
}
