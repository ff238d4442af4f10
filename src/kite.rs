use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use log::{info, warn};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::KiteSettings;
use crate::gateway::{
    new_local_order, update_orders_from_book, BrokerOrderUpdate, GatewayError, ModifyOrderParams,
    OrderGateway, PlaceOrderParams,
};
use crate::instruments::InstrumentCatalog;
use crate::models::{Direction, Order, OrderStatus, OrderType, ProductType, DEFAULT_EXCHANGE};
use crate::ticker::{Ohlc, QuoteProvider, Tick};

const BROKER_NAME: &str = "zerodha";
const KITE_VERSION: &str = "3";
const ORDER_VARIETY: &str = "regular";
const DERIVATIVES_EXCHANGE: &str = "NFO";
/// Kite reports exchange timestamps in IST without an offset.
const KITE_UTC_OFFSET_SECS: i32 = 330 * 60;

pub struct KiteGateway {
    http: Client,
    base_url: String,
    headers: HeaderMap,
}

impl KiteGateway {
    pub fn new(http: Client, settings: &KiteSettings) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("X-Kite-Version", HeaderValue::from_static(KITE_VERSION));
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!(
                "token {}:{}",
                settings.api_key, settings.access_token
            ))
            .context("invalid Kite API key or access token")?,
        );

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            headers,
        })
    }

    /// Raw instruments dump (CSV) used to build the instrument catalog.
    pub async fn fetch_instruments_csv(&self) -> Result<String, GatewayError> {
        let url = format!("{}/instruments", self.base_url);
        let response = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|err| GatewayError::transport(BROKER_NAME, format!("GET /instruments failed: {}", err)))?;

        let status = response.status();
        let body = response.text().await.map_err(|err| {
            GatewayError::transport(BROKER_NAME, format!("reading /instruments failed: {}", err))
        })?;
        if !status.is_success() {
            return Err(GatewayError::transport(
                BROKER_NAME,
                format!("GET /instruments returned {}", status),
            ));
        }
        Ok(body)
    }

    pub async fn fetch_quotes(
        &self,
        instruments: &[String],
    ) -> Result<HashMap<String, KiteQuote>, GatewayError> {
        if instruments.is_empty() {
            return Ok(HashMap::new());
        }
        let query: Vec<(&str, &str)> = instruments.iter().map(|i| ("i", i.as_str())).collect();
        let request = self
            .http
            .get(format!("{}/quote", self.base_url))
            .headers(self.headers.clone())
            .query(&query);
        self.send("GET /quote", request).await
    }

    async fn fetch_order_book(&self) -> Result<Vec<KiteOrder>, GatewayError> {
        let request = self
            .http
            .get(format!("{}/orders", self.base_url))
            .headers(self.headers.clone());
        self.send("GET /orders", request).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        label: &str,
        request: RequestBuilder,
    ) -> Result<T, GatewayError> {
        let response = request
            .send()
            .await
            .map_err(|err| GatewayError::transport(BROKER_NAME, format!("{} failed: {}", label, err)))?;
        let status = response.status();
        let body = response.text().await.map_err(|err| {
            GatewayError::transport(BROKER_NAME, format!("{} body could not be read: {}", label, err))
        })?;

        let envelope: KiteEnvelope<T> = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(err) if status.is_success() => {
                return Err(GatewayError::invalid_response(
                    BROKER_NAME,
                    format!("{} payload could not be parsed: {}", label, err),
                ))
            }
            Err(_) => return Err(status_error(label, status, None)),
        };

        if !status.is_success() || !envelope.status.eq_ignore_ascii_case("success") {
            let message = envelope.error_message();
            return Err(status_error(label, status, Some(message)));
        }

        envelope.data.ok_or_else(|| {
            GatewayError::invalid_response(BROKER_NAME, format!("{} returned no data", label))
        })
    }
}

#[async_trait]
impl OrderGateway for KiteGateway {
    fn name(&self) -> &str {
        BROKER_NAME
    }

    async fn place_order(&self, params: &PlaceOrderParams) -> Result<Order, GatewayError> {
        let exchange = exchange_for(params);
        let qty = params.qty.to_string();
        let price = format_price(params.price);
        let trigger_price = format_price(params.trigger_price);

        let mut form: Vec<(&str, &str)> = vec![
            ("tradingsymbol", params.symbol.as_str()),
            ("exchange", exchange),
            ("transaction_type", transaction_type(params.direction)),
            ("order_type", order_type_code(params.order_type)),
            ("quantity", qty.as_str()),
            ("product", product_code(params.product_type)),
            ("validity", "DAY"),
        ];
        if matches!(params.order_type, OrderType::Limit | OrderType::SlLimit) {
            form.push(("price", price.as_str()));
        }
        if matches!(params.order_type, OrderType::SlLimit | OrderType::SlMarket) {
            form.push(("trigger_price", trigger_price.as_str()));
        }

        let request = self
            .http
            .post(format!("{}/orders/{}", self.base_url, ORDER_VARIETY))
            .headers(self.headers.clone())
            .form(&form);
        let placed: KiteOrderId = self.send("POST /orders", request).await?;

        info!(
            "Kite accepted {} {} {} x{} for {} as order {}",
            transaction_type(params.direction),
            order_type_code(params.order_type),
            exchange,
            params.qty,
            params.symbol,
            placed.order_id
        );
        let mut order = new_local_order(placed.order_id, params, Utc::now());
        order.exchange = exchange.to_string();
        Ok(order)
    }

    async fn modify_order(
        &self,
        order: &Order,
        params: &ModifyOrderParams,
    ) -> Result<Order, GatewayError> {
        let mut updated = order.clone();
        if let Some(price) = params.price() {
            updated.price = price;
        }
        if let Some(trigger_price) = params.trigger_price() {
            updated.trigger_price = trigger_price;
        }
        if let Some(qty) = params.qty() {
            updated.qty = qty;
        }
        if let Some(order_type) = params.new_order_type {
            updated.order_type = order_type;
        }

        let qty = updated.qty.to_string();
        let price = format_price(updated.price);
        let trigger_price = format_price(updated.trigger_price);
        let mut form: Vec<(&str, &str)> = vec![
            ("order_type", order_type_code(updated.order_type)),
            ("quantity", qty.as_str()),
            ("validity", "DAY"),
        ];
        if matches!(updated.order_type, OrderType::Limit | OrderType::SlLimit) {
            form.push(("price", price.as_str()));
        }
        if matches!(updated.order_type, OrderType::SlLimit | OrderType::SlMarket) {
            form.push(("trigger_price", trigger_price.as_str()));
        }

        let request = self
            .http
            .put(format!(
                "{}/orders/{}/{}",
                self.base_url, ORDER_VARIETY, order.order_id
            ))
            .headers(self.headers.clone())
            .form(&form);
        let _: KiteOrderId = self.send("PUT /orders", request).await?;

        updated.last_order_update_timestamp = Utc::now();
        Ok(updated)
    }

    async fn modify_order_to_market(&self, order: &Order) -> Result<Order, GatewayError> {
        let params = ModifyOrderParams {
            new_order_type: Some(OrderType::Market),
            ..ModifyOrderParams::default()
        };
        self.modify_order(order, &params).await
    }

    async fn cancel_order(&self, order: &Order) -> Result<Order, GatewayError> {
        let request = self
            .http
            .delete(format!(
                "{}/orders/{}/{}",
                self.base_url, ORDER_VARIETY, order.order_id
            ))
            .headers(self.headers.clone());
        let _: KiteOrderId = self.send("DELETE /orders", request).await?;

        let mut cancelled = order.clone();
        cancelled.order_status = if order.filled_qty > 0 {
            OrderStatus::Complete
        } else {
            OrderStatus::Cancelled
        };
        cancelled.pending_qty = 0;
        cancelled.last_order_update_timestamp = Utc::now();
        Ok(cancelled)
    }

    async fn fetch_and_update_all_order_details(
        &self,
        orders: &mut [&mut Order],
    ) -> Result<usize, GatewayError> {
        if orders.is_empty() {
            return Ok(0);
        }
        let book = self.fetch_order_book().await?;
        let updates: Vec<BrokerOrderUpdate> = book.iter().filter_map(KiteOrder::to_update).collect();
        Ok(update_orders_from_book(BROKER_NAME, orders, &updates))
    }
}

/// Quote lookups against Kite, resolving each symbol's exchange from the catalog.
pub struct KiteQuotes {
    gateway: Arc<KiteGateway>,
    catalog: Arc<dyn InstrumentCatalog>,
}

impl KiteQuotes {
    pub fn new(gateway: Arc<KiteGateway>, catalog: Arc<dyn InstrumentCatalog>) -> Self {
        Self { gateway, catalog }
    }

    fn instrument_key(&self, symbol: &str) -> String {
        if symbol.contains(':') {
            return symbol.to_string();
        }
        let exchange = self
            .catalog
            .lookup(symbol)
            .map(|instrument| instrument.exchange)
            .filter(|exchange| !exchange.is_empty())
            .unwrap_or_else(|| DEFAULT_EXCHANGE.to_string());
        format!("{}:{}", exchange, symbol)
    }
}

#[async_trait]
impl QuoteProvider for KiteQuotes {
    async fn quote(&self, symbol: &str) -> anyhow::Result<Option<Tick>> {
        let key = self.instrument_key(symbol);
        let mut quotes = self.gateway.fetch_quotes(std::slice::from_ref(&key)).await?;
        Ok(quotes.remove(&key).map(|quote| quote.into_tick(symbol)))
    }
}

#[derive(Debug, Deserialize)]
struct KiteEnvelope<T> {
    #[serde(default)]
    status: String,
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

impl<T> KiteEnvelope<T> {
    fn error_message(&self) -> String {
        match (self.error_type.as_deref(), self.message.as_deref()) {
            (Some(kind), Some(message)) => format!("{}: {}", kind, message),
            (None, Some(message)) => message.to_string(),
            (Some(kind), None) => kind.to_string(),
            (None, None) => "no message".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct KiteOrderId {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct KiteOrder {
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    order_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    quantity: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    filled_quantity: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pending_quantity: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    trigger_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    average_price: Option<f64>,
    #[serde(default)]
    status_message: Option<String>,
    #[serde(default)]
    exchange_update_timestamp: Option<String>,
    #[serde(default)]
    order_timestamp: Option<String>,
}

impl KiteOrder {
    fn to_update(&self) -> Option<BrokerOrderUpdate> {
        let order_id = self
            .order_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())?
            .to_string();
        Some(BrokerOrderUpdate {
            order_id,
            status: normalize_status(self.status.as_deref()),
            order_type: self.order_type.as_deref().and_then(parse_order_type),
            price: self.price,
            trigger_price: self.trigger_price,
            qty: self.quantity.map(to_qty),
            filled_qty: self.filled_quantity.map(to_qty).unwrap_or(0),
            pending_qty: self.pending_quantity.map(to_qty),
            average_price: self.average_price,
            message: self
                .status_message
                .as_deref()
                .map(str::trim)
                .filter(|message| !message.is_empty())
                .map(str::to_string),
            updated_at: parse_kite_timestamp(self.exchange_update_timestamp.as_deref())
                .or_else(|| parse_kite_timestamp(self.order_timestamp.as_deref())),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct KiteQuote {
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub last_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub last_quantity: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub average_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub volume: Option<f64>,
    #[serde(default)]
    pub ohlc: Option<KiteOhlc>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KiteOhlc {
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub open: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub high: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub low: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub close: Option<f64>,
}

impl KiteQuote {
    pub fn into_tick(self, symbol: &str) -> Tick {
        let ohlc = self.ohlc.map_or_else(Ohlc::default, |ohlc| Ohlc {
            open: ohlc.open.unwrap_or(0.0),
            high: ohlc.high.unwrap_or(0.0),
            low: ohlc.low.unwrap_or(0.0),
            close: ohlc.close.unwrap_or(0.0),
        });
        Tick {
            symbol: symbol.to_string(),
            last_price: self.last_price.unwrap_or(0.0),
            last_qty: self.last_quantity.map(to_qty).unwrap_or(0),
            avg_price: self.average_price.unwrap_or(0.0),
            volume: self.volume.map(|volume| volume.max(0.0).round() as u64).unwrap_or(0),
            ohlc,
            timestamp: parse_kite_timestamp(self.timestamp.as_deref()).unwrap_or_else(Utc::now),
        }
    }
}

fn status_error(label: &str, status: StatusCode, message: Option<String>) -> GatewayError {
    let message = message.unwrap_or_else(|| format!("HTTP {}", status));
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        warn!("Kite {} failed with {}: {}", label, status, message);
        GatewayError::transport(BROKER_NAME, format!("{} returned {}: {}", label, status, message))
    } else {
        GatewayError::rejected(BROKER_NAME, format!("{}: {}", label, message))
    }
}

fn exchange_for(params: &PlaceOrderParams) -> &str {
    if params.is_derivative {
        DERIVATIVES_EXCHANGE
    } else if params.exchange.trim().is_empty() {
        DEFAULT_EXCHANGE
    } else {
        params.exchange.as_str()
    }
}

fn transaction_type(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "BUY",
        Direction::Short => "SELL",
    }
}

fn product_code(product: ProductType) -> &'static str {
    match product {
        ProductType::Mis => "MIS",
        ProductType::Nrml => "NRML",
        ProductType::Cnc => "CNC",
    }
}

fn order_type_code(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::SlLimit => "SL",
        OrderType::SlMarket => "SL-M",
    }
}

fn parse_order_type(raw: &str) -> Option<OrderType> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "MARKET" => Some(OrderType::Market),
        "LIMIT" => Some(OrderType::Limit),
        "SL" => Some(OrderType::SlLimit),
        "SL-M" | "SLM" => Some(OrderType::SlMarket),
        _ => None,
    }
}

/// Kite has a long tail of transient statuses; anything not terminal is still working.
fn normalize_status(raw: Option<&str>) -> OrderStatus {
    let status = raw.unwrap_or("").trim().to_ascii_uppercase();
    match status.as_str() {
        "COMPLETE" => OrderStatus::Complete,
        "REJECTED" => OrderStatus::Rejected,
        value if value.starts_with("CANCELLED") => OrderStatus::Cancelled,
        _ => OrderStatus::Open,
    }
}

fn format_price(value: f64) -> String {
    if value > 0.0 && value.is_finite() {
        format!("{:.2}", value)
    } else {
        "0".to_string()
    }
}

fn to_qty(value: f64) -> u32 {
    if value.is_finite() && value > 0.0 {
        value.round() as u32
    } else {
        0
    }
}

fn parse_kite_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let value = raw?.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").ok()?;
    let offset = FixedOffset::east_opt(KITE_UTC_OFFSET_SECS)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn deserialize_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct F64OptVisitor;

    impl<'de> Visitor<'de> for F64OptVisitor {
        type Value = Option<f64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a number or string")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value as f64))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value as f64))
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.trim().parse::<f64>().ok())
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.trim().parse::<f64>().ok())
        }
    }

    deserializer.deserialize_any(F64OptVisitor)
}
