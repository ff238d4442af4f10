use chrono::{DateTime, Utc};
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const DEFAULT_EXCHANGE: &str = "NSE";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Direction of the order that closes a position opened in `self`.
    pub fn opposite(self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductType {
    #[default]
    Mis,
    Nrml,
    Cnc,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Mis => "MIS",
            ProductType::Nrml => "NRML",
            ProductType::Cnc => "CNC",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    SlLimit,
    SlMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
            OrderType::SlLimit => "SL_LIMIT",
            OrderType::SlMarket => "SL_MARKET",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    Complete,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionType {
    Ce,
    Pe,
}

/// Lifecycle of a trade. Transitions only move forward:
/// `Created -> {Active, Disabled}` and `Active -> {Completed, Cancelled}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    Created,
    Active,
    Completed,
    Cancelled,
    Disabled,
}

impl TradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::Created => "CREATED",
            TradeState::Active => "ACTIVE",
            TradeState::Completed => "COMPLETED",
            TradeState::Cancelled => "CANCELLED",
            TradeState::Disabled => "DISABLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeState::Completed | TradeState::Cancelled | TradeState::Disabled
        )
    }

    pub fn can_transition_to(&self, next: TradeState) -> bool {
        matches!(
            (self, next),
            (TradeState::Created, TradeState::Active)
                | (TradeState::Created, TradeState::Disabled)
                | (TradeState::Active, TradeState::Completed)
                | (TradeState::Active, TradeState::Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    SlHit,
    TargetHit,
    SquareOff,
    SlCancelled,
    TargetCancelled,
    EntryCancelled,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::SlHit => "SL_HIT",
            ExitReason::TargetHit => "TARGET_HIT",
            ExitReason::SquareOff => "SQUARE_OFF",
            ExitReason::SlCancelled => "SL_CANCELLED",
            ExitReason::TargetCancelled => "TARGET_CANCELLED",
            ExitReason::EntryCancelled => "ENTRY_CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeChange {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
    pub changed_at: DateTime<Utc>,
}

/// One broker-facing order leg (entry, stop-loss or target) of a trade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub trading_symbol: String,
    pub exchange: String,
    pub product_type: ProductType,
    pub direction: Direction,
    pub order_type: OrderType,
    pub order_status: OrderStatus,
    pub price: f64,
    pub trigger_price: f64,
    pub qty: u32,
    pub filled_qty: u32,
    pub pending_qty: u32,
    pub average_price: f64,
    pub order_place_timestamp: DateTime<Utc>,
    pub last_order_update_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Order {
    pub fn is_open(&self) -> bool {
        self.order_status == OrderStatus::Open
    }

    pub fn is_complete(&self) -> bool {
        self.order_status == OrderStatus::Complete
    }

    /// Cancelled or rejected without any fill worth keeping.
    pub fn is_dead(&self) -> bool {
        matches!(
            self.order_status,
            OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// A single strategy-initiated position intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub trade_id: String,
    pub trading_symbol: String,
    pub exchange: String,
    pub strategy: String,
    pub direction: Direction,
    pub product_type: ProductType,
    #[serde(default)]
    pub is_futures: bool,
    #[serde(default)]
    pub is_options: bool,
    #[serde(default)]
    pub option_type: Option<OptionType>,
    #[serde(default)]
    pub place_market_order: bool,
    pub requested_entry: f64,
    pub entry: f64,
    pub qty: u32,
    pub filled_qty: u32,
    pub initial_stop_loss: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub cmp: f64,
    pub create_timestamp: DateTime<Utc>,
    pub timestamp: Option<DateTime<Utc>>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub intraday_square_off_timestamp: Option<DateTime<Utc>>,
    pub trade_state: TradeState,
    pub exit: f64,
    pub exit_reason: Option<ExitReason>,
    pub pnl: f64,
    pub pnl_percentage: f64,
    pub entry_order: Option<Order>,
    pub sl_order: Option<Order>,
    pub target_order: Option<Order>,
    #[serde(default)]
    pub changes: Vec<TradeChange>,
}

impl Trade {
    pub fn new(
        trading_symbol: impl Into<String>,
        strategy: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            trade_id: Uuid::new_v4().to_string(),
            trading_symbol: trading_symbol.into(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            strategy: strategy.into(),
            direction,
            product_type: ProductType::Mis,
            is_futures: false,
            is_options: false,
            option_type: None,
            place_market_order: false,
            requested_entry: 0.0,
            entry: 0.0,
            qty: 0,
            filled_qty: 0,
            initial_stop_loss: 0.0,
            stop_loss: 0.0,
            target: 0.0,
            cmp: 0.0,
            create_timestamp: Utc::now(),
            timestamp: None,
            start_timestamp: None,
            end_timestamp: None,
            intraday_square_off_timestamp: None,
            trade_state: TradeState::Created,
            exit: 0.0,
            exit_reason: None,
            pnl: 0.0,
            pnl_percentage: 0.0,
            entry_order: None,
            sl_order: None,
            target_order: None,
            changes: Vec::new(),
        }
    }

    pub fn is_derivative(&self) -> bool {
        self.is_futures || self.is_options
    }

    /// Same trade by id, or the same intent generated twice by a strategy re-scan.
    pub fn is_duplicate_of(&self, other: &Trade) -> bool {
        if self.trade_id == other.trade_id {
            return true;
        }
        self.trading_symbol == other.trading_symbol
            && self.strategy == other.strategy
            && self.direction == other.direction
            && self.product_type == other.product_type
            && self.requested_entry == other.requested_entry
            && self.qty == other.qty
            && self.timestamp == other.timestamp
    }

    /// Orders of this trade that the broker knows about.
    pub fn orders_mut(&mut self) -> impl Iterator<Item = &mut Order> {
        self.entry_order
            .iter_mut()
            .chain(self.sl_order.iter_mut())
            .chain(self.target_order.iter_mut())
    }

    pub fn record_change<V>(
        &mut self,
        field: &str,
        old_value: &V,
        new_value: &V,
        changed_at: DateTime<Utc>,
    ) where
        V: Serialize,
    {
        if let (Ok(old_json), Ok(new_json)) = (
            serde_json::to_value(old_value),
            serde_json::to_value(new_value),
        ) {
            if old_json == new_json {
                return;
            }

            self.changes.push(TradeChange {
                field: field.to_string(),
                old_value: old_json,
                new_value: new_json,
                changed_at,
            });
        }
    }

    /// Moves the trade along the state DAG. Illegal transitions are refused and
    /// logged; the return value tells whether the state changed.
    pub fn set_state(&mut self, state: TradeState, changed_at: DateTime<Utc>) -> bool {
        if self.trade_state == state {
            return false;
        }
        if !self.trade_state.can_transition_to(state) {
            error!(
                "Refusing illegal state transition {} -> {} for trade {} ({})",
                self.trade_state.as_str(),
                state.as_str(),
                self.trade_id,
                self.trading_symbol
            );
            return false;
        }
        let old = self.trade_state;
        self.record_change("tradeState", &old, &state, changed_at);
        self.trade_state = state;
        true
    }

    pub fn set_entry(&mut self, value: f64, changed_at: DateTime<Utc>) {
        let old = self.entry;
        self.record_change("entry", &old, &value, changed_at);
        self.entry = value;
    }

    pub fn set_filled_qty(&mut self, value: u32, changed_at: DateTime<Utc>) {
        let value = value.min(self.qty);
        let old = self.filled_qty;
        self.record_change("filledQty", &old, &value, changed_at);
        self.filled_qty = value;
    }

    pub fn set_stop_loss(&mut self, value: f64, changed_at: DateTime<Utc>) {
        let old = self.stop_loss;
        self.record_change("stopLoss", &old, &value, changed_at);
        self.stop_loss = value;
    }

    pub fn set_exit(&mut self, value: f64, changed_at: DateTime<Utc>) {
        let old = self.exit;
        self.record_change("exit", &old, &value, changed_at);
        self.exit = value;
    }

    pub fn set_exit_reason(&mut self, value: Option<ExitReason>, changed_at: DateTime<Utc>) {
        let old = self.exit_reason;
        self.record_change("exitReason", &old, &value, changed_at);
        self.exit_reason = value;
    }

    pub fn set_start_timestamp(&mut self, value: DateTime<Utc>) {
        let old = self.start_timestamp;
        self.record_change("startTimestamp", &old, &Some(value), value);
        self.start_timestamp = Some(value);
    }

    pub fn set_end_timestamp(&mut self, value: DateTime<Utc>) {
        let old = self.end_timestamp;
        self.record_change("endTimestamp", &old, &Some(value), value);
        self.end_timestamp = Some(value);
    }

    /// Refreshes the unrealized P&L from the given market price.
    pub fn mark_to_market(&mut self, cmp: f64) {
        if cmp <= 0.0 || !cmp.is_finite() {
            return;
        }
        self.cmp = cmp;
        self.apply_pnl(cmp);
    }

    /// Realizes the trade at `exit` and moves it to COMPLETED.
    pub fn complete(&mut self, exit: f64, reason: ExitReason, changed_at: DateTime<Utc>) {
        self.set_exit(exit, changed_at);
        self.set_exit_reason(Some(reason), changed_at);
        self.apply_pnl(exit);
        self.set_end_timestamp(changed_at);
        self.set_state(TradeState::Completed, changed_at);
    }

    /// Moves the trade to CANCELLED; nothing was ever filled so nothing is realized.
    pub fn cancel(&mut self, reason: ExitReason, changed_at: DateTime<Utc>) {
        self.set_exit_reason(Some(reason), changed_at);
        self.pnl = 0.0;
        self.pnl_percentage = 0.0;
        self.set_end_timestamp(changed_at);
        self.set_state(TradeState::Cancelled, changed_at);
    }

    fn apply_pnl(&mut self, price: f64) {
        let pnl = calculate_pnl(self.direction, self.entry, self.filled_qty, price);
        self.pnl = pnl;
        self.pnl_percentage = pnl_percentage(pnl, self.entry, self.filled_qty);
    }
}

/// Direction-aware P&L of `filled_qty` units entered at `entry` and valued at `price`.
pub fn calculate_pnl(direction: Direction, entry: f64, filled_qty: u32, price: f64) -> f64 {
    if filled_qty == 0 || entry <= 0.0 {
        return 0.0;
    }
    let per_unit = match direction {
        Direction::Long => price - entry,
        Direction::Short => entry - price,
    };
    round_money(per_unit * filled_qty as f64)
}

pub fn pnl_percentage(pnl: f64, entry: f64, filled_qty: u32) -> f64 {
    let notional = entry * filled_qty as f64;
    if notional <= 0.0 {
        return 0.0;
    }
    round_money(pnl / notional * 100.0)
}

fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trade() -> Trade {
        let mut trade = Trade::new("SBIN", "SAMPLE", Direction::Long);
        trade.requested_entry = 500.0;
        trade.qty = 10;
        trade.timestamp = Some(Utc::now());
        trade
    }

    #[test]
    fn duplicate_detection_matches_on_intent_fields() {
        let first = sample_trade();
        let mut second = first.clone();
        second.trade_id = "other".to_string();
        assert!(first.is_duplicate_of(&second));

        second.qty = 11;
        assert!(!first.is_duplicate_of(&second));

        let mut same_id = sample_trade();
        same_id.trade_id = first.trade_id.clone();
        same_id.trading_symbol = "INFY".to_string();
        assert!(first.is_duplicate_of(&same_id));
    }

    #[test]
    fn state_machine_rejects_backward_and_terminal_moves() {
        let now = Utc::now();
        let mut trade = sample_trade();
        assert!(!trade.set_state(TradeState::Completed, now));
        assert!(trade.set_state(TradeState::Active, now));
        assert!(!trade.set_state(TradeState::Created, now));
        assert!(!trade.set_state(TradeState::Disabled, now));
        assert!(trade.set_state(TradeState::Completed, now));
        assert!(!trade.set_state(TradeState::Active, now));
        assert!(!trade.set_state(TradeState::Cancelled, now));
        assert_eq!(trade.trade_state, TradeState::Completed);

        let states: Vec<&Value> = trade
            .changes
            .iter()
            .filter(|change| change.field == "tradeState")
            .map(|change| &change.new_value)
            .collect();
        assert_eq!(states, vec!["ACTIVE", "COMPLETED"]);
    }

    #[test]
    fn long_unrealized_pnl() {
        let mut trade = sample_trade();
        trade.entry = 100.0;
        trade.filled_qty = 10;
        trade.mark_to_market(105.0);
        assert_eq!(trade.pnl, 50.0);
        assert_eq!(trade.pnl_percentage, 5.0);
    }

    #[test]
    fn short_realized_pnl() {
        let now = Utc::now();
        let mut trade = sample_trade();
        trade.direction = Direction::Short;
        trade.entry = 100.0;
        trade.filled_qty = 10;
        trade.set_state(TradeState::Active, now);
        trade.complete(95.0, ExitReason::TargetHit, now);
        assert_eq!(trade.pnl, 50.0);
        assert_eq!(trade.exit_reason, Some(ExitReason::TargetHit));
        assert_eq!(trade.trade_state, TradeState::Completed);
    }

    #[test]
    fn filled_qty_never_exceeds_qty() {
        let mut trade = sample_trade();
        trade.set_filled_qty(25, Utc::now());
        assert_eq!(trade.filled_qty, 10);
    }

    #[test]
    fn opposite_direction_is_logical_inverse() {
        assert_eq!(Direction::Long.opposite(), Direction::Short);
        assert_eq!(Direction::Short.opposite(), Direction::Long);
    }

    #[test]
    fn journal_field_names_are_camel_case() {
        let trade = sample_trade();
        let json = serde_json::to_value(&trade).unwrap();
        assert_eq!(json["tradingSymbol"], "SBIN");
        assert_eq!(json["tradeState"], "CREATED");
        assert_eq!(json["direction"], "LONG");
        assert!(json["entryOrder"].is_null());
    }
}
