//! Core domain types
//!
//! These types are shared by the decision loop, the durable stores and the
//! offline optimizer. Monetary values are `Decimal`; indicator values are `f64`.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Direction of an exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for longs, -1 for shorts
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Order side that opens a position in this direction
    pub fn entry_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces or closes a position in this direction
    pub fn exit_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    /// (high, low, close) as floats for indicator math
    pub fn hlc(&self) -> (f64, f64, f64) {
        (
            self.high.to_f64().unwrap_or(0.0),
            self.low.to_f64().unwrap_or(0.0),
            self.close.to_f64().unwrap_or(0.0),
        )
    }
}

/// One update from a kline stream. Intra-bar updates carry `is_closed == false`.
#[derive(Debug, Clone)]
pub struct KlineEvent {
    pub symbol: String,
    pub bar: Bar,
    pub is_closed: bool,
    pub event_time: DateTime<Utc>,
}

/// Lifecycle state of a position. `Closed` is terminal and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    OpenFull,
    OpenPartial,
    Closed,
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionState::OpenFull => write!(f, "OPEN_FULL"),
            PositionState::OpenPartial => write!(f, "OPEN_PARTIAL"),
            PositionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Trailing stop parameters fixed when the position opens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingConfig {
    /// Price that must be crossed before the stop starts to trail
    pub activation_price: Decimal,
    /// Distance kept between the best price seen and the stop
    pub distance: Decimal,
}

/// An open exposure, owned by the position store for its open lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    /// Remaining open quantity
    pub quantity: Decimal,
    /// Quantity at open
    pub original_quantity: Decimal,
    pub stop_loss: Decimal,
    /// Secondary target; reaching it closes the remainder
    pub take_profit: Decimal,
    /// Set once the trailing stop has activated
    #[serde(default)]
    pub trailing_stop: Option<Decimal>,
    #[serde(default)]
    pub trailing: Option<TrailingConfig>,
    /// |entry - stop| at open; R-multiples are always measured against it
    pub initial_risk: Decimal,
    pub state: PositionState,
    /// PnL already realized by partial exits
    #[serde(default)]
    pub realized_pnl: Decimal,
    pub entry_time: DateTime<Utc>,
    #[serde(default)]
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Open a new position from a confirmed fill
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        symbol: &str,
        direction: Direction,
        entry_price: Decimal,
        quantity: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        trailing: Option<TrailingConfig>,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction,
            entry_price,
            quantity,
            original_quantity: quantity,
            stop_loss,
            take_profit,
            trailing_stop: None,
            trailing,
            initial_risk: (entry_price - stop_loss).abs(),
            state: PositionState::OpenFull,
            realized_pnl: Decimal::ZERO,
            entry_time,
            last_tick_at: None,
        }
    }

    /// The single stop that currently governs the exit
    pub fn authoritative_stop(&self) -> Decimal {
        self.trailing_stop.unwrap_or(self.stop_loss)
    }

    /// Favorable move expressed in units of the initial risk
    pub fn r_multiple(&self, price: Decimal) -> Decimal {
        if self.initial_risk.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) * self.direction.sign() / self.initial_risk
    }

    /// Unrealized PnL of the remaining quantity at `price`
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.direction.sign() * self.quantity
    }

    pub fn is_open(&self) -> bool {
        self.state != PositionState::Closed
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    Shutdown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop loss"),
            ExitReason::TrailingStop => write!(f, "trailing stop"),
            ExitReason::TakeProfit => write!(f, "take profit"),
            ExitReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Immutable closed-trade summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub position_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    /// Partial exits plus the final exit
    pub realized_pnl: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub exit_reason: ExitReason,
}

impl TradeRecord {
    pub fn is_win(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }
}

/// Kind of capital movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Deposit,
    Withdrawal,
    RealizedPnl,
    Fee,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Deposit => "DEPOSIT",
            EntryType::Withdrawal => "WITHDRAWAL",
            EntryType::RealizedPnl => "REALIZED_PNL",
            EntryType::Fee => "FEE",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEPOSIT" => Ok(EntryType::Deposit),
            "WITHDRAWAL" => Ok(EntryType::Withdrawal),
            "REALIZED_PNL" => Ok(EntryType::RealizedPnl),
            "FEE" => Ok(EntryType::Fee),
            other => Err(format!("unknown ledger entry type: {}", other)),
        }
    }
}

/// Append-only capital movement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub description: String,
}

/// Market regime label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Trending,
    Ranging,
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regime::Trending => write!(f, "TRENDING"),
            Regime::Ranging => write!(f, "RANGING"),
        }
    }
}

/// Discrete label for a sentiment score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mood {
    Euphoria,
    Bullish,
    Neutral,
    Bearish,
    ExtremeFear,
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mood::Euphoria => write!(f, "EUPHORIA"),
            Mood::Bullish => write!(f, "BULLISH"),
            Mood::Neutral => write!(f, "NEUTRAL"),
            Mood::Bearish => write!(f, "BEARISH"),
            Mood::ExtremeFear => write!(f, "EXTREME_FEAR"),
        }
    }
}

/// Outcome of the risk gates for one decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskCheck {
    pub approved: bool,
    pub reason: String,
}

impl RiskCheck {
    pub fn approved(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
        }
    }
}

/// Snapshot of everything known at the moment of a trade/no-trade decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    /// Raw signal name (e.g. "breakout_long", "partial_take_profit", "none")
    pub signal: String,
    pub sentiment: f64,
    /// ATR as a fraction of the last close
    pub volatility: f64,
    pub regime: Regime,
    pub risk_check: RiskCheck,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<Uuid>,
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Expired,
    ExpiredInMatch,
}

/// Normalized result of a market order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    /// Volume-weighted fill price
    pub avg_price: Decimal,
    pub quote_qty: Decimal,
    pub commission: Decimal,
    #[serde(default)]
    pub commission_asset: Option<String>,
    pub transact_time: DateTime<Utc>,
    pub dry_run: bool,
}

impl OrderResult {
    pub fn is_filled(&self) -> bool {
        self.executed_qty > Decimal::ZERO
            && matches!(
                self.status,
                OrderStatus::Filled | OrderStatus::PartiallyFilled | OrderStatus::ExpiredInMatch
            )
    }
}

/// Spot account balance for one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_entry_type_parsing() {
        assert_eq!("REALIZED_PNL".parse::<EntryType>().unwrap(), EntryType::RealizedPnl);
        assert_eq!("deposit".parse::<EntryType>().unwrap(), EntryType::Deposit);
        assert!("BONUS".parse::<EntryType>().is_err());
    }

    #[test]
    fn test_position_r_multiple_uses_initial_risk() {
        let mut pos = Position::open(
            "SOLUSDT",
            Direction::Long,
            dec!(150),
            dec!(1),
            dec!(148),
            dec!(154),
            None,
            Utc::now(),
        );
        assert_eq!(pos.initial_risk, dec!(2));
        assert_eq!(pos.r_multiple(dec!(152)), dec!(1));

        // Moving the stop does not change the R yardstick
        pos.stop_loss = dec!(150);
        assert_eq!(pos.r_multiple(dec!(152)), dec!(1));
    }

    #[test]
    fn test_short_position_sign() {
        let pos = Position::open(
            "BTCUSDT",
            Direction::Short,
            dec!(100),
            dec!(2),
            dec!(105),
            dec!(90),
            None,
            Utc::now(),
        );
        assert_eq!(pos.r_multiple(dec!(95)), dec!(1));
        assert_eq!(pos.unrealized_pnl(dec!(95)), dec!(10));
    }

    #[test]
    fn test_ledger_entry_serializes_type_key() {
        let entry = LedgerEntry {
            id: 1,
            timestamp: Utc::now(),
            entry_type: EntryType::Fee,
            amount: dec!(-0.1),
            balance_after: dec!(99.9),
            description: "fee".to_string(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "FEE");
    }
}
