//! Exchange access
//!
//! One [`ExchangeClient`] instance is shared (`Arc`) by the decision loop,
//! the order executor and the peg watchdog so that rate limiting applies to
//! the whole process.

pub mod binance;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::amount::SymbolFilters;
use crate::error::ExchangeError;
use crate::types::{AccountBalance, Bar, KlineEvent, OrderResult, OrderSide};

pub use binance::{BinanceClient, Credentials};

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Most recent `limit` bars, oldest first
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Bar>, ExchangeError>;

    /// Last traded price
    async fn get_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Submit a market order. Never retried by the implementation.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderResult, ExchangeError>;

    async fn get_account_balances(&self) -> Result<Vec<AccountBalance>, ExchangeError>;

    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError>;

    /// Live kline updates for one symbol. The stream ends when the receiver
    /// is dropped.
    async fn stream_klines(
        &self,
        symbol: &str,
        interval: &str,
    ) -> Result<mpsc::Receiver<KlineEvent>, ExchangeError>;
}
