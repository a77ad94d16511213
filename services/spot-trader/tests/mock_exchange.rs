//! Scripted exchange and price venue for running the orchestrator offline

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use spot_trader::{
    amount::SymbolFilters,
    error::ExchangeError,
    exchange::ExchangeClient,
    oracle::PriceVenue,
    types::{AccountBalance, Bar, KlineEvent, OrderResult, OrderSide, OrderStatus},
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

pub const SYMBOL: &str = "SOLUSDT";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
}

pub fn bar_at(index: i64, high: Decimal, low: Decimal, close: Decimal) -> Bar {
    let open_time = t0() + Duration::minutes(15 * index);
    Bar {
        open_time,
        close_time: open_time + Duration::minutes(15) - Duration::milliseconds(1),
        open: close,
        high,
        low,
        close,
        volume: dec!(1000),
    }
}

/// 30 quiet bars around 100
pub fn flat_history() -> Vec<Bar> {
    (0..30).map(|i| bar_at(i, dec!(101), dec!(99), dec!(100))).collect()
}

/// Closed bar 30 breaking out to 110
pub fn breakout_event() -> KlineEvent {
    let bar = bar_at(30, dec!(111), dec!(100), dec!(110));
    KlineEvent {
        symbol: SYMBOL.to_string(),
        event_time: bar.close_time,
        bar,
        is_closed: true,
    }
}

/// In-progress update of bar 31
pub fn tick_event(seconds_in: i64, close: Decimal) -> KlineEvent {
    let bar = bar_at(31, close.max(dec!(110)), dec!(110), close);
    KlineEvent {
        symbol: SYMBOL.to_string(),
        event_time: bar.open_time + Duration::seconds(seconds_in),
        bar,
        is_closed: false,
    }
}

pub struct MockExchange {
    history: Vec<Bar>,
    events: Mutex<Vec<KlineEvent>>,
    peg_price: Decimal,
    /// Keep streams open after the scripted events
    hold_open: bool,
    held: Mutex<Vec<mpsc::Sender<KlineEvent>>>,
    /// One price per order to fill; orders are rejected once it runs dry
    fill_prices: Mutex<VecDeque<Decimal>>,
    /// Fraction charged in the received asset, like a spot taker fee
    commission_rate: Decimal,
    pub order_calls: AtomicUsize,
    /// Every order request as (side, quantity)
    pub orders: Mutex<Vec<(OrderSide, Decimal)>>,
}

impl MockExchange {
    pub fn new(history: Vec<Bar>, events: Vec<KlineEvent>, peg_price: Decimal) -> Self {
        Self {
            history,
            events: Mutex::new(events),
            peg_price,
            hold_open: false,
            held: Mutex::new(Vec::new()),
            fill_prices: Mutex::new(VecDeque::new()),
            commission_rate: Decimal::ZERO,
            order_calls: AtomicUsize::new(0),
            orders: Mutex::new(Vec::new()),
        }
    }

    /// Fill the next orders at these prices
    pub fn filling_at(mut self, prices: Vec<Decimal>) -> Self {
        self.fill_prices = Mutex::new(prices.into());
        self
    }

    pub fn with_commission(mut self, rate: Decimal) -> Self {
        self.commission_rate = rate;
        self
    }

    pub fn sent_orders(&self) -> Vec<(OrderSide, Decimal)> {
        self.orders.lock().unwrap().clone()
    }

    pub fn holding_streams_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn get_klines(&self, _: &str, _: &str, limit: usize) -> Result<Vec<Bar>, ExchangeError> {
        let skip = self.history.len().saturating_sub(limit);
        Ok(self.history[skip..].to_vec())
    }

    async fn get_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.peg_price)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        let n = self.order_calls.fetch_add(1, Ordering::SeqCst);
        self.orders.lock().unwrap().push((side, quantity));

        let Some(price) = self.fill_prices.lock().unwrap().pop_front() else {
            return Err(ExchangeError::InvalidOrder(format!(
                "mock exchange does not take orders for {}",
                symbol
            )));
        };

        let quote_qty = quantity * price;
        let (commission, asset) = match side {
            OrderSide::Buy => (
                quantity * self.commission_rate,
                symbol.trim_end_matches("USDT"),
            ),
            OrderSide::Sell => (quote_qty * self.commission_rate, "USDT"),
        };
        Ok(OrderResult {
            order_id: format!("mock-{}", n + 1),
            symbol: symbol.to_string(),
            side,
            status: OrderStatus::Filled,
            executed_qty: quantity,
            avg_price: price,
            quote_qty,
            commission,
            commission_asset: Some(asset.to_string()),
            transact_time: Utc::now(),
            dry_run: false,
        })
    }

    async fn get_account_balances(&self) -> Result<Vec<AccountBalance>, ExchangeError> {
        Ok(vec![AccountBalance {
            asset: "USDT".to_string(),
            free: dec!(1000),
            locked: Decimal::ZERO,
        }])
    }

    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        Ok(SymbolFilters {
            symbol: symbol.to_string(),
            step_size: dec!(0.001),
            tick_size: dec!(0.01),
            min_qty: dec!(0.001),
            min_notional: dec!(5),
        })
    }

    async fn stream_klines(
        &self,
        symbol: &str,
        _interval: &str,
    ) -> Result<mpsc::Receiver<KlineEvent>, ExchangeError> {
        let events: Vec<KlineEvent> = {
            let mut queued = self.events.lock().unwrap();
            let (mine, rest) = queued.drain(..).partition(|e| e.symbol == symbol);
            *queued = rest;
            mine
        };

        let (tx, rx) = mpsc::channel(events.len() + 1);
        for event in events {
            tx.try_send(event).unwrap();
        }
        if self.hold_open {
            self.held.lock().unwrap().push(tx);
        }
        Ok(rx)
    }
}

/// Secondary venue quoting a fixed price
pub struct FixedVenue(pub Decimal);

#[async_trait]
impl PriceVenue for FixedVenue {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn spot_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.0)
    }
}
