//! Order executor
//!
//! Dry-run is the default: orders are filled synthetically at the last price
//! the decision loop noted, with no network call. Live mode submits market
//! orders through the shared exchange client.
//!
//! Callers quantize to the symbol's step size and check minimum notional
//! before calling. Nothing here retries an order.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::TradingMode;
use crate::error::ExchangeError;
use crate::exchange::ExchangeClient;
use crate::types::{OrderResult, OrderSide, OrderStatus};

pub struct OrderExecutor {
    mode: TradingMode,
    exchange: Arc<dyn ExchangeClient>,
    order_timeout: Duration,
    last_prices: Mutex<HashMap<String, Decimal>>,
}

impl OrderExecutor {
    pub fn new(mode: TradingMode, exchange: Arc<dyn ExchangeClient>, order_timeout: Duration) -> Self {
        info!("Order executor in {:?} mode (timeout {:?})", mode, order_timeout);
        Self {
            mode,
            exchange,
            order_timeout,
            last_prices: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    /// Record the latest observed price; dry-run fills happen here
    pub fn note_price(&self, symbol: &str, price: Decimal) {
        let mut prices = self.last_prices.lock().unwrap_or_else(|e| e.into_inner());
        prices.insert(symbol.to_string(), price);
    }

    pub fn last_price(&self, symbol: &str) -> Option<Decimal> {
        let prices = self.last_prices.lock().unwrap_or_else(|e| e.into_inner());
        prices.get(symbol).copied()
    }

    pub async fn place_market_order(
        &self,
        symbol: &str,
        quantity: Decimal,
        is_buy: bool,
    ) -> Result<OrderResult, ExchangeError> {
        if quantity <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder(format!(
                "quantity must be positive, got {}",
                quantity
            )));
        }
        let side = if is_buy { OrderSide::Buy } else { OrderSide::Sell };

        match self.mode {
            TradingMode::DryRun => self.simulate(symbol, side, quantity),
            TradingMode::Live => {
                match tokio::time::timeout(
                    self.order_timeout,
                    self.exchange.place_market_order(symbol, side, quantity),
                )
                .await
                {
                    Ok(Ok(result)) => {
                        info!(
                            "Order {} {} {} {}: status={:?} filled={} avg={}",
                            result.order_id,
                            side,
                            quantity,
                            symbol,
                            result.status,
                            result.executed_qty,
                            result.avg_price
                        );
                        Ok(result)
                    }
                    Ok(Err(e)) => {
                        error!("Order {} {} {} failed: {}", side, quantity, symbol, e);
                        Err(e)
                    }
                    Err(_) => {
                        // Outcome unknown; reconciliation is the operator's call
                        error!(
                            "Order {} {} {} timed out after {:?}, outcome unknown",
                            side, quantity, symbol, self.order_timeout
                        );
                        Err(ExchangeError::Timeout(self.order_timeout))
                    }
                }
            }
        }
    }

    fn simulate(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<OrderResult, ExchangeError> {
        let price = self.last_price(symbol).ok_or_else(|| {
            ExchangeError::InvalidOrder(format!("no price observed for {} yet", symbol))
        })?;

        info!("[DRY RUN] {} {} {} @ {}", side, quantity, symbol, price);
        Ok(OrderResult {
            order_id: format!("dry-{}", Uuid::new_v4()),
            symbol: symbol.to_string(),
            side,
            status: OrderStatus::Filled,
            executed_qty: quantity,
            avg_price: price,
            quote_qty: quantity * price,
            commission: Decimal::ZERO,
            commission_asset: None,
            transact_time: Utc::now(),
            dry_run: true,
        })
    }
}
