//! Entry signals

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::StrategySettings;
use crate::regime;
use crate::types::{Bar, Direction};

/// A proposed entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Name recorded in the audit log, e.g. "breakout_long"
    pub name: String,
    pub direction: Direction,
    /// Reference entry price (the signal bar's close)
    pub price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
}

impl Signal {
    pub fn risk_per_unit(&self) -> Decimal {
        (self.price - self.stop_loss).abs()
    }
}

/// Produces entry signals from closed bars
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;

    /// Evaluate the latest closed bar. `bars` is oldest first.
    fn evaluate(&self, symbol: &str, bars: &[Bar]) -> Option<Signal>;
}

/// Close above the highest high of the prior `lookback` bars
#[derive(Debug, Clone)]
pub struct BreakoutSignal {
    pub lookback: usize,
    pub atr_period: usize,
    pub atr_mult: f64,
    pub reward_r: f64,
}

impl BreakoutSignal {
    pub fn new(lookback: usize, atr_mult: f64, reward_r: f64) -> Self {
        Self {
            lookback: lookback.max(1),
            atr_period: regime::ADX_PERIOD,
            atr_mult,
            reward_r,
        }
    }

    pub fn from_settings(settings: &StrategySettings) -> Self {
        Self::new(settings.lookback, settings.atr_mult, settings.reward_r)
    }
}

impl SignalSource for BreakoutSignal {
    fn name(&self) -> &str {
        "breakout"
    }

    fn evaluate(&self, _symbol: &str, bars: &[Bar]) -> Option<Signal> {
        if bars.len() < self.lookback + 1 {
            return None;
        }
        let (last, prior) = bars.split_last()?;
        let window = &prior[prior.len() - self.lookback..];
        let highest = window.iter().map(|b| b.high).max()?;

        if last.close <= highest {
            return None;
        }

        let atr = regime::atr(bars, self.atr_period)?;
        let stop_distance = Decimal::from_f64(atr * self.atr_mult)?.round_dp(8);
        if stop_distance <= Decimal::ZERO {
            return None;
        }
        let stop_loss = last.close - stop_distance;
        if stop_loss <= Decimal::ZERO {
            return None;
        }
        let reward = Decimal::from_f64(self.reward_r)?;
        let take_profit = last.close + stop_distance * reward;

        Some(Signal {
            name: "breakout_long".to_string(),
            direction: Direction::Long,
            price: last.close,
            stop_loss,
            take_profit,
        })
    }
}

/// Risk-based size: `risk_capital / risk_per_unit`, capped by `max_notional / price`
pub fn position_size(
    risk_capital: Decimal,
    risk_per_unit: Decimal,
    max_notional: Decimal,
    price: Decimal,
) -> Decimal {
    if risk_per_unit <= Decimal::ZERO || price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let by_risk = risk_capital / risk_per_unit;
    let by_notional = max_notional / price;
    by_risk.min(by_notional).max(Decimal::ZERO)
}

/// Convenience for log lines
pub fn signal_summary(signal: &Signal) -> String {
    format!(
        "{} {} @ {} stop {} target {} (risk/unit {:.4})",
        signal.name,
        signal.direction,
        signal.price,
        signal.stop_loss,
        signal.take_profit,
        signal.risk_per_unit().to_f64().unwrap_or(0.0)
    )
}
