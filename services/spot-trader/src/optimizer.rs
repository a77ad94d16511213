//! Offline strategy parameter optimizer
//!
//! Grid search over a parameter space. Each combination runs against its own
//! simulation state, never the live stores.

use chrono::Duration;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::{RiskSettings, StrategySettings};
use crate::lifecycle::{self, TickOutcome};
use crate::strategy::{position_size, BreakoutSignal, SignalSource};
use crate::types::{Bar, Position};

/// One combination: parameter name -> value
pub type ParameterSet = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestReport {
    pub params: ParameterSet,
    /// Gross profit / gross loss; infinite with profits and no losses
    pub profit_factor: f64,
    pub win_rate: f64,
    /// Largest peak-to-trough equity drop, as a fraction of the peak
    pub max_drawdown: f64,
    pub trades: usize,
    pub net_pnl: f64,
}

/// Runs one backtest for one parameter set
pub trait BacktestRunner: Send + Sync {
    fn run(&self, params: &ParameterSet) -> BacktestReport;

    /// Whether `name` changes anything in [`BacktestRunner::run`]
    fn accepts_parameter(&self, _name: &str) -> bool {
        true
    }
}

pub struct StrategyOptimizer<R> {
    runner: R,
}

impl<R: BacktestRunner> StrategyOptimizer<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// One report per combination, best profit factor first
    pub fn run(&self, space: &BTreeMap<String, Vec<f64>>) -> Vec<BacktestReport> {
        for name in self.unknown_parameters(space) {
            warn!("Optimizer: parameter '{}' is not used by the backtest", name);
        }
        let combinations = cartesian_product(space);
        info!("Optimizer: {} parameter combinations", combinations.len());

        let mut reports: Vec<BacktestReport> = combinations
            .iter()
            .map(|params| {
                let report = self.runner.run(params);
                debug!(
                    "Backtest {:?}: pf={:.3} win={:.2} dd={:.3} trades={}",
                    params, report.profit_factor, report.win_rate, report.max_drawdown, report.trades
                );
                report
            })
            .collect();

        reports.sort_by(|a, b| by_profit_factor_desc(a.profit_factor, b.profit_factor));
        reports
    }

    /// Names in `space` the runner would silently ignore
    pub fn unknown_parameters(&self, space: &BTreeMap<String, Vec<f64>>) -> Vec<String> {
        space
            .keys()
            .filter(|name| !self.runner.accepts_parameter(name))
            .cloned()
            .collect()
    }
}

/// Descending, NaN last
fn by_profit_factor_desc(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.total_cmp(&a),
    }
}

/// Every combination of the given values. An empty space, or any parameter
/// with no candidates, yields nothing.
pub fn cartesian_product(space: &BTreeMap<String, Vec<f64>>) -> Vec<ParameterSet> {
    if space.is_empty() || space.values().any(|v| v.is_empty()) {
        return Vec::new();
    }

    let mut combinations = vec![ParameterSet::new()];
    for (name, values) in space {
        combinations = combinations
            .into_iter()
            .flat_map(|partial| {
                values.iter().map(move |value| {
                    let mut next = partial.clone();
                    next.insert(name.clone(), *value);
                    next
                })
            })
            .collect();
    }
    combinations
}

/// Replays bars through the breakout signal and the lifecycle state machine
/// on a private in-memory book.
///
/// Recognized parameters: `lookback`, `atr_mult` (or `mult`), `reward_r`,
/// `risk_per_trade_pct`. Missing ones fall back to the configured defaults.
pub struct SimulatedBacktest {
    bars: Vec<Bar>,
    starting_capital: Decimal,
    defaults: StrategySettings,
    risk: RiskSettings,
}

impl SimulatedBacktest {
    pub fn new(
        bars: Vec<Bar>,
        starting_capital: Decimal,
        defaults: StrategySettings,
        risk: RiskSettings,
    ) -> Self {
        Self {
            bars,
            starting_capital,
            defaults,
            risk,
        }
    }
}

/// Parameter names with their aliases
const SIMULATED_PARAMETERS: &[(&str, &[&str])] = &[
    ("lookback", &[]),
    ("atr_mult", &["mult"]),
    ("reward_r", &[]),
    ("risk_per_trade_pct", &[]),
];

fn simulated_parameter(params: &ParameterSet, name: &str) -> Option<f64> {
    let aliases = SIMULATED_PARAMETERS
        .iter()
        .find(|(canonical, _)| *canonical == name)
        .map(|(_, aliases)| *aliases)
        .unwrap_or(&[]);
    params
        .get(name)
        .or_else(|| aliases.iter().find_map(|alias| params.get(*alias)))
        .copied()
}

impl BacktestRunner for SimulatedBacktest {
    fn run(&self, params: &ParameterSet) -> BacktestReport {
        let lookback = simulated_parameter(params, "lookback")
            .map(|v| v.round().max(1.0) as usize)
            .unwrap_or(self.defaults.lookback);
        let atr_mult = simulated_parameter(params, "atr_mult").unwrap_or(self.defaults.atr_mult);
        let reward_r = simulated_parameter(params, "reward_r").unwrap_or(self.defaults.reward_r);
        let risk_pct = simulated_parameter(params, "risk_per_trade_pct")
            .and_then(|v| Decimal::try_from(v).ok())
            .unwrap_or(self.risk.risk_per_trade_pct);

        let signal_source = BreakoutSignal::new(lookback, atr_mult, reward_r);
        let mut equity = self.starting_capital;
        let mut peak = equity;
        let mut max_drawdown = 0.0_f64;
        let mut gross_profit = Decimal::ZERO;
        let mut gross_loss = Decimal::ZERO;
        let mut wins = 0usize;
        let mut trades = 0usize;
        let mut open: Option<Position> = None;

        for i in 0..self.bars.len() {
            let bar = &self.bars[i];

            if let Some(position) = open.as_mut() {
                // Adverse extreme first
                let ticks = if position.direction.sign().is_sign_positive() {
                    [bar.low, bar.high, bar.close]
                } else {
                    [bar.high, bar.low, bar.close]
                };
                for (n, price) in ticks.into_iter().enumerate() {
                    let at = bar.open_time + Duration::seconds(n as i64 + 1);
                    match lifecycle::on_tick(position, price, at) {
                        TickOutcome::Partial { pnl, .. } => equity += pnl,
                        TickOutcome::Closed(closed) => {
                            equity += closed.final_pnl;
                            trades += 1;
                            let pnl = closed.record.realized_pnl;
                            if pnl > Decimal::ZERO {
                                wins += 1;
                                gross_profit += pnl;
                            } else {
                                gross_loss += -pnl;
                            }
                            break;
                        }
                        TickOutcome::Held | TickOutcome::Ignored => {}
                    }
                }
                if !position.is_open() {
                    open = None;
                }
            }

            if equity > peak {
                peak = equity;
            }
            if peak > Decimal::ZERO {
                let drawdown = ((peak - equity) / peak).to_f64().unwrap_or(0.0);
                max_drawdown = max_drawdown.max(drawdown);
            }

            if open.is_none() {
                if let Some(signal) = signal_source.evaluate("BACKTEST", &self.bars[..=i]) {
                    let risk_capital = equity * risk_pct / Decimal::ONE_HUNDRED;
                    let max_notional =
                        equity * self.risk.max_position_pct / Decimal::ONE_HUNDRED;
                    let qty = position_size(
                        risk_capital,
                        signal.risk_per_unit(),
                        max_notional,
                        signal.price,
                    );
                    if qty > Decimal::ZERO {
                        open = Some(Position::open(
                            "BACKTEST",
                            signal.direction,
                            signal.price,
                            qty,
                            signal.stop_loss,
                            signal.take_profit,
                            None,
                            bar.close_time,
                        ));
                    }
                }
            }
        }

        let profit_factor = if gross_loss > Decimal::ZERO {
            (gross_profit / gross_loss).to_f64().unwrap_or(0.0)
        } else if gross_profit > Decimal::ZERO {
            f64::INFINITY
        } else {
            0.0
        };

        BacktestReport {
            params: params.clone(),
            profit_factor,
            win_rate: if trades > 0 {
                wins as f64 / trades as f64
            } else {
                0.0
            },
            max_drawdown,
            trades,
            net_pnl: (equity - self.starting_capital).to_f64().unwrap_or(0.0),
        }
    }

    fn accepts_parameter(&self, name: &str) -> bool {
        SIMULATED_PARAMETERS
            .iter()
            .any(|(canonical, aliases)| *canonical == name || aliases.iter().any(|a| *a == name))
    }
}
