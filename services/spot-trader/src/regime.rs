//! Market regime classification
//!
//! Average Directional Index over OHLC bars. All smoothing is Wilder-style:
//! an exponential average with alpha = 1/period seeded at the first value.
//! Pure functions, no I/O.

use crate::types::{Bar, Regime};

/// ADX look-back
pub const ADX_PERIOD: usize = 14;

/// Below this many bars the classifier reports RANGING
pub const MIN_BARS: usize = 20;

/// Label the latest bar TRENDING when ADX exceeds `adx_threshold`.
///
/// Fewer than [`MIN_BARS`] bars is not an error: the result is RANGING.
pub fn classify(bars: &[Bar], adx_threshold: f64) -> Regime {
    if bars.len() < MIN_BARS {
        return Regime::Ranging;
    }
    match adx(bars, ADX_PERIOD) {
        Some(value) if value > adx_threshold => Regime::Trending,
        _ => Regime::Ranging,
    }
}

/// Latest ADX value, or `None` without at least `period + 1` bars
pub fn adx(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let alpha = 1.0 / period as f64;
    let mut tr_avg = Wilder::new(alpha);
    let mut plus_avg = Wilder::new(alpha);
    let mut minus_avg = Wilder::new(alpha);
    let mut adx_avg = Wilder::new(alpha);

    for pair in bars.windows(2) {
        let (prev_high, prev_low, prev_close) = pair[0].hlc();
        let (high, low, _) = pair[1].hlc();

        let up = high - prev_high;
        let down = prev_low - low;
        let plus_dm = if up > down && up > 0.0 { up } else { 0.0 };
        let minus_dm = if down > up && down > 0.0 { down } else { 0.0 };

        let tr = true_range(high, low, prev_close);
        let tr_s = tr_avg.push(tr);
        let plus_s = plus_avg.push(plus_dm);
        let minus_s = minus_avg.push(minus_dm);

        let (plus_di, minus_di) = if tr_s > 0.0 {
            (100.0 * plus_s / tr_s, 100.0 * minus_s / tr_s)
        } else {
            (0.0, 0.0)
        };
        let di_sum = plus_di + minus_di;
        let dx = if di_sum > 0.0 {
            100.0 * (plus_di - minus_di).abs() / di_sum
        } else {
            0.0
        };
        adx_avg.push(dx);
    }

    adx_avg.value()
}

/// Latest Average True Range, or `None` without at least `period + 1` bars
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut avg = Wilder::new(1.0 / period as f64);
    for pair in bars.windows(2) {
        let (_, _, prev_close) = pair[0].hlc();
        let (high, low, _) = pair[1].hlc();
        avg.push(true_range(high, low, prev_close));
    }
    avg.value()
}

/// ATR as a fraction of the last close; 0.0 when it cannot be computed
pub fn volatility(bars: &[Bar], period: usize) -> f64 {
    let Some(last) = bars.last() else {
        return 0.0;
    };
    let (_, _, close) = last.hlc();
    match atr(bars, period) {
        Some(value) if close > 0.0 => value / close,
        _ => 0.0,
    }
}

fn true_range(high: f64, low: f64, prev_close: f64) -> f64 {
    (high - low)
        .max((high - prev_close).abs())
        .max((low - prev_close).abs())
}

/// Exponential average seeded with its first sample
struct Wilder {
    alpha: f64,
    value: Option<f64>,
}

impl Wilder {
    fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    fn push(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(prev) => prev + self.alpha * (sample - prev),
            None => sample,
        };
        self.value = Some(next);
        next
    }

    fn value(&self) -> Option<f64> {
        self.value
    }
}
