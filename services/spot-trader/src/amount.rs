//! Amount handling: exchange precision filters and quantization
//!
//! Live orders must respect the exchange's per-symbol filters. Callers
//! quantize quantities down to the step size and check minimum notional
//! before handing an order to the executor.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Exchange-published precision filters for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub symbol: String,
    /// Quantity increment (LOT_SIZE stepSize)
    pub step_size: Decimal,
    /// Price increment (PRICE_FILTER tickSize)
    pub tick_size: Decimal,
    /// Minimum order quantity (LOT_SIZE minQty)
    pub min_qty: Decimal,
    /// Minimum order value, price x quantity
    pub min_notional: Decimal,
}

/// Why a quantized order cannot be submitted
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterViolation {
    #[error("quantity {quantity} rounds to zero at step {step}")]
    ZeroQuantity { quantity: Decimal, step: Decimal },

    #[error("quantity {quantity} below minimum {min_qty}")]
    BelowMinQty { quantity: Decimal, min_qty: Decimal },

    #[error("notional {notional} below minimum {min_notional}")]
    BelowMinNotional {
        notional: Decimal,
        min_notional: Decimal,
    },
}

/// Round `value` down to a multiple of `step`.
///
/// A zero or negative step leaves the value untouched.
pub fn quantize_down(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO || value <= Decimal::ZERO {
        return value.max(Decimal::ZERO);
    }
    let steps = (value / step).floor();
    (steps * step).normalize()
}

impl SymbolFilters {
    /// Quantize an order quantity down to the step size
    pub fn quantize_qty(&self, quantity: Decimal) -> Decimal {
        quantize_down(quantity, self.step_size)
    }

    /// Quantize a price down to the tick size
    pub fn quantize_price(&self, price: Decimal) -> Decimal {
        quantize_down(price, self.tick_size)
    }

    /// Check an already-quantized quantity at the expected fill price
    pub fn validate(&self, quantity: Decimal, price: Decimal) -> Result<(), FilterViolation> {
        if quantity <= Decimal::ZERO {
            return Err(FilterViolation::ZeroQuantity {
                quantity,
                step: self.step_size,
            });
        }
        if quantity < self.min_qty {
            return Err(FilterViolation::BelowMinQty {
                quantity,
                min_qty: self.min_qty,
            });
        }
        let notional = quantity * price;
        if notional < self.min_notional {
            return Err(FilterViolation::BelowMinNotional {
                notional,
                min_notional: self.min_notional,
            });
        }
        Ok(())
    }

    /// Quantize and validate in one step
    pub fn prepare(&self, quantity: Decimal, price: Decimal) -> Result<Decimal, FilterViolation> {
        let qty = self.quantize_qty(quantity);
        self.validate(qty, price)?;
        Ok(qty)
    }
}

/// Split a spot symbol into (base, quote), e.g. "SOLUSDT" -> ("SOL", "USDT")
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    const QUOTES: [&str; 6] = ["USDT", "USDC", "FDUSD", "BUSD", "USD", "BTC"];
    QUOTES.iter().find_map(|quote| {
        symbol
            .strip_suffix(quote)
            .filter(|base| !base.is_empty())
            .map(|base| (base, *quote))
    })
}
