//! Position lifecycle state machine
//!
//! OPEN_FULL -> OPEN_PARTIAL -> CLOSED, driven one tick at a time.
//!
//! - OPEN_FULL at +1R: half the position is taken off, the stop moves to
//!   entry and the partial PnL is realized immediately.
//! - Either open state: the target or the authoritative stop closes the
//!   remainder.
//! - A configured trailing stop activates once price crosses its activation
//!   level and then only ever ratchets in the favorable direction.
//!
//! [`evaluate`] decides; the caller executes the order and then applies the
//! actual fill with [`apply_partial`] or [`close`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::types::{ExitReason, Position, PositionState, TradeRecord};

/// Favorable move, in R, that triggers the partial exit
pub const PARTIAL_TRIGGER_R: Decimal = Decimal::ONE;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Tick at or before the last applied tick; nothing changed
    Stale,
    Hold { trailing_moved: bool },
    TakePartial { quantity: Decimal, price: Decimal },
    Close { price: Decimal, reason: ExitReason },
}

/// Result of [`close`]
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub record: TradeRecord,
    /// PnL of the final exit only; partial exits were realized earlier
    pub final_pnl: Decimal,
}

/// Decide what `price` at `at` means for an open position.
///
/// Records the tick time and ratchets the trailing stop. Exit conditions are
/// checked before the partial trigger.
pub fn evaluate(position: &mut Position, price: Decimal, at: DateTime<Utc>) -> Decision {
    if !position.is_open() {
        return Decision::Stale;
    }
    if position.last_tick_at.is_some_and(|last| at <= last) {
        return Decision::Stale;
    }
    position.last_tick_at = Some(at);

    let trailing_moved = ratchet_trailing(position, price);

    if let Some(reason) = exit_reason(position, price) {
        return Decision::Close { price, reason };
    }

    if position.state == PositionState::OpenFull && position.r_multiple(price) >= PARTIAL_TRIGGER_R {
        return Decision::TakePartial {
            quantity: position.quantity / Decimal::TWO,
            price,
        };
    }

    Decision::Hold { trailing_moved }
}

fn exit_reason(position: &Position, price: Decimal) -> Option<ExitReason> {
    let long = position.direction.sign().is_sign_positive();
    let stop = position.authoritative_stop();
    let stopped = if long { price <= stop } else { price >= stop };
    if stopped {
        return Some(if position.trailing_stop.is_some() {
            ExitReason::TrailingStop
        } else {
            ExitReason::StopLoss
        });
    }

    let target_hit = if long {
        price >= position.take_profit
    } else {
        price <= position.take_profit
    };
    target_hit.then_some(ExitReason::TakeProfit)
}

/// Move the trailing stop toward price; returns whether it moved
fn ratchet_trailing(position: &mut Position, price: Decimal) -> bool {
    let Some(config) = position.trailing else {
        return false;
    };
    let long = position.direction.sign().is_sign_positive();

    let active = position.trailing_stop.is_some()
        || if long {
            price >= config.activation_price
        } else {
            price <= config.activation_price
        };
    if !active {
        return false;
    }

    // Never looser than the fixed stop
    let candidate = if long {
        (price - config.distance).max(position.stop_loss)
    } else {
        (price + config.distance).min(position.stop_loss)
    };

    let improves = match position.trailing_stop {
        None => true,
        Some(current) if long => candidate > current,
        Some(current) => candidate < current,
    };
    if improves {
        position.trailing_stop = Some(candidate);
    }
    improves
}

/// Apply a partial fill: realize its PnL, move the stop to entry and enter
/// OPEN_PARTIAL. Returns the realized PnL.
///
/// A zero fill (quantity below exchange minimums) still moves the stop to
/// break-even so the trigger is not re-evaluated forever.
pub fn apply_partial(position: &mut Position, filled_qty: Decimal, fill_price: Decimal) -> Decimal {
    let filled = filled_qty.min(position.quantity).max(Decimal::ZERO);
    let pnl = (fill_price - position.entry_price) * position.direction.sign() * filled;

    position.quantity -= filled;
    position.realized_pnl += pnl;
    position.stop_loss = position.entry_price;
    if let Some(trailing) = position.trailing_stop {
        position.trailing_stop = Some(if position.direction.sign().is_sign_positive() {
            trailing.max(position.entry_price)
        } else {
            trailing.min(position.entry_price)
        });
    }
    position.state = PositionState::OpenPartial;
    pnl
}

/// Close the remainder at `exit_price`
pub fn close(
    position: &mut Position,
    exit_price: Decimal,
    at: DateTime<Utc>,
    reason: ExitReason,
) -> ClosedTrade {
    let final_pnl = position.unrealized_pnl(exit_price);
    position.realized_pnl += final_pnl;
    position.state = PositionState::Closed;

    ClosedTrade {
        record: TradeRecord {
            position_id: position.id,
            symbol: position.symbol.clone(),
            direction: position.direction,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.original_quantity,
            realized_pnl: position.realized_pnl,
            entry_time: position.entry_time,
            exit_time: at,
            exit_reason: reason,
        },
        final_pnl,
    }
}

/// What [`on_tick`] did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Ignored,
    Held,
    Partial { quantity: Decimal, pnl: Decimal },
    Closed(ClosedTrade),
}

/// Evaluate and apply in one step, filling at the tick price.
///
/// Used where no exchange sits in between, such as backtests.
pub fn on_tick(position: &mut Position, price: Decimal, at: DateTime<Utc>) -> TickOutcome {
    match evaluate(position, price, at) {
        Decision::Stale => TickOutcome::Ignored,
        Decision::Hold { .. } => TickOutcome::Held,
        Decision::TakePartial { quantity, price } => {
            let pnl = apply_partial(position, quantity, price);
            TickOutcome::Partial { quantity, pnl }
        }
        Decision::Close { price, reason } => TickOutcome::Closed(close(position, price, at, reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, TrailingConfig};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn sol_long() -> Position {
        Position::open(
            "SOLUSDT",
            Direction::Long,
            dec!(150),
            dec!(1),
            dec!(148),
            dec!(156),
            None,
            t(0),
        )
    }

    #[test]
    fn test_partial_at_one_r_moves_stop_to_entry() {
        let mut pos = sol_long();

        let decision = evaluate(&mut pos, dec!(152), t(1));
        assert_eq!(
            decision,
            Decision::TakePartial {
                quantity: dec!(0.5),
                price: dec!(152)
            }
        );

        let pnl = apply_partial(&mut pos, dec!(0.5), dec!(152));
        assert_eq!(pnl, dec!(1));
        assert_eq!(pos.state, PositionState::OpenPartial);
        assert_eq!(pos.quantity, dec!(0.5));
        assert_eq!(pos.stop_loss, dec!(150));
        assert_eq!(pos.realized_pnl, dec!(1));
    }

    #[test]
    fn test_replayed_tick_is_ignored() {
        let mut pos = sol_long();
        assert!(matches!(on_tick(&mut pos, dec!(152), t(1)), TickOutcome::Partial { .. }));
        let after_first = pos.clone();

        assert_eq!(on_tick(&mut pos, dec!(152), t(1)), TickOutcome::Ignored);
        assert_eq!(on_tick(&mut pos, dec!(152), t(0)), TickOutcome::Ignored);
        assert_eq!(pos, after_first);

        // A later tick at the same price does not take a second partial
        assert_eq!(on_tick(&mut pos, dec!(152), t(2)), TickOutcome::Held);
        assert_eq!(pos.quantity, dec!(0.5));
    }

    #[test]
    fn test_below_one_r_holds() {
        let mut pos = sol_long();
        assert_eq!(
            evaluate(&mut pos, dec!(151.99), t(1)),
            Decision::Hold { trailing_moved: false }
        );
        assert_eq!(pos.state, PositionState::OpenFull);
    }

    #[test]
    fn test_stop_and_target_close() {
        let mut pos = sol_long();
        match on_tick(&mut pos, dec!(147.5), t(1)) {
            TickOutcome::Closed(closed) => {
                assert_eq!(closed.record.exit_reason, ExitReason::StopLoss);
                assert_eq!(closed.final_pnl, dec!(-2.5));
                assert_eq!(closed.record.realized_pnl, dec!(-2.5));
            }
            other => panic!("expected close, got {:?}", other),
        }
        assert_eq!(pos.state, PositionState::Closed);
        assert_eq!(on_tick(&mut pos, dec!(140), t(2)), TickOutcome::Ignored);

        let mut pos = sol_long();
        on_tick(&mut pos, dec!(152), t(1));
        match on_tick(&mut pos, dec!(157), t(2)) {
            TickOutcome::Closed(closed) => {
                assert_eq!(closed.record.exit_reason, ExitReason::TakeProfit);
                assert_eq!(closed.final_pnl, dec!(3.5));
                // 1.0 from the partial + 3.5 from the remainder
                assert_eq!(closed.record.realized_pnl, dec!(4.5));
                assert_eq!(closed.record.quantity, dec!(1));
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[test]
    fn test_break_even_stop_after_partial() {
        let mut pos = sol_long();
        on_tick(&mut pos, dec!(152), t(1));
        match on_tick(&mut pos, dec!(150), t(2)) {
            TickOutcome::Closed(closed) => {
                assert_eq!(closed.record.exit_reason, ExitReason::StopLoss);
                assert_eq!(closed.final_pnl, dec!(0));
                assert_eq!(closed.record.realized_pnl, dec!(1));
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[test]
    fn test_gap_through_stop_closes_before_partial() {
        // A tick that is both past target and beyond 1R closes outright
        let mut pos = sol_long();
        match on_tick(&mut pos, dec!(160), t(1)) {
            TickOutcome::Closed(closed) => {
                assert_eq!(closed.record.exit_reason, ExitReason::TakeProfit);
                assert_eq!(closed.final_pnl, dec!(10));
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_stop_ratchets_and_never_retreats() {
        let mut pos = Position::open(
            "BTCUSDT",
            Direction::Long,
            dec!(100),
            dec!(2),
            dec!(95),
            dec!(200),
            Some(TrailingConfig {
                activation_price: dec!(103),
                distance: dec!(4),
            }),
            t(0),
        );

        // Not yet active
        evaluate(&mut pos, dec!(102), t(1));
        assert_eq!(pos.trailing_stop, None);

        // Activates; 103 - 4 = 99, tighter than 95
        assert_eq!(evaluate(&mut pos, dec!(103), t(2)), Decision::Hold { trailing_moved: true });
        assert_eq!(pos.trailing_stop, Some(dec!(99)));

        // Price pulls back: stop stays
        assert_eq!(evaluate(&mut pos, dec!(101), t(3)), Decision::Hold { trailing_moved: false });
        assert_eq!(pos.trailing_stop, Some(dec!(99)));

        // 1R is 5; 105 triggers the partial and the trail moves to 101
        let decision = evaluate(&mut pos, dec!(105), t(4));
        assert!(matches!(decision, Decision::TakePartial { .. }));
        assert_eq!(pos.trailing_stop, Some(dec!(101)));
        apply_partial(&mut pos, dec!(1), dec!(105));

        evaluate(&mut pos, dec!(110), t(5));
        assert_eq!(pos.trailing_stop, Some(dec!(106)));

        match on_tick(&mut pos, dec!(106), t(6)) {
            TickOutcome::Closed(closed) => {
                assert_eq!(closed.record.exit_reason, ExitReason::TrailingStop);
                assert_eq!(closed.record.realized_pnl, dec!(11));
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_never_looser_than_fixed_stop() {
        let mut pos = Position::open(
            "BTCUSDT",
            Direction::Long,
            dec!(100),
            dec!(1),
            dec!(98),
            dec!(200),
            Some(TrailingConfig {
                activation_price: dec!(100.5),
                distance: dec!(5),
            }),
            t(0),
        );
        evaluate(&mut pos, dec!(100.5), t(1));
        assert_eq!(pos.trailing_stop, Some(dec!(98)));
    }

    #[test]
    fn test_short_position_lifecycle() {
        let mut pos = Position::open(
            "ETHUSDT",
            Direction::Short,
            dec!(2000),
            dec!(1),
            dec!(2040),
            dec!(1900),
            None,
            t(0),
        );
        match on_tick(&mut pos, dec!(1960), t(1)) {
            TickOutcome::Partial { quantity, pnl } => {
                assert_eq!(quantity, dec!(0.5));
                assert_eq!(pnl, dec!(20));
            }
            other => panic!("expected partial, got {:?}", other),
        }
        assert_eq!(pos.stop_loss, dec!(2000));

        match on_tick(&mut pos, dec!(2001), t(2)) {
            TickOutcome::Closed(closed) => {
                assert_eq!(closed.record.exit_reason, ExitReason::StopLoss);
                assert_eq!(closed.record.realized_pnl, dec!(19.5));
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_partial_fill_only_moves_stop() {
        let mut pos = sol_long();
        evaluate(&mut pos, dec!(152), t(1));
        assert_eq!(apply_partial(&mut pos, dec!(0), dec!(152)), dec!(0));
        assert_eq!(pos.quantity, dec!(1));
        assert_eq!(pos.stop_loss, dec!(150));
        assert_eq!(pos.state, PositionState::OpenPartial);
    }
}
