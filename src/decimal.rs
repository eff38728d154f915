// ─────────────────────────────────────────────────────────────────────────────
// decimal.rs — tick/lot snapping over fixed-precision decimal
//
// All order-path price/qty values go through here on the way to and from the
// exchange. Snapping is directional: BUY prices round down (never overpay the
// limit), SELL prices round up (never undersell the limit), quantities always
// round down (never send more size than was actually computed).
// ─────────────────────────────────────────────────────────────────────────────
use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;

use crate::grid_level::Side;

/// Rounds `value` down to the nearest multiple of `step` (step > 0).
fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).round_dp_with_strategy(0, RoundingStrategy::ToZero) * step
}

/// Rounds `value` up to the nearest multiple of `step` (step > 0).
fn ceil_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    let quotient = value / step;
    let truncated = quotient.round_dp_with_strategy(0, RoundingStrategy::ToZero);
    if truncated == quotient {
        truncated * step
    } else if quotient.is_sign_positive() {
        (truncated + Decimal::ONE) * step
    } else {
        truncated * step
    }
}

/// Snaps a price to the tick grid, conservative for the given side:
/// BUY rounds down (don't pay more than intended), SELL rounds up
/// (don't sell for less than intended).
pub fn snap_price(price: Decimal, tick: Decimal, side: Side) -> Decimal {
    match side {
        Side::Buy => floor_to_step(price, tick),
        Side::Sell => ceil_to_step(price, tick),
    }
}

/// Snaps a quantity down to the lot grid. Always conservative (never send
/// more size than was computed).
pub fn snap_qty(qty: Decimal, lot: Decimal) -> Decimal {
    floor_to_step(qty, lot)
}

/// True if `filled` is within one lot-size of `intended` — the tolerance
/// for treating a level as fully filled despite a dust-sized shortfall.
pub fn qty_within_lot_tolerance(filled: Decimal, intended: Decimal, lot: Decimal) -> bool {
    if filled >= intended {
        return true;
    }
    (intended - filled) < lot
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn snapping_twice_is_idempotent() {
        let tick = dec!(0.00001);
        let once = snap_price(dec!(1.234567), tick, Side::Buy);
        let twice = snap_price(once, tick, Side::Buy);
        assert_eq!(once, twice);

        let lot = dec!(1);
        let qonce = snap_qty(dec!(10.7), lot);
        let qtwice = snap_qty(qonce, lot);
        assert_eq!(qonce, qtwice);
    }

    #[test]
    fn buy_price_rounds_down_sell_rounds_up() {
        let tick = dec!(0.01);
        assert_eq!(snap_price(dec!(1.239), tick, Side::Buy), dec!(1.23));
        assert_eq!(snap_price(dec!(1.231), tick, Side::Sell), dec!(1.24));
    }

    #[test]
    fn qty_snap_rounds_down() {
        let lot = dec!(5);
        assert_eq!(snap_qty(dec!(13), lot), dec!(10));
        assert_eq!(snap_qty(dec!(15), lot), dec!(15));
    }

    #[test]
    fn lot_tolerance_window() {
        let lot = dec!(1);
        assert!(qty_within_lot_tolerance(dec!(9.5), dec!(10), lot));
        assert!(!qty_within_lot_tolerance(dec!(8.9), dec!(10), lot));
        assert!(qty_within_lot_tolerance(dec!(10), dec!(10), lot));
    }
}
