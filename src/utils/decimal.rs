//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;

/// Round down to tick. Buy prices are floored so the normalized order
/// never bids above the intended level.
pub fn floor_to_tick(value: Decimal, tick: Decimal) -> Decimal {
    if tick == Decimal::ZERO {
        return value;
    }
    (value / tick).floor() * tick
}

/// Round up to tick. Sell targets are ceiled so rounding never eats into
/// the projected profit.
pub fn ceil_to_tick(value: Decimal, tick: Decimal) -> Decimal {
    if tick == Decimal::ZERO {
        return value;
    }
    (value / tick).ceil() * tick
}

/// Round down to lot size (quantity increment).
pub fn floor_to_lot(value: Decimal, lot: Decimal) -> Decimal {
    if lot == Decimal::ZERO {
        return value;
    }
    (value / lot).floor() * lot
}

/// Percentage change from `base` to `value` (0.01 = +1%).
pub fn pct_change(value: Decimal, base: Decimal) -> Decimal {
    if base == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (value - base) / base
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_floor_to_tick() {
        assert_eq!(floor_to_tick(dec!(0.12345), dec!(0.0001)), dec!(0.1234));
        assert_eq!(floor_to_tick(dec!(10.159), dec!(0.001)), dec!(10.159));
        assert_eq!(floor_to_tick(dec!(10.1599), dec!(0.001)), dec!(10.159));
        assert_eq!(floor_to_tick(dec!(10.1599), Decimal::ZERO), dec!(10.1599));
    }

    #[test]
    fn test_ceil_to_tick() {
        assert_eq!(ceil_to_tick(dec!(10.1501), dec!(0.001)), dec!(10.151));
        assert_eq!(ceil_to_tick(dec!(10.150), dec!(0.001)), dec!(10.150));
    }

    #[test]
    fn test_floor_to_lot() {
        assert_eq!(floor_to_lot(dec!(1.567), dec!(0.001)), dec!(1.567));
        assert_eq!(floor_to_lot(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(floor_to_lot(dec!(1.567), dec!(0.1)), dec!(1.5));
    }

    #[test]
    fn test_pct_change() {
        assert_eq!(pct_change(dec!(101), dec!(100)), dec!(0.01));
        assert_eq!(pct_change(dec!(95), dec!(100)), dec!(-0.05));
        assert_eq!(pct_change(dec!(5), Decimal::ZERO), Decimal::ZERO);
    }
}
