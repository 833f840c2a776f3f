//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;

/// Round a quantity down to the nearest multiple of the venue's step size.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step == Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

/// Round a price to the nearest multiple of the venue's tick size.
pub fn round_to_tick(value: Decimal, tick: Decimal) -> Decimal {
    if tick == Decimal::ZERO {
        return value;
    }
    (value / tick).round() * tick
}

/// True if `value` is an exact multiple of `step`.
pub fn conforms_to_step(value: Decimal, step: Decimal) -> bool {
    if step == Decimal::ZERO {
        return true;
    }
    (value % step).is_zero()
}

/// Premium of the perpetual over spot: `(perp - spot) / spot`.
///
/// Returns zero when spot is zero rather than dividing by it; callers drop
/// symbols without a usable spot price before this matters.
pub fn perp_spot_spread(perp: Decimal, spot: Decimal) -> Decimal {
    if spot == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (perp - spot) / spot
}

/// Safe division that returns zero if the divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Quantity-weighted average of `(value, weight)` pairs.
pub fn weighted_average(values: &[(Decimal, Decimal)]) -> Decimal {
    let (sum, weight_sum) = values.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, weight_sum), (val, weight)| (sum + val * weight, weight_sum + weight),
    );

    safe_div(sum, weight_sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(dec!(1.567), dec!(0.001)), dec!(1.567));
        assert_eq!(floor_to_step(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(floor_to_step(dec!(1.567), dec!(0.1)), dec!(1.5));
        assert_eq!(floor_to_step(dec!(0.9), dec!(1)), Decimal::ZERO);
    }

    #[test]
    fn test_floor_to_step_zero_step_passthrough() {
        assert_eq!(floor_to_step(dec!(1.567), Decimal::ZERO), dec!(1.567));
    }

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(50123.456), dec!(0.01)), dec!(50123.46));
        assert_eq!(round_to_tick(dec!(50123.456), dec!(0.10)), dec!(50123.50));
    }

    #[test]
    fn test_conforms_to_step() {
        assert!(conforms_to_step(dec!(1.56), dec!(0.01)));
        assert!(!conforms_to_step(dec!(1.567), dec!(0.01)));
        assert!(conforms_to_step(dec!(10000), dec!(1)));
    }

    #[test]
    fn test_spread_calculation() {
        // perp 0.1003 over spot 0.10 = 0.3% contango
        assert_eq!(perp_spot_spread(dec!(0.1003), dec!(0.10)), dec!(0.003));
        // perp below spot = backwardation
        assert!(perp_spot_spread(dec!(99), dec!(100)) < Decimal::ZERO);
        assert_eq!(perp_spot_spread(dec!(1), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_weighted_average() {
        let values = vec![(dec!(100), dec!(2)), (dec!(200), dec!(1))];
        let avg = weighted_average(&values);
        assert!(avg > dec!(133) && avg < dec!(134));
        assert_eq!(weighted_average(&[]), Decimal::ZERO);
    }
}
