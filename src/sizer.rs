use rust_decimal::Decimal;
use rust_decimal::prelude::Zero;

/// Fraction of the combined (available margin + invested margin) pool that
/// the master currently has invested in one position.
pub fn master_pct(position_value: Decimal, leverage: u32, available_margin: Decimal) -> Decimal {
    if leverage == 0 || position_value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let invested = position_value / Decimal::from(leverage);
    let total = available_margin + invested;
    if total.is_zero() {
        return Decimal::ZERO;
    }
    invested / total
}

/// Follower order quantity scaled to the master's investment fraction,
/// rounded to `precision` decimal places.
pub fn quantity(
    master_pct: Decimal,
    follower_available: Decimal,
    price: Decimal,
    leverage: u32,
    precision: u32,
) -> Decimal {
    if master_pct <= Decimal::ZERO || follower_available <= Decimal::ZERO || price <= Decimal::ZERO || leverage == 0 {
        return Decimal::ZERO;
    }
    let usdt = follower_available * master_pct;
    let exposure = usdt * Decimal::from(leverage);
    (exposure / price).round_dp(precision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn master_pct_zero_leverage_is_zero() {
        assert_eq!(master_pct(dec!(500), 0, dec!(950)), Decimal::ZERO);
    }

    #[test]
    fn master_pct_zero_position_value_is_zero() {
        assert_eq!(master_pct(Decimal::ZERO, 10, dec!(950)), Decimal::ZERO);
    }

    #[test]
    fn master_pct_cold_open_scenario() {
        // position_value=500, leverage=10, available=950 -> invested=50, total=1000, pct=0.05
        let pct = master_pct(dec!(500), 10, dec!(950));
        assert_eq!(pct, dec!(0.05));
    }

    #[test]
    fn master_pct_is_scale_invariant() {
        let a = master_pct(dec!(500), 10, dec!(950));
        let b = master_pct(dec!(5000), 10, dec!(9500));
        assert_eq!(a, b);
    }

    #[test]
    fn quantity_cold_open_scenario() {
        // master_pct=0.05, follower_available=200, price=50000, leverage=10 -> 0.002
        let qty = quantity(dec!(0.05), dec!(200), dec!(50000), 10, 8);
        assert_eq!(qty, dec!(0.002));
    }

    #[test]
    fn quantity_zero_on_non_positive_inputs() {
        assert_eq!(quantity(Decimal::ZERO, dec!(200), dec!(50000), 10, 8), Decimal::ZERO);
        assert_eq!(quantity(dec!(0.05), Decimal::ZERO, dec!(50000), 10, 8), Decimal::ZERO);
        assert_eq!(quantity(dec!(0.05), dec!(200), Decimal::ZERO, 10, 8), Decimal::ZERO);
        assert_eq!(quantity(dec!(0.05), dec!(200), dec!(50000), 0, 8), Decimal::ZERO);
    }
}
