//! Fixed-precision conversions, weight allocation, and fee math.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::error::GridError;

/// Converts a decimal amount to its blockchain integer representation at
/// `precision` decimal digits. Round-trips exactly with [`blockchain_to_float`]
/// for every value representable at that precision.
pub fn float_to_blockchain(value: Decimal, precision: u32) -> Result<i64, GridError> {
    let scaled = value
        .checked_mul(Decimal::from(10i64.pow(precision)))
        .ok_or_else(|| GridError::Internal(format!("overflow scaling {value} to precision {precision}")))?
        .round();
    scaled
        .to_i64()
        .ok_or_else(|| GridError::Internal(format!("{scaled} does not fit in a blockchain integer")))
}

/// Inverse of [`float_to_blockchain`].
pub fn blockchain_to_float(amount: i64, precision: u32) -> Decimal {
    Decimal::from(amount) / Decimal::from(10i64.pow(precision))
}

/// Compares two amounts at the given side's chain precision as integers.
/// Float equality is never used for chain-size comparisons.
pub fn chain_sizes_equal(a: Decimal, b: Decimal, precision: u32) -> Result<bool, GridError> {
    Ok(float_to_blockchain(a, precision)? == float_to_blockchain(b, precision)?)
}

/// Distributes `total` across `n` slots on a geometric progression with
/// ratio `1 + step`, rounded to `precision`. `reverse` flips which end of
/// the progression receives the heaviest weight, so callers can make the
/// market-closest slot (regardless of array indexing order) receive the
/// maximum allocation.
pub fn allocate_funds_by_weights(
    total: Decimal,
    n: usize,
    step: Decimal,
    reverse: bool,
    precision: u32,
) -> Result<Vec<Decimal>, GridError> {
    if n == 0 {
        return Ok(Vec::new());
    }
    if total < Decimal::ZERO {
        return Err(GridError::Internal(format!("negative allocation total: {total}")));
    }

    let ratio = Decimal::ONE + step;
    let mut weights = Vec::with_capacity(n);
    let mut w = Decimal::ONE;
    for _ in 0..n {
        weights.push(w);
        w = w
            .checked_mul(ratio)
            .ok_or_else(|| GridError::Internal("weight progression overflow".into()))?;
    }
    if reverse {
        weights.reverse();
    }

    let weight_sum: Decimal = weights.iter().copied().sum();
    if weight_sum.is_zero() {
        return Ok(vec![Decimal::ZERO; n]);
    }

    let scale = Decimal::from(10i64.pow(precision));
    let sizes: Vec<Decimal> = weights
        .iter()
        .map(|w| ((total * *w / weight_sum) * scale).round() / scale)
        .collect();
    Ok(sizes)
}

/// Maker/taker fee breakdown for a single order-side operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetFees {
    pub total: Decimal,
    pub create_fee: Decimal,
    pub update_fee: Decimal,
    pub maker_net_fee: Decimal,
    pub taker_net_fee: Decimal,
    pub net_proceeds: Decimal,
}

/// Fee schedule for a market's base fee asset. Assumes a flat create/update
/// fee and a proportional maker/taker fill fee, matching the chain's native
/// fee-asset treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    pub create_fee: Decimal,
    pub update_fee: Decimal,
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
}

/// Computes `{total, create_fee, update_fee, maker_net_fee, taker_net_fee,
/// net_proceeds}` for a fill of `raw_amount` on the named fee schedule.
/// The native fee-asset case is not special-cased here: callers (the
/// accountant) are responsible for routing native-asset fees into
/// `bts_fees_owed` instead of crediting a refund.
pub fn get_asset_fees(schedule: &FeeSchedule, raw_amount: Decimal, is_maker: bool) -> AssetFees {
    let rate = if is_maker { schedule.maker_fee_rate } else { schedule.taker_fee_rate };
    let fill_fee = raw_amount * rate;
    let net_proceeds = raw_amount - fill_fee;
    AssetFees {
        total: schedule.create_fee + schedule.update_fee + fill_fee,
        create_fee: schedule.create_fee,
        update_fee: schedule.update_fee,
        maker_net_fee: raw_amount * schedule.maker_fee_rate,
        taker_net_fee: raw_amount * schedule.taker_fee_rate,
        net_proceeds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn weights_sum_to_total() {
        let sizes = allocate_funds_by_weights(dec!(1000), 5, dec!(0.1), true, 4).unwrap();
        let sum: Decimal = sizes.iter().copied().sum();
        assert!((sum - dec!(1000)).abs() <= dec!(0.01));
    }

    #[test]
    fn reverse_flips_heaviest_slot() {
        let forward = allocate_funds_by_weights(dec!(100), 4, dec!(0.5), false, 4).unwrap();
        let reversed = allocate_funds_by_weights(dec!(100), 4, dec!(0.5), true, 4).unwrap();
        assert!(forward[forward.len() - 1] > forward[0]);
        assert!(reversed[0] > reversed[reversed.len() - 1]);
    }

    #[test]
    fn fees_split_maker_taker() {
        let schedule = FeeSchedule {
            create_fee: dec!(0.001),
            update_fee: dec!(0.0005),
            maker_fee_rate: dec!(0.001),
            taker_fee_rate: dec!(0.002),
        };
        let maker = get_asset_fees(&schedule, dec!(100), true);
        let taker = get_asset_fees(&schedule, dec!(100), false);
        assert_eq!(maker.net_proceeds, dec!(99.900));
        assert_eq!(taker.net_proceeds, dec!(99.800));
    }

    proptest! {
        #[test]
        fn blockchain_round_trip(x in -1_000_000_000i64..1_000_000_000i64, p in 0u32..=12u32) {
            let value = blockchain_to_float(x, p);
            let back = float_to_blockchain(value, p).unwrap();
            prop_assert_eq!(back, x);
        }
    }
}
