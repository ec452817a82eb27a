//! Tick / sqrt-price / liquidity math for a Uniswap-V3-style concentrated-liquidity pool.
//!
//! Pure functions only — no I/O, no async. Tick-to-sqrt-price conversion is delegated to
//! `uniswap_v3_math`, which already ports the canonical bit-shift ladder; the
//! liquidity<->amount conversions are implemented here directly against `LiquidityAmounts.sol`'s
//! formulas since they sit outside that crate's published surface.

use crate::error::{EngineError, EngineResult};
use alloy::primitives::{ruint::Uint, U256};

/// 512-bit intermediate type, wide enough to hold the full product of two Q96-scale U256s
/// before dividing back down. Avoids the overflow a native `U256::checked_mul` would hit.
type U512 = Uint<512, 8>;

pub const MIN_TICK: i32 = -887272;
pub const MAX_TICK: i32 = 887272;

/// Supported fee tiers and their fixed tick spacing, mirroring the position-manager's factory.
pub const SUPPORTED_FEE_TIERS: &[(u32, i32)] = &[(100, 1), (500, 10), (3000, 60), (10000, 200)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignMode {
    Floor,
    Ceil,
}

/// `tickSpacingForFee(fee) -> spacing` — the fixed mapping of supported fee tiers.
pub fn tick_spacing_for_fee(fee: u32) -> EngineResult<i32> {
    SUPPORTED_FEE_TIERS
        .iter()
        .find(|(f, _)| *f == fee)
        .map(|(_, spacing)| *spacing)
        .ok_or(EngineError::InvalidConfig(format!("unsupported fee tier {fee}")))
}

/// `alignToSpacing(tick, spacing, mode) -> tick`.
pub fn align_to_spacing(tick: i32, spacing: i32, mode: AlignMode) -> i32 {
    let rem = tick.rem_euclid(spacing);
    match mode {
        AlignMode::Floor => tick - rem,
        AlignMode::Ceil => {
            if rem == 0 {
                tick
            } else {
                tick - rem + spacing
            }
        }
    }
}

/// `sqrtRatioAtTick(tick) -> Q96`.
pub fn sqrt_ratio_at_tick(tick: i32) -> EngineResult<U256> {
    if !(MIN_TICK..=MAX_TICK).contains(&tick) {
        return Err(EngineError::InvalidTickRange { lower: tick, upper: tick });
    }
    uniswap_v3_math::tick_math::get_sqrt_ratio_at_tick(tick)
        .map_err(|e| EngineError::InvalidConfig(format!("sqrt ratio at tick {tick}: {e}")))
}

/// `tickAtSqrtRatio(sqrtQ96) -> tick`, used only for diagnostics (e.g. drift sizing).
pub fn tick_at_sqrt_ratio(sqrt_ratio_x96: U256) -> EngineResult<i32> {
    uniswap_v3_math::tick_math::get_tick_at_sqrt_ratio(sqrt_ratio_x96)
        .map_err(|e| EngineError::InvalidConfig(format!("tick at sqrt ratio: {e}")))
}

/// Full-precision `floor(a * b / denominator)`.
fn mul_div_floor(a: U256, b: U256, denominator: U256) -> EngineResult<U256> {
    if denominator.is_zero() {
        return Err(EngineError::InvalidConfig("mul_div by zero denominator".into()));
    }
    let product = U512::from(a) * U512::from(b);
    let result = product / U512::from(denominator);
    U256::try_from(result).map_err(|_| EngineError::InvalidConfig("mul_div overflow".into()))
}

/// Full-precision `ceil(a * b / denominator)`.
fn mul_div_ceil(a: U256, b: U256, denominator: U256) -> EngineResult<U256> {
    if denominator.is_zero() {
        return Err(EngineError::InvalidConfig("mul_div by zero denominator".into()));
    }
    let product = U512::from(a) * U512::from(b);
    let denom = U512::from(denominator);
    let result = (product + denom - U512::from(1u8)) / denom;
    U256::try_from(result).map_err(|_| EngineError::InvalidConfig("mul_div overflow".into()))
}

fn q96() -> U256 {
    U256::from(1u8) << 96
}

/// `getAmount0Delta(sqrtA, sqrtB, L, roundUp) -> amount0`, sqrtA < sqrtB assumed.
fn amount0_delta(sqrt_a: U256, sqrt_b: U256, liquidity: u128, round_up: bool) -> EngineResult<U256> {
    let numerator1 = U256::from(liquidity) << 96;
    let numerator2 = sqrt_b - sqrt_a;
    if round_up {
        let intermediate = mul_div_ceil(numerator1, numerator2, sqrt_b)?;
        Ok((intermediate + sqrt_a - U256::from(1u8)) / sqrt_a)
    } else {
        let product = mul_div_floor(numerator1, numerator2, sqrt_b)?;
        Ok(product / sqrt_a)
    }
}

/// `getAmount1Delta(sqrtA, sqrtB, L, roundUp) -> amount1`, sqrtA < sqrtB assumed.
fn amount1_delta(sqrt_a: U256, sqrt_b: U256, liquidity: u128, round_up: bool) -> EngineResult<U256> {
    let numerator = U256::from(liquidity);
    let diff = sqrt_b - sqrt_a;
    if round_up {
        mul_div_ceil(numerator, diff, q96())
    } else {
        mul_div_floor(numerator, diff, q96())
    }
}

/// `getAmountsForLiquidity(sqrtX, sqrtA, sqrtB, L) -> (amount0, amount1)`.
///
/// Normalizes sqrtA < sqrtB and branches on sqrtX vs the band endpoints: below, inside, above.
pub fn get_amounts_for_liquidity(
    sqrt_ratio_x96: U256,
    sqrt_ratio_a_x96: U256,
    sqrt_ratio_b_x96: U256,
    liquidity: u128,
) -> EngineResult<(U256, U256)> {
    let (sqrt_a, sqrt_b) = if sqrt_ratio_a_x96 > sqrt_ratio_b_x96 {
        (sqrt_ratio_b_x96, sqrt_ratio_a_x96)
    } else {
        (sqrt_ratio_a_x96, sqrt_ratio_b_x96)
    };

    if sqrt_ratio_x96 <= sqrt_a {
        Ok((amount0_delta(sqrt_a, sqrt_b, liquidity, false)?, U256::ZERO))
    } else if sqrt_ratio_x96 < sqrt_b {
        let amount0 = amount0_delta(sqrt_ratio_x96, sqrt_b, liquidity, false)?;
        let amount1 = amount1_delta(sqrt_a, sqrt_ratio_x96, liquidity, false)?;
        Ok((amount0, amount1))
    } else {
        Ok((U256::ZERO, amount1_delta(sqrt_a, sqrt_b, liquidity, false)?))
    }
}

/// `getLiquidityForAmount0(sqrtX, sqrtA, sqrtB, amount0) -> L`.
pub fn get_liquidity_for_amount0(sqrt_a_x96: U256, sqrt_b_x96: U256, amount0: U256) -> EngineResult<u128> {
    let (sqrt_a, sqrt_b) = if sqrt_a_x96 > sqrt_b_x96 { (sqrt_b_x96, sqrt_a_x96) } else { (sqrt_a_x96, sqrt_b_x96) };
    let intermediate = mul_div_floor(sqrt_a, sqrt_b, q96())?;
    let liquidity = mul_div_floor(amount0, intermediate, sqrt_b - sqrt_a)?;
    u256_to_u128(liquidity)
}

/// `getLiquidityForAmount1(sqrtX, sqrtA, sqrtB, amount1) -> L`.
pub fn get_liquidity_for_amount1(sqrt_a_x96: U256, sqrt_b_x96: U256, amount1: U256) -> EngineResult<u128> {
    let (sqrt_a, sqrt_b) = if sqrt_a_x96 > sqrt_b_x96 { (sqrt_b_x96, sqrt_a_x96) } else { (sqrt_a_x96, sqrt_b_x96) };
    let liquidity = mul_div_floor(amount1, q96(), sqrt_b - sqrt_a)?;
    u256_to_u128(liquidity)
}

/// `getLiquidityForAmounts` — picks the limiting side given where the current price sits,
/// mirroring `LiquidityAmounts.sol`: below band uses amount0 alone, above uses amount1 alone,
/// inside takes the minimum of both single-sided liquidities.
pub fn get_liquidity_for_amounts(
    sqrt_ratio_x96: U256,
    sqrt_ratio_a_x96: U256,
    sqrt_ratio_b_x96: U256,
    amount0: U256,
    amount1: U256,
) -> EngineResult<u128> {
    let (sqrt_a, sqrt_b) = if sqrt_ratio_a_x96 > sqrt_ratio_b_x96 {
        (sqrt_ratio_b_x96, sqrt_ratio_a_x96)
    } else {
        (sqrt_ratio_a_x96, sqrt_ratio_b_x96)
    };

    if sqrt_ratio_x96 <= sqrt_a {
        get_liquidity_for_amount0(sqrt_a, sqrt_b, amount0)
    } else if sqrt_ratio_x96 < sqrt_b {
        let liquidity0 = get_liquidity_for_amount0(sqrt_ratio_x96, sqrt_b, amount0)?;
        let liquidity1 = get_liquidity_for_amount1(sqrt_a, sqrt_ratio_x96, amount1)?;
        Ok(liquidity0.min(liquidity1))
    } else {
        get_liquidity_for_amount1(sqrt_a, sqrt_b, amount1)
    }
}

fn u256_to_u128(value: U256) -> EngineResult<u128> {
    value
        .try_into()
        .map_err(|_| EngineError::InvalidConfig("liquidity exceeds u128".into()))
}

/// Translate a signed percent band around the current tick into an aligned (tickLower, tickUpper).
pub fn percent_band_to_ticks(
    current_tick: i32,
    lower_percent: f64,
    upper_percent: f64,
    spacing: i32,
) -> EngineResult<(i32, i32)> {
    if lower_percent >= upper_percent {
        return Err(EngineError::InvalidConfig(
            "lowerPercent must be less than upperPercent".into(),
        ));
    }
    // price = 1.0001^tick, so a percent move in price is a log1.0001(1+pct) move in tick.
    let ln_base = 1.0001_f64.ln();
    let lower_tick_raw = current_tick as f64 + (1.0 + lower_percent / 100.0).ln() / ln_base;
    let upper_tick_raw = current_tick as f64 + (1.0 + upper_percent / 100.0).ln() / ln_base;

    let tick_lower = align_to_spacing(lower_tick_raw.round() as i32, spacing, AlignMode::Floor);
    let mut tick_upper = align_to_spacing(upper_tick_raw.round() as i32, spacing, AlignMode::Ceil);
    if tick_upper <= tick_lower {
        tick_upper = tick_lower + spacing;
    }
    if !(MIN_TICK..=MAX_TICK).contains(&tick_lower) || !(MIN_TICK..=MAX_TICK).contains(&tick_upper) {
        return Err(EngineError::InvalidTickRange { lower: tick_lower, upper: tick_upper });
    }
    Ok((tick_lower, tick_upper))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_to_spacing_floor_and_ceil() {
        assert_eq!(align_to_spacing(103, 10, AlignMode::Floor), 100);
        assert_eq!(align_to_spacing(103, 10, AlignMode::Ceil), 110);
        assert_eq!(align_to_spacing(-103, 10, AlignMode::Floor), -110);
        assert_eq!(align_to_spacing(-103, 10, AlignMode::Ceil), -100);
        assert_eq!(align_to_spacing(100, 10, AlignMode::Floor), 100);
        assert_eq!(align_to_spacing(100, 10, AlignMode::Ceil), 100);
    }

    #[test]
    fn tick_spacing_lookup() {
        assert_eq!(tick_spacing_for_fee(3000).unwrap(), 60);
        assert!(tick_spacing_for_fee(42).is_err());
    }

    #[test]
    fn sqrt_ratio_roundtrip_near_zero() {
        let sqrt0 = sqrt_ratio_at_tick(0).unwrap();
        // tick 0 => price 1.0 => sqrtPriceX96 == 2^96
        assert_eq!(sqrt0, q96());
        let tick_back = tick_at_sqrt_ratio(sqrt0).unwrap();
        assert_eq!(tick_back, 0);
    }

    #[test]
    fn invalid_tick_range_rejected() {
        let err = sqrt_ratio_at_tick(MAX_TICK + 1);
        assert!(matches!(err, Err(EngineError::InvalidTickRange { .. })));
    }

    #[test]
    fn amounts_for_liquidity_below_band_is_single_sided_token0() {
        let sqrt_a = sqrt_ratio_at_tick(-500).unwrap();
        let sqrt_b = sqrt_ratio_at_tick(500).unwrap();
        let sqrt_x = sqrt_ratio_at_tick(-1000).unwrap(); // below the band
        let (a0, a1) = get_amounts_for_liquidity(sqrt_x, sqrt_a, sqrt_b, 1_000_000_000_000u128).unwrap();
        assert!(a0 > U256::ZERO);
        assert_eq!(a1, U256::ZERO);
    }

    #[test]
    fn amounts_for_liquidity_above_band_is_single_sided_token1() {
        let sqrt_a = sqrt_ratio_at_tick(-500).unwrap();
        let sqrt_b = sqrt_ratio_at_tick(500).unwrap();
        let sqrt_x = sqrt_ratio_at_tick(1000).unwrap(); // above the band
        let (a0, a1) = get_amounts_for_liquidity(sqrt_x, sqrt_a, sqrt_b, 1_000_000_000_000u128).unwrap();
        assert_eq!(a0, U256::ZERO);
        assert!(a1 > U256::ZERO);
    }

    #[test]
    fn liquidity_amount_roundtrip_within_one_wei() {
        let sqrt_a = sqrt_ratio_at_tick(-500).unwrap();
        let sqrt_b = sqrt_ratio_at_tick(500).unwrap();
        let sqrt_x = sqrt_ratio_at_tick(0).unwrap();
        let amount1_in = U256::from(1_000_000_000_000u128);

        let liquidity = get_liquidity_for_amounts(sqrt_x, sqrt_a, sqrt_b, U256::from(u128::MAX), amount1_in).unwrap();
        let (_, a1) = get_amounts_for_liquidity(sqrt_x, sqrt_a, sqrt_b, liquidity).unwrap();
        let diff = if a1 > amount1_in { a1 - amount1_in } else { amount1_in - a1 };
        assert!(diff <= U256::from(1u8));
    }

    #[test]
    fn percent_band_translates_and_aligns() {
        let (lower, upper) = percent_band_to_ticks(0, -5.0, 5.0, 10).unwrap();
        assert!(lower < 0 && upper > 0);
        assert_eq!(lower % 10, 0);
        assert_eq!(upper % 10, 0);
    }

    #[test]
    fn percent_band_rejects_inverted_range() {
        assert!(percent_band_to_ticks(0, 5.0, -5.0, 10).is_err());
    }
}
