//! Numerically stable LMSR core over integer micro-units.
//!
//! All public functions take and return integers at scale 1e-6 (micro-shares,
//! micro-USDC, micro-prices). Exponentials and logs run in f64 through the
//! stabilized log-sum-exp form; conversion back to the ledger happens at a
//! single rounding boundary with i128 intermediates.

pub const PRECISION: i64 = 1_000_000;

/// Scale factor between `base_liquidity_parameter` and the working `b`.
pub const B_BASE_SCALE: i64 = 1_000;

/// Maximum allowed amount-to-liquidity ratio before exp() becomes meaningless.
pub const MAX_AMOUNT_TO_LIQUIDITY_RATIO: f64 = 700.0;

#[inline]
pub fn to_micro(x: f64) -> Result<i64, String> {
    // round half-away-from-zero
    if x.is_nan() || !x.is_finite() {
        return Err(format!("non-finite value passed to to_micro: {x}"));
    }
    let scaled = x * (PRECISION as f64);
    let rounded = if scaled >= 0.0 {
        (scaled + 0.5).floor()
    } else {
        (scaled - 0.5).ceil()
    };
    let wide = rounded as i128;
    i64::try_from(wide).map_err(|_| format!("micro value out of i64 range: {rounded}"))
}

#[inline]
pub fn from_micro(x: i64) -> f64 {
    x as f64 / PRECISION as f64
}

/// Trade side. YES = side 1, NO = side 2 everywhere in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "yes" => Ok(Side::Yes),
            "no" => Ok(Side::No),
            _ => Err(format!("invalid side: '{s}', expected 'yes' or 'no'")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    /// Winning-side column encoding: 1 = YES, 2 = NO.
    pub fn as_winning_side(&self) -> i16 {
        match self {
            Side::Yes => 1,
            Side::No => 2,
        }
    }

    pub fn from_winning_side(v: i16) -> Result<Self, String> {
        match v {
            1 => Ok(Side::Yes),
            2 => Ok(Side::No),
            _ => Err(format!("invalid winning_side: {v}")),
        }
    }
}

#[inline]
fn log_sum_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

#[inline]
fn check_b(b: i64) -> Result<f64, String> {
    if b <= 0 {
        return Err(format!("liquidity parameter b must be positive, got {b}"));
    }
    Ok(from_micro(b))
}

/// LMSR potential C(q) = b * ln(exp(q_yes/b) + exp(q_no/b)), in micro-USDC.
pub fn cost(q_yes: i64, q_no: i64, b: i64) -> Result<i64, String> {
    let bf = check_b(b)?;
    let c = bf * log_sum_exp(from_micro(q_yes) / bf, from_micro(q_no) / bf);
    to_micro(c)
}

/// Instantaneous YES price in [0, PRECISION].
pub fn yes_price(q_yes: i64, q_no: i64, b: i64) -> Result<i64, String> {
    let bf = check_b(b)?;
    let a = from_micro(q_yes) / bf;
    let c = from_micro(q_no) / bf;
    let m = a.max(c);
    let ey = (a - m).exp();
    let en = (c - m).exp();
    let p = to_micro(ey / (ey + en))?;
    Ok(p.clamp(0, PRECISION))
}

/// Complement of [`yes_price`]; the pair always sums to exactly PRECISION.
pub fn no_price(q_yes: i64, q_no: i64, b: i64) -> Result<i64, String> {
    Ok(PRECISION - yes_price(q_yes, q_no, b)?)
}

/// Cost of adding (delta_yes, delta_no) micro-shares at state (q_yes, q_no).
/// Non-negative by convexity; rounding happens once on the difference.
pub fn buy_cost(q_yes: i64, q_no: i64, b: i64, delta_yes: i64, delta_no: i64) -> Result<i64, String> {
    if delta_yes < 0 || delta_no < 0 {
        return Err("buy deltas must be non-negative".to_string());
    }
    let bf = check_b(b)?;
    let ratio = from_micro(delta_yes.max(delta_no)) / bf;
    if ratio > MAX_AMOUNT_TO_LIQUIDITY_RATIO {
        return Err(format!(
            "trade too large relative to liquidity: ratio {ratio:.2} > {MAX_AMOUNT_TO_LIQUIDITY_RATIO}"
        ));
    }
    let before = bf * log_sum_exp(from_micro(q_yes) / bf, from_micro(q_no) / bf);
    let after = bf * log_sum_exp(
        from_micro(q_yes + delta_yes) / bf,
        from_micro(q_no + delta_no) / bf,
    );
    Ok(to_micro(after - before)?.max(0))
}

/// Payout for removing (delta_yes, delta_no) micro-shares. Caller guarantees
/// the deltas do not exceed outstanding totals.
pub fn sell_payout(
    q_yes: i64,
    q_no: i64,
    b: i64,
    delta_yes: i64,
    delta_no: i64,
) -> Result<i64, String> {
    if delta_yes < 0 || delta_no < 0 {
        return Err("sell deltas must be non-negative".to_string());
    }
    if delta_yes > q_yes || delta_no > q_no {
        return Err(format!(
            "sell exceeds outstanding shares: yes {delta_yes}/{q_yes}, no {delta_no}/{q_no}"
        ));
    }
    let bf = check_b(b)?;
    let before = bf * log_sum_exp(from_micro(q_yes) / bf, from_micro(q_no) / bf);
    let after = bf * log_sum_exp(
        from_micro(q_yes - delta_yes) / bf,
        from_micro(q_no - delta_no) / bf,
    );
    Ok(to_micro(before - after)?.max(0))
}

/// Log-domain ln(exp(t) - 1) for t > 0, stable across magnitudes.
#[inline]
fn ln_expm1_pos(t: f64) -> f64 {
    debug_assert!(t.is_finite() && t > 0.0);
    let e_neg_t = (-t).exp();
    t + (1.0 - e_neg_t).ln()
}

/// Closed-form share delta for spending `amount` on one side; used to seed
/// the integer inversion in [`shares_for_amount`].
fn delta_for_amount_f64(side: Side, q_yes: f64, q_no: f64, b: f64, s: f64) -> Result<f64, String> {
    let ay = q_yes / b;
    let an = q_no / b;
    let lse = log_sum_exp(ay, an);
    let sb = s / b;
    let t = match side {
        Side::Yes => sb + lse - an,
        Side::No => sb + lse - ay,
    };
    if !(t > 0.0) {
        return Err("numerically unstable: amount too small".to_string());
    }
    let delta = match side {
        Side::Yes => b * ((an - ay) + ln_expm1_pos(t)),
        Side::No => b * ((ay - an) + ln_expm1_pos(t)),
    };
    if !delta.is_finite() {
        return Err(format!("delta calculation produced non-finite value: {delta}"));
    }
    Ok(delta)
}

/// Largest integer share delta whose gross cost does not exceed `amount`.
/// Rounds down: the buyer never over-pays the budget.
pub fn shares_for_amount(
    q_yes: i64,
    q_no: i64,
    b: i64,
    side: Side,
    amount: i64,
) -> Result<i64, String> {
    if amount <= 0 {
        return Err("amount must be positive".to_string());
    }
    let bf = check_b(b)?;
    if from_micro(amount) / bf > MAX_AMOUNT_TO_LIQUIDITY_RATIO {
        return Err(format!(
            "amount too large relative to liquidity parameter: {} / {} exceeds ratio {}",
            amount, b, MAX_AMOUNT_TO_LIQUIDITY_RATIO
        ));
    }

    let seed = delta_for_amount_f64(side, from_micro(q_yes), from_micro(q_no), bf, from_micro(amount))?;
    // The closed form is exact in the reals; bracket it generously and let the
    // integer search settle the rounding.
    let mut hi = to_micro(seed)?.saturating_add(PRECISION).max(PRECISION);
    let cost_at = |d: i64| -> Result<i64, String> {
        match side {
            Side::Yes => buy_cost(q_yes, q_no, b, d, 0),
            Side::No => buy_cost(q_yes, q_no, b, 0, d),
        }
    };
    while cost_at(hi)? <= amount {
        hi = hi.saturating_mul(2);
        if from_micro(hi) / bf > MAX_AMOUNT_TO_LIQUIDITY_RATIO {
            break;
        }
    }
    let mut lo: i64 = 0;
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if cost_at(mid)? <= amount {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(lo)
}

/// Integer square root on non-negative values.
fn isqrt(v: i64) -> i64 {
    if v <= 0 {
        return 0;
    }
    let n = v as u128;
    let mut x = (v as f64).sqrt() as u128;
    // settle Newton around the f64 estimate
    while x.saturating_mul(x) > n {
        x -= 1;
    }
    while (x + 1).saturating_mul(x + 1) <= n {
        x += 1;
    }
    x as i64
}

/// Liquidity-parameter schedule: b tracks the square root of whichever is
/// larger, pool liquidity or outstanding shares, floored at b0 * 1000.
pub fn recompute_b(b0: i64, pool_liquidity: i64, total_shares: i64) -> i64 {
    let floor = b0.saturating_mul(B_BASE_SCALE);
    let driver = pool_liquidity.max(total_shares).max(0);
    let scaled = isqrt(driver).saturating_mul(10_000);
    floor.max(scaled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const B: i64 = 100_000_000; // 100 USDC of pool depth

    #[test]
    fn symmetric_price_is_half() {
        assert_eq!(yes_price(0, 0, B).unwrap(), PRECISION / 2);
        assert_eq!(no_price(0, 0, B).unwrap(), PRECISION / 2);
    }

    #[test]
    fn symmetric_buy_costs_about_half_face() {
        // 1 share into a deep symmetric market costs just over half its face.
        let gross = buy_cost(0, 0, B, PRECISION, 0).unwrap();
        assert!(gross > 500_000 && gross < 510_000, "gross = {gross}");
    }

    #[test]
    fn buying_yes_raises_yes_price() {
        let before = yes_price(0, 0, B).unwrap();
        let after = yes_price(PRECISION, 0, B).unwrap();
        assert!(after > before, "{after} <= {before}");
    }

    #[test]
    fn sell_payout_requires_outstanding_shares() {
        assert!(sell_payout(0, 0, B, PRECISION, 0).is_err());
        assert!(sell_payout(PRECISION, 0, B, PRECISION, 0).is_ok());
    }

    #[test]
    fn shares_for_amount_is_tight() {
        let amount = 5_000_000; // 5 USDC
        let delta = shares_for_amount(0, 0, B, Side::Yes, amount).unwrap();
        assert!(delta > 0);
        assert!(buy_cost(0, 0, B, delta, 0).unwrap() <= amount);
        assert!(buy_cost(0, 0, B, delta + 1, 0).unwrap() > amount);
    }

    #[test]
    fn recompute_b_floors_at_scaled_base() {
        assert_eq!(recompute_b(1000, 0, 0), 1_000_000);
        // 100 USDC pool: sqrt(100e6) * 10_000 = 100e6
        assert_eq!(recompute_b(1000, 100_000_000, 0), 100_000_000);
        // shares dominate when larger than the pool
        assert_eq!(recompute_b(1000, 0, 100_000_000), 100_000_000);
    }

    #[test]
    fn isqrt_exact_on_squares() {
        for v in [0i64, 1, 4, 9, 100, 1_000_000, 99_980_001] {
            let r = isqrt(v);
            assert!(r * r <= v && (r + 1) * (r + 1) > v, "v={v} r={r}");
        }
    }

    #[test]
    fn rejects_degenerate_liquidity() {
        assert!(cost(0, 0, 0).is_err());
        assert!(yes_price(0, 0, -5).is_err());
    }

    #[test]
    fn oversized_amount_is_rejected() {
        let res = shares_for_amount(0, 0, 1_000_000, Side::Yes, i64::MAX / 2);
        assert!(res.is_err());
    }

    proptest! {
        #[test]
        fn price_bounds_and_complement(
            q_yes in 0i64..2_000_000_000,
            q_no in 0i64..2_000_000_000,
            b in 1_000_000i64..1_000_000_000,
        ) {
            let py = yes_price(q_yes, q_no, b).unwrap();
            let pn = no_price(q_yes, q_no, b).unwrap();
            prop_assert!((0..=PRECISION).contains(&py));
            prop_assert_eq!(py + pn, PRECISION);
        }

        #[test]
        fn round_trip_never_profits(
            q_yes in 0i64..500_000_000,
            q_no in 0i64..500_000_000,
            delta in 100_000i64..50_000_000,
            b in 10_000_000i64..1_000_000_000,
        ) {
            let paid = buy_cost(q_yes, q_no, b, delta, 0).unwrap();
            let got = sell_payout(q_yes + delta, q_no, b, delta, 0).unwrap();
            // one micro of rounding slack on each conversion
            prop_assert!(got <= paid + 1, "sell {} > buy {}", got, paid);
        }

        #[test]
        fn inversion_respects_budget(
            q_yes in 0i64..200_000_000,
            q_no in 0i64..200_000_000,
            amount in 200_000i64..20_000_000,
            b in 50_000_000i64..500_000_000,
        ) {
            let delta = shares_for_amount(q_yes, q_no, b, Side::Yes, amount).unwrap();
            let gross = buy_cost(q_yes, q_no, b, delta, 0).unwrap();
            prop_assert!(gross <= amount, "gross {} exceeds budget {}", gross, amount);
        }

        #[test]
        fn cost_is_monotone_in_quantity(
            q in 0i64..500_000_000,
            delta in 1_000i64..10_000_000,
            b in 10_000_000i64..500_000_000,
        ) {
            let c0 = cost(q, q, b).unwrap();
            let c1 = cost(q + delta, q, b).unwrap();
            prop_assert!(c1 >= c0);
        }
    }
}
