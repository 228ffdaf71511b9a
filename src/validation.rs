//! Input validation and admin-configurable limits.
//!
//! Structural checks run before the operation enters the queue, so invalid
//! requests never take a lane or a transaction. Limit values come from the
//! `admin_config` row and are cached; `reload` invalidates the cache so the
//! next operation observes fresh values.

use crate::config::{MIN_SHARES_PER_TRADE, MIN_TRADE_COST};
use crate::error::TransactionError;
use crate::lmsr::Side;
use crate::store::{AdminConfigRow, Ledger};
use anyhow::Result;
use moka::future::Cache;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

/// Seconds per UTC day; daily volume caps reset at midnight UTC.
const DAY_SECS: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct TradeLimits {
    pub max_trade_cost: i64,
    pub max_position_cost: i64,
    pub max_daily_volume: i64,
    pub dispute_fee: i64,
    pub fees: crate::config::FeeConfig,
    pub version: i64,
}

impl From<&AdminConfigRow> for TradeLimits {
    fn from(row: &AdminConfigRow) -> Self {
        Self {
            max_trade_cost: row.max_trade_cost,
            max_position_cost: row.max_position_cost,
            max_daily_volume: row.max_daily_volume,
            dispute_fee: row.dispute_fee,
            fees: crate::config::FeeConfig {
                total_fee_bps: row.total_fee_bps,
                creator_fee_bps: row.creator_fee_bps,
                protocol_fee_bps: row.protocol_fee_bps,
                lp_fee_bps: row.lp_fee_bps,
            },
            version: row.version,
        }
    }
}

/// Cached view of the admin_config limits row.
#[derive(Clone)]
pub struct LimitsCache {
    cache: Cache<&'static str, Arc<TradeLimits>>,
}

const LIMITS_KEY: &str = "limits";

impl LimitsCache {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(4)
                .time_to_live(Duration::from_secs(60))
                .build(),
        }
    }

    pub async fn get(&self, pool: &PgPool) -> Result<Arc<TradeLimits>> {
        if let Some(limits) = self.cache.get(LIMITS_KEY).await {
            return Ok(limits);
        }
        let row = Ledger::get_admin_config(pool).await?;
        let limits = Arc::new(TradeLimits::from(&row));
        self.cache.insert(LIMITS_KEY, limits.clone()).await;
        Ok(limits)
    }

    /// Drop cached values after an admin reload.
    pub async fn invalidate(&self) {
        self.cache.invalidate(LIMITS_KEY).await;
    }
}

impl Default for LimitsCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Start of the UTC day containing `ts`.
pub fn day_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(DAY_SECS)
}

/// Exactly one side traded, minimum size enforced. Returns the side and the
/// quantity.
pub fn validate_trade_quantities(yes_qty: i64, no_qty: i64) -> Result<(Side, i64)> {
    if yes_qty < 0 || no_qty < 0 {
        return Err(TransactionError::validation("share quantities must be non-negative"));
    }
    let (side, qty) = match (yes_qty > 0, no_qty > 0) {
        (true, false) => (Side::Yes, yes_qty),
        (false, true) => (Side::No, no_qty),
        (true, true) => {
            return Err(TransactionError::validation(
                "exactly one of yes and no may be traded per call",
            ))
        }
        (false, false) => {
            return Err(TransactionError::validation("a non-zero quantity is required"))
        }
    };
    if qty < MIN_SHARES_PER_TRADE {
        return Err(TransactionError::validation(format!(
            "quantity {qty} is below the minimum of {MIN_SHARES_PER_TRADE} micro-shares"
        )));
    }
    Ok((side, qty))
}

/// Gross-cost floor and per-trade ceiling.
pub fn check_trade_cost(total_charge: i64, limits: &TradeLimits) -> Result<()> {
    if total_charge < MIN_TRADE_COST {
        return Err(TransactionError::validation(format!(
            "trade cost {total_charge} is below the minimum of {MIN_TRADE_COST} micro-USDC"
        )));
    }
    if total_charge > limits.max_trade_cost {
        return Err(TransactionError::validation(format!(
            "trade cost {total_charge} exceeds the per-trade maximum of {}",
            limits.max_trade_cost
        )));
    }
    Ok(())
}

/// Slippage guard for buys. With `slippage_bps` the caller supplies the cost
/// they expected; the charge may exceed it by at most that many basis points.
/// `max_cost` is the absolute form.
pub fn check_buy_slippage(
    total_charge: i64,
    expected_cost: Option<i64>,
    slippage_bps: Option<i64>,
    max_cost: Option<i64>,
) -> Result<()> {
    if let Some(bound) = max_cost {
        if total_charge > bound {
            return Err(anyhow::Error::new(TransactionError::SlippageExceeded {
                actual: total_charge,
                bound,
            }));
        }
    }
    if let Some(bps) = slippage_bps {
        if !(0..=10_000).contains(&bps) {
            return Err(TransactionError::validation(format!(
                "slippage_bps {bps} outside [0, 10000]"
            )));
        }
        let expected = expected_cost.ok_or_else(|| {
            TransactionError::validation("slippage_bps requires expected_cost")
        })?;
        let bound = (expected as i128 * (10_000 + bps) as i128 / 10_000) as i64;
        if total_charge > bound {
            return Err(anyhow::Error::new(TransactionError::SlippageExceeded {
                actual: total_charge,
                bound,
            }));
        }
    }
    Ok(())
}

/// Slippage guard for sells: the net payout may undershoot the expectation by
/// at most `slippage_bps`, or must clear the absolute `min_payout`.
pub fn check_sell_slippage(
    net_payout: i64,
    expected_payout: Option<i64>,
    slippage_bps: Option<i64>,
    min_payout: Option<i64>,
) -> Result<()> {
    if let Some(bound) = min_payout {
        if net_payout < bound {
            return Err(anyhow::Error::new(TransactionError::SlippageExceeded {
                actual: net_payout,
                bound,
            }));
        }
    }
    if let Some(bps) = slippage_bps {
        if !(0..=10_000).contains(&bps) {
            return Err(TransactionError::validation(format!(
                "slippage_bps {bps} outside [0, 10000]"
            )));
        }
        let expected = expected_payout.ok_or_else(|| {
            TransactionError::validation("slippage_bps requires expected_payout")
        })?;
        let bound = (expected as i128 * (10_000 - bps) as i128 / 10_000) as i64;
        if net_payout < bound {
            return Err(anyhow::Error::new(TransactionError::SlippageExceeded {
                actual: net_payout,
                bound,
            }));
        }
    }
    Ok(())
}

/// Per-market position cap and per-day volume cap, evaluated inside the
/// transaction against committed state.
pub fn check_exposure(
    new_position_cost: i64,
    daily_volume_with_trade: i64,
    limits: &TradeLimits,
) -> Result<()> {
    if new_position_cost > limits.max_position_cost {
        return Err(TransactionError::validation(format!(
            "position cost {new_position_cost} would exceed the per-market cap of {}",
            limits.max_position_cost
        )));
    }
    if daily_volume_with_trade > limits.max_daily_volume {
        return Err(TransactionError::validation(format!(
            "daily volume {daily_volume_with_trade} would exceed the cap of {}",
            limits.max_daily_volume
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::as_transaction_error;

    fn limits() -> TradeLimits {
        TradeLimits {
            max_trade_cost: 10_000_000_000,
            max_position_cost: 50_000_000_000,
            max_daily_volume: 100_000_000_000,
            dispute_fee: 100_000_000,
            fees: crate::config::FeeConfig::default(),
            version: 1,
        }
    }

    #[test]
    fn exactly_one_side_rule() {
        assert!(validate_trade_quantities(1_000_000, 0).is_ok());
        assert!(validate_trade_quantities(0, 1_000_000).is_ok());
        assert!(validate_trade_quantities(1_000_000, 1_000_000).is_err());
        assert!(validate_trade_quantities(0, 0).is_err());
        assert!(validate_trade_quantities(-1, 0).is_err());
    }

    #[test]
    fn minimum_trade_size() {
        // 0.1 share is the floor
        assert!(validate_trade_quantities(99_999, 0).is_err());
        assert!(validate_trade_quantities(100_000, 0).is_ok());
    }

    #[test]
    fn cost_floor_and_ceiling() {
        let l = limits();
        assert!(check_trade_cost(99_999, &l).is_err());
        assert!(check_trade_cost(100_000, &l).is_ok());
        assert!(check_trade_cost(10_000_000_001, &l).is_err());
    }

    #[test]
    fn buy_slippage_bps_guard() {
        // expected 500_000 at 1%: bound 505_000
        assert!(check_buy_slippage(505_000, Some(500_000), Some(100), None).is_ok());
        let err = check_buy_slippage(520_000, Some(500_000), Some(100), None).unwrap_err();
        let te = as_transaction_error(&err).unwrap();
        assert_eq!(te.kind(), "SlippageExceeded");
    }

    #[test]
    fn buy_slippage_requires_expectation() {
        let err = check_buy_slippage(1, None, Some(100), None).unwrap_err();
        assert_eq!(as_transaction_error(&err).unwrap().kind(), "Validation");
    }

    #[test]
    fn absolute_max_cost_guard() {
        assert!(check_buy_slippage(499_999, None, None, Some(500_000)).is_ok());
        assert!(check_buy_slippage(500_001, None, None, Some(500_000)).is_err());
    }

    #[test]
    fn sell_slippage_guard() {
        // expected 500_000 at 2%: floor 490_000
        assert!(check_sell_slippage(490_000, Some(500_000), Some(200), None).is_ok());
        assert!(check_sell_slippage(489_999, Some(500_000), Some(200), None).is_err());
        assert!(check_sell_slippage(400_000, None, None, Some(450_000)).is_err());
    }

    #[test]
    fn exposure_caps() {
        let l = limits();
        assert!(check_exposure(50_000_000_000, 0, &l).is_ok());
        assert!(check_exposure(50_000_000_001, 0, &l).is_err());
        assert!(check_exposure(0, 100_000_000_001, &l).is_err());
    }

    #[test]
    fn day_start_is_utc_midnight() {
        // 2023-11-14T22:13:20Z
        let ts = 1_700_000_000;
        let start = day_start(ts);
        assert_eq!(start % DAY_SECS, 0);
        assert!(ts - start < DAY_SECS);
        assert_eq!(day_start(start), start);
    }
}
