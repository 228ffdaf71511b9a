//! Liquidity engine: shared pool, proportional LP shares, reserved payouts.
//!
//! Deposits mint shares against the live pool value; withdrawals are locked
//! until the market resolves, then settle through a two-transaction protocol:
//! the claimable slice is first reserved (committed, so any concurrent claim
//! sees a smaller available pool), then paid out and released. A failed
//! payout releases its reservation through a compensating write.

use crate::engine::Engine;
use crate::error::TransactionError;
use crate::lmsr;
use crate::runtime::with_retrying_tx;
use crate::store::{Ledger, MarketStatus};
use crate::updates::{MarketEvent, UpdateEnvelope};
use anyhow::Result;
use serde::Serialize;
use tracing::{error, warn};

use crate::config::MIN_LP_DEPOSIT;

#[derive(Debug, Clone, Serialize)]
pub struct AddLiquidityOutcome {
    pub shares_minted: i64,
    pub new_pool_liquidity: i64,
    pub new_total_lp_shares: i64,
    pub new_balance: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LpClaimOutcome {
    pub payout: i64,
    pub liquidity_portion: i64,
    pub fees_portion: i64,
    pub pnl: i64,
    pub remaining_shares: i64,
    pub new_balance: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LpPositionView {
    pub shares: i64,
    pub deposited: i64,
    pub current_value: i64,
    pub claimable_value: i64,
    pub pnl: i64,
}

/// Shares minted for a deposit of `amount` against `(pool, total_shares)`.
/// Round-to-nearest; a non-zero deposit never mints zero shares.
pub fn shares_to_mint(amount: i64, pool: i64, total_shares: i64) -> i64 {
    if pool == 0 || total_shares == 0 {
        return amount;
    }
    let minted = ((amount as i128 * total_shares as i128 + pool as i128 / 2) / pool as i128) as i64;
    if minted <= 0 {
        1
    } else {
        minted
    }
}

/// Deposit into the shared pool, minting proportional LP shares.
pub async fn add_liquidity(
    engine: &Engine,
    user_id: i64,
    market_id: i64,
    amount: i64,
) -> Result<AddLiquidityOutcome> {
    if amount < MIN_LP_DEPOSIT {
        return Err(TransactionError::validation(format!(
            "deposit {amount} is below the minimum of {MIN_LP_DEPOSIT} micro-USDC"
        )));
    }
    let now = engine.now();

    let outcome = engine
        .queue
        .run((market_id, None), engine.queue_timeout(), async {
            with_retrying_tx!(&engine.pool, &engine.config.retry, tx, {
                let mut market = Ledger::lock_market(&mut tx, market_id).await?;
                match market.status()? {
                    MarketStatus::Resolved => {
                        return Err(TransactionError::validation("market is already resolved"))
                    }
                    MarketStatus::Disputed => {
                        return Err(anyhow::Error::new(TransactionError::MarketNotOpen))
                    }
                    MarketStatus::Open | MarketStatus::Resolving => {}
                }
                if !market.is_initialized {
                    return Err(TransactionError::validation("market is not initialized"));
                }

                let minted = shares_to_mint(
                    amount,
                    market.shared_pool_liquidity,
                    market.total_lp_shares,
                );

                let wallet = Ledger::lock_wallet(&mut tx, user_id).await?;
                if wallet.balance < amount
                    || !Ledger::debit_wallet(&mut tx, user_id, amount).await?
                {
                    return Err(anyhow::Error::new(TransactionError::InsufficientBalance {
                        required: amount,
                        available: wallet.balance,
                    }));
                }

                market.shared_pool_liquidity += amount;
                market.total_lp_shares += minted;
                let total_shares = Ledger::total_market_shares(&mut tx, market.id).await?;
                market.liquidity_parameter = lmsr::recompute_b(
                    market.base_liquidity_parameter,
                    market.shared_pool_liquidity,
                    total_shares,
                );
                Ledger::update_market(&mut tx, &market).await?;
                Ledger::upsert_lp_add(&mut tx, user_id, market_id, minted, amount).await?;

                Ok(AddLiquidityOutcome {
                    shares_minted: minted,
                    new_pool_liquidity: market.shared_pool_liquidity,
                    new_total_lp_shares: market.total_lp_shares,
                    new_balance: wallet.balance - amount,
                })
            })
        })
        .await?;

    engine.bus.emit(UpdateEnvelope::Balance {
        user_id,
        new_balance: outcome.new_balance,
        ts: now,
    });
    engine.bus.emit(UpdateEnvelope::Market {
        market_id,
        event: MarketEvent::Updated,
        payload: serde_json::json!({
            "pool_liquidity": outcome.new_pool_liquidity,
            "total_lp_shares": outcome.new_total_lp_shares,
        }),
        ts: now,
    });
    Ok(outcome)
}

/// Pre-resolution withdrawal is locked; a resolved market settles through
/// [`claim_lp_rewards`].
pub async fn remove_liquidity(
    engine: &Engine,
    user_id: i64,
    market_id: i64,
    shares: i64,
) -> Result<LpClaimOutcome> {
    let market = Ledger::get_market(&engine.pool, market_id).await?;
    if market.status()? != MarketStatus::Resolved {
        return Err(anyhow::Error::new(TransactionError::LockedUntilResolution));
    }
    claim_lp_rewards(engine, user_id, market_id, Some(shares)).await
}

struct Reservation {
    shares_to_claim: i64,
    liquidity_portion: i64,
    fees_portion: i64,
}

/// Post-resolution LP withdrawal. `shares` defaults to the full position.
pub async fn claim_lp_rewards(
    engine: &Engine,
    user_id: i64,
    market_id: i64,
    shares: Option<i64>,
) -> Result<LpClaimOutcome> {
    let now = engine.now();

    let outcome = engine
        .queue
        .run((market_id, None), engine.queue_timeout(), async {
            // Phase 1: size the claim against the unencumbered pool and
            // commit the reservation.
            let reservation = with_retrying_tx!(&engine.pool, &engine.config.retry, tx, {
                let mut market = Ledger::lock_market(&mut tx, market_id).await?;
                if market.status()? != MarketStatus::Resolved {
                    return Err(anyhow::Error::new(TransactionError::LockedUntilResolution));
                }
                let lp = Ledger::lock_lp_position(&mut tx, user_id, market_id)
                    .await?
                    .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("lp position")))?;
                let shares_to_claim = shares.unwrap_or(lp.shares);
                if shares_to_claim <= 0 {
                    return Err(TransactionError::validation("share count must be positive"));
                }
                if shares_to_claim > lp.shares {
                    return Err(anyhow::Error::new(TransactionError::InsufficientShares {
                        required: shares_to_claim,
                        available: lp.shares,
                    }));
                }
                if market.total_lp_shares <= 0 {
                    return Err(TransactionError::validation("market has no LP shares"));
                }

                let pending = Ledger::pending_claims(tx.as_mut(), market_id).await?;
                let available = (market.shared_pool_liquidity - pending - market.reserved_liquidity)
                    .max(0);
                let liquidity_portion = (available as i128 * shares_to_claim as i128
                    / market.total_lp_shares as i128) as i64;
                let fees_portion = (market.accumulated_lp_fees as i128 * shares_to_claim as i128
                    / market.total_lp_shares as i128) as i64;

                if liquidity_portion + fees_portion == 0 {
                    return Err(TransactionError::validation(
                        "nothing claimable: the pool is fully reserved or owed to traders",
                    ));
                }
                if market.reserved_liquidity + liquidity_portion
                    > market.shared_pool_liquidity - pending
                {
                    return Err(anyhow::Error::new(TransactionError::Conflict(
                        "reservation would exceed the unencumbered pool".into(),
                    )));
                }

                market.reserved_liquidity += liquidity_portion;
                Ledger::update_market(&mut tx, &market).await?;
                Ok(Reservation {
                    shares_to_claim,
                    liquidity_portion,
                    fees_portion,
                })
            })?;

            // Phase 2: pay out and release the reservation. On failure the
            // reservation is rolled back by a compensating write. The inner
            // async block also captures begin/commit failures.
            let payout_result: Result<LpClaimOutcome> = async {
                with_retrying_tx!(&engine.pool, &engine.config.retry, tx, {
                    let mut market = Ledger::lock_market(&mut tx, market_id).await?;
                    // wallet lock taken before the LP position per the global order
                    let _wallet = Ledger::lock_wallet(&mut tx, user_id).await?;
                    let lp = Ledger::lock_lp_position(&mut tx, user_id, market_id)
                        .await?
                        .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("lp position")))?;
                    if lp.shares < reservation.shares_to_claim {
                        return Err(anyhow::Error::new(TransactionError::Conflict(
                            "LP position changed between reservation and payout".into(),
                        )));
                    }

                    let payout = reservation.liquidity_portion + reservation.fees_portion;
                    market.reserved_liquidity -= reservation.liquidity_portion;
                    market.shared_pool_liquidity -= reservation.liquidity_portion;
                    market.accumulated_lp_fees -= reservation.fees_portion;
                    market.total_lp_shares -= reservation.shares_to_claim;
                    Ledger::update_market(&mut tx, &market).await?;

                    let remaining_shares = lp.shares - reservation.shares_to_claim;
                    let remaining_deposit = if lp.shares > 0 {
                        (lp.deposited_amount as i128 * remaining_shares as i128 / lp.shares as i128)
                            as i64
                    } else {
                        0
                    };
                    let deposit_claimed = lp.deposited_amount - remaining_deposit;
                    Ledger::settle_lp_position(
                        &mut tx,
                        user_id,
                        market_id,
                        remaining_shares,
                        remaining_deposit,
                    )
                    .await?;
                    let new_balance = Ledger::credit_wallet(&mut tx, user_id, payout).await?;

                    Ok(LpClaimOutcome {
                        payout,
                        liquidity_portion: reservation.liquidity_portion,
                        fees_portion: reservation.fees_portion,
                        pnl: payout - deposit_claimed,
                        remaining_shares,
                        new_balance,
                    })
                })
            }
            .await;

            match payout_result {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    release_reservation(engine, market_id, reservation.liquidity_portion).await;
                    Err(e)
                }
            }
        })
        .await?;

    engine.bus.emit(UpdateEnvelope::Balance {
        user_id,
        new_balance: outcome.new_balance,
        ts: now,
    });
    engine.bus.emit(UpdateEnvelope::Market {
        market_id,
        event: MarketEvent::Updated,
        payload: serde_json::json!({ "lp_claim": outcome.payout }),
        ts: now,
    });
    Ok(outcome)
}

/// Compensating write for a failed phase-2 payout.
async fn release_reservation(engine: &Engine, market_id: i64, liquidity_portion: i64) {
    if liquidity_portion == 0 {
        return;
    }
    let released: Result<()> = async {
        with_retrying_tx!(&engine.pool, &engine.config.retry, tx, {
            let mut market = Ledger::lock_market(&mut tx, market_id).await?;
            market.reserved_liquidity = (market.reserved_liquidity - liquidity_portion).max(0);
            Ledger::update_market(&mut tx, &market).await?;
            Ok(())
        })
    }
    .await;
    match released {
        Ok(()) => warn!(market_id, liquidity_portion, "released orphaned LP reservation"),
        Err(e) => error!(
            market_id,
            liquidity_portion,
            error = %e,
            "failed to release LP reservation; reserved_liquidity is overstated"
        ),
    }
}

/// Read-only valuation of an LP position.
pub async fn get_lp_position(
    engine: &Engine,
    user_id: i64,
    market_id: i64,
) -> Result<LpPositionView> {
    let market = Ledger::get_market(&engine.pool, market_id).await?;
    let lp = Ledger::get_lp_position(&engine.pool, user_id, market_id)
        .await?
        .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("lp position")))?;

    if market.total_lp_shares <= 0 || lp.shares <= 0 {
        return Ok(LpPositionView {
            shares: lp.shares,
            deposited: lp.deposited_amount,
            current_value: 0,
            claimable_value: 0,
            pnl: -lp.deposited_amount,
        });
    }

    let gross_value = market.shared_pool_liquidity as i128 + market.accumulated_lp_fees as i128;
    let current_value = (gross_value * lp.shares as i128 / market.total_lp_shares as i128) as i64;

    let pending = Ledger::pending_claims(&engine.pool, market_id).await?;
    let available =
        (market.shared_pool_liquidity - pending - market.reserved_liquidity).max(0) as i128;
    let claimable_value = ((available + market.accumulated_lp_fees as i128) * lp.shares as i128
        / market.total_lp_shares as i128) as i64;

    Ok(LpPositionView {
        shares: lp.shares,
        deposited: lp.deposited_amount,
        current_value,
        claimable_value,
        pnl: current_value - lp.deposited_amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_mints_one_to_one() {
        assert_eq!(shares_to_mint(10_000_000, 0, 0), 10_000_000);
        assert_eq!(shares_to_mint(10_000_000, 10_000_000, 0), 10_000_000);
    }

    #[test]
    fn proportional_mint_preserves_share_value() {
        // pool 20, shares 10: each share is worth 2; a 6 deposit mints 3
        assert_eq!(shares_to_mint(6_000_000, 20_000_000, 10_000_000), 3_000_000);
    }

    #[test]
    fn mint_rounds_to_nearest() {
        // 3 into pool 9 with 2 shares: 3*2/9 = 0.666... rounds to 1
        assert_eq!(shares_to_mint(3, 9, 2), 1);
        // 1 into pool 9 with 2 shares: 0.222... rounds to 0, floored to 1
        assert_eq!(shares_to_mint(1, 9, 2), 1);
    }

    #[test]
    fn huge_pool_cannot_zero_out_a_deposit() {
        // a large pool next to a minimum deposit still mints at least 1 share
        let minted = shares_to_mint(MIN_LP_DEPOSIT, i64::MAX / 4, 10);
        assert_eq!(minted, 1);
    }

    #[test]
    fn share_value_unchanged_within_rounding() {
        // after minting, value per share moves by at most one micro-unit
        let (pool, total) = (33_333_333i64, 17_000_000i64);
        let amount = 5_500_000i64;
        let minted = shares_to_mint(amount, pool, total);
        let before = pool as f64 / total as f64;
        let after = (pool + amount) as f64 / (total + minted) as f64;
        assert!((before - after).abs() / before < 1e-6, "{before} vs {after}");
    }
}
