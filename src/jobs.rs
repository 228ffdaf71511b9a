//! Background jobs: post-resolution settlement and the periodic sweep.
//!
//! Settlement runs in its own transaction, never inside the resolution
//! transaction, and is idempotent under `is_claimed` because the scheduler
//! may deliver the same option twice. A cron sweep retries options whose
//! settlement was interrupted or partially skipped.

use crate::engine::Engine;
use crate::runtime::with_retrying_tx;
use crate::store::{Ledger, MarketStatus};
use crate::updates::UpdateEnvelope;
use anyhow::Result;
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SettlementReport {
    pub credited: usize,
    pub marked_lost: usize,
    pub skipped: usize,
    pub total_paid: i64,
}

/// Fire-and-forget settlement hand-off after a resolution commits.
pub fn spawn_settlement(engine: &Engine, market_id: i64, option_id: i64) {
    let engine = engine.clone();
    tokio::spawn(async move {
        match settle_option(&engine, market_id, option_id).await {
            Ok(report) => info!(
                market_id,
                option_id,
                credited = report.credited,
                marked_lost = report.marked_lost,
                skipped = report.skipped,
                total_paid = report.total_paid,
                "auto-settlement finished"
            ),
            Err(e) => error!(market_id, option_id, error = %e, "auto-settlement failed"),
        }
    });
}

/// Credit winners and close out losers for one resolved option.
///
/// Positions whose payout the pool cannot cover are skipped and left for a
/// manual claim; the pool is never driven negative. The market lock is held
/// throughout, so crediting wallets after reading positions cannot deadlock
/// against operations that follow the global lock order.
pub async fn settle_option(
    engine: &Engine,
    market_id: i64,
    option_id: i64,
) -> Result<SettlementReport> {
    let now = engine.now();
    let (report, balance_updates) =
        with_retrying_tx!(&engine.pool, &engine.config.retry, tx, {
            let mut market = Ledger::lock_market(&mut tx, market_id).await?;
            // a disputed market is frozen; positions stay unclaimed and the
            // sweep picks them up again if the dispute clears
            if market.status()? == MarketStatus::Disputed {
                return Ok((SettlementReport::default(), Vec::new()));
            }
            let option = Ledger::lock_option(&mut tx, option_id).await?;
            if !option.is_resolved || option.market_id != market.id {
                // nothing to do; the sweep may race a manual flow
                return Ok((SettlementReport::default(), Vec::new()));
            }
            let winning_side = match option.winning_side {
                Some(side) => side,
                None => return Ok((SettlementReport::default(), Vec::new())),
            };

            let positions = Ledger::unclaimed_positions_for_option(&mut tx, option_id).await?;
            let mut report = SettlementReport::default();
            let mut balance_updates: Vec<(i64, i64)> = Vec::new();

            for position in positions {
                let winning_shares = if winning_side == 1 {
                    position.yes_shares
                } else {
                    position.no_shares
                };
                let cost_basis = position.total_yes_cost + position.total_no_cost;

                if winning_shares == 0 {
                    Ledger::finalize_position(&mut tx, position.user_id, option_id, -cost_basis)
                        .await?;
                    report.marked_lost += 1;
                    continue;
                }

                let payout = winning_shares;
                if payout > market.shared_pool_liquidity {
                    warn!(
                        user_id = position.user_id,
                        option_id,
                        payout,
                        pool = market.shared_pool_liquidity,
                        "pool cannot cover payout; leaving position for manual claim"
                    );
                    report.skipped += 1;
                    continue;
                }

                Ledger::finalize_position(
                    &mut tx,
                    position.user_id,
                    option_id,
                    payout - cost_basis,
                )
                .await?;
                let new_balance =
                    Ledger::credit_wallet(&mut tx, position.user_id, payout).await?;
                market.shared_pool_liquidity -= payout;
                report.credited += 1;
                report.total_paid += payout;
                balance_updates.push((position.user_id, new_balance));
            }

            Ledger::update_market(&mut tx, &market).await?;
            Ok((report, balance_updates))
        })?;

    for (user_id, new_balance) in balance_updates {
        engine.bus.emit(UpdateEnvelope::Balance {
            user_id,
            new_balance,
            ts: now,
        });
    }
    Ok(report)
}

/// Settle everything that still has unclaimed positions under a resolved
/// option.
pub async fn sweep_unsettled(engine: &Engine) -> Result<usize> {
    let targets = Ledger::unsettled_options(&engine.pool).await?;
    let mut settled = 0;
    for (market_id, option_id) in targets {
        match settle_option(engine, market_id, option_id).await {
            Ok(report) if report.credited + report.marked_lost > 0 => settled += 1,
            Ok(_) => {}
            Err(e) => warn!(market_id, option_id, error = %e, "sweep settlement failed"),
        }
    }
    Ok(settled)
}

/// Start the background sweep; runs once a minute.
pub async fn start_settlement_sweep(engine: Engine) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    let job = Job::new_async("0 * * * * *", move |_id, _lock| {
        let engine = engine.clone();
        Box::pin(async move {
            match sweep_unsettled(&engine).await {
                Ok(0) => {}
                Ok(n) => info!(options = n, "settlement sweep caught up"),
                Err(e) => error!(error = %e, "settlement sweep failed"),
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    Ok(scheduler)
}
