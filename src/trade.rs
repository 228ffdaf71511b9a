//! Trade engine: buys, sells, and winnings claims.
//!
//! Every operation is serialized through the market queue, then runs inside a
//! retrying transaction taking row locks in the global order
//! Market -> Option -> Wallet -> Position. Update envelopes are emitted only
//! after the transaction commits.

use crate::engine::Engine;
use crate::error::TransactionError;
use crate::lmsr::{self, Side, PRECISION};
use crate::runtime::with_retrying_tx;
use crate::snapshots;
use crate::store::{Ledger, MarketStatus};
use crate::updates::UpdateEnvelope;
use crate::validation::{
    check_buy_slippage, check_exposure, check_sell_slippage, check_trade_cost, day_start,
    validate_trade_quantities,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct BuyRequest {
    pub user_id: i64,
    pub market_id: i64,
    pub option_id: i64,
    #[serde(default)]
    pub buy_yes: i64,
    #[serde(default)]
    pub buy_no: i64,
    pub max_cost: Option<i64>,
    pub expected_cost: Option<i64>,
    pub slippage_bps: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SellRequest {
    pub user_id: i64,
    pub market_id: i64,
    pub option_id: i64,
    #[serde(default)]
    pub sell_yes: i64,
    #[serde(default)]
    pub sell_no: i64,
    pub min_payout: Option<i64>,
    pub expected_payout: Option<i64>,
    pub slippage_bps: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeReceipt {
    pub trade_id: i64,
    pub market_id: i64,
    pub option_id: i64,
    pub trade_type: String,
    pub side: Side,
    pub quantity: i64,
    pub price_per_share: i64,
    /// Gross LMSR notional before fees.
    pub gross: i64,
    pub fees_paid: i64,
    /// Net cash flow: charge for buys, payout for sells.
    pub total: i64,
    pub new_balance: i64,
    pub yes_price: i64,
    pub no_price: i64,
    pub realized_pnl: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimOutcome {
    pub payout: i64,
    pub winning_side: i16,
    pub realized_pnl: i64,
    pub already_claimed: bool,
}

struct TradeCommit {
    receipt: TradeReceipt,
    ts: i64,
    yes_qty: i64,
    no_qty: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuyForAmountRequest {
    pub user_id: i64,
    pub market_id: i64,
    pub option_id: i64,
    pub side: Side,
    /// Total budget including the fee, micro-USDC.
    pub amount: i64,
    pub slippage_bps: Option<i64>,
}

/// Spend-driven buy: invert the cost function for the largest share count
/// whose total charge fits the budget, then run the regular buy pipeline
/// with the budget as the absolute cost bound. A price moving past the
/// budget between the quote and the trade surfaces as `SlippageExceeded`.
pub async fn buy_for_amount(engine: &Engine, req: BuyForAmountRequest) -> Result<TradeReceipt> {
    let limits = engine.limits.get(&engine.pool).await?;
    if req.amount < crate::config::MIN_TRADE_COST {
        return Err(TransactionError::validation(format!(
            "amount {} is below the minimum trade cost of {}",
            req.amount,
            crate::config::MIN_TRADE_COST
        )));
    }
    let market = Ledger::get_market(&engine.pool, req.market_id).await?;
    let option = Ledger::get_option(&engine.pool, req.option_id).await?;

    // leave room for the fee inside the budget
    let gross_budget =
        (req.amount as i128 * 10_000 / (10_000 + limits.fees.total_fee_bps) as i128) as i64;
    let quantity = lmsr::shares_for_amount(
        option.yes_quantity,
        option.no_quantity,
        market.liquidity_parameter,
        req.side,
        gross_budget,
    )
    .map_err(TransactionError::validation)?;

    let (buy_yes, buy_no) = match req.side {
        Side::Yes => (quantity, 0),
        Side::No => (0, quantity),
    };
    buy_shares(
        engine,
        BuyRequest {
            user_id: req.user_id,
            market_id: req.market_id,
            option_id: req.option_id,
            buy_yes,
            buy_no,
            max_cost: Some(req.amount),
            expected_cost: Some(req.amount),
            slippage_bps: req.slippage_bps,
        },
    )
    .await
}

/// Buy YES or NO micro-shares at the LMSR price plus the trade fee.
pub async fn buy_shares(engine: &Engine, req: BuyRequest) -> Result<TradeReceipt> {
    let (side, quantity) = validate_trade_quantities(req.buy_yes, req.buy_no)?;
    let limits = engine.limits.get(&engine.pool).await?;
    let now = engine.now();

    let commit = engine
        .queue
        .run(
            (req.market_id, Some(req.option_id)),
            engine.queue_timeout(),
            async {
                with_retrying_tx!(&engine.pool, &engine.config.retry, tx, {
                    let mut market = Ledger::lock_market(&mut tx, req.market_id).await?;
                    if market.status()? != MarketStatus::Open {
                        return Err(anyhow::Error::new(TransactionError::MarketNotOpen));
                    }
                    if !market.is_initialized {
                        return Err(TransactionError::validation("market is not initialized"));
                    }
                    let mut option = Ledger::lock_option(&mut tx, req.option_id).await?;
                    if option.market_id != market.id {
                        return Err(TransactionError::validation(
                            "option does not belong to this market",
                        ));
                    }
                    if option.is_resolved {
                        return Err(anyhow::Error::new(TransactionError::OptionAlreadyResolved));
                    }

                    let b = market.liquidity_parameter;
                    let (delta_yes, delta_no) = match side {
                        Side::Yes => (quantity, 0),
                        Side::No => (0, quantity),
                    };
                    let gross =
                        lmsr::buy_cost(option.yes_quantity, option.no_quantity, b, delta_yes, delta_no)
                            .map_err(TransactionError::validation)?;
                    let fees = limits.fees.split(gross);
                    let total_charge = gross + fees.total;

                    check_trade_cost(total_charge, &limits)?;
                    let position_cost =
                        Ledger::user_market_cost(&mut tx, req.user_id, market.id).await? + gross;
                    let day_volume =
                        Ledger::user_volume_since(&mut tx, req.user_id, day_start(now)).await?
                            + total_charge;
                    check_exposure(position_cost, day_volume, &limits)?;
                    check_buy_slippage(total_charge, req.expected_cost, req.slippage_bps, req.max_cost)?;

                    let wallet = Ledger::lock_wallet(&mut tx, req.user_id).await?;
                    if wallet.balance < total_charge
                        || !Ledger::debit_wallet(&mut tx, req.user_id, total_charge).await?
                    {
                        return Err(anyhow::Error::new(TransactionError::InsufficientBalance {
                            required: total_charge,
                            available: wallet.balance,
                        }));
                    }

                    option.yes_quantity += delta_yes;
                    option.no_quantity += delta_no;
                    Ledger::update_option_quantities(
                        &mut tx,
                        option.id,
                        option.yes_quantity,
                        option.no_quantity,
                    )
                    .await?;

                    market.shared_pool_liquidity += gross;
                    market.accumulated_lp_fees += fees.lp;
                    market.creator_fees += fees.creator;
                    market.protocol_fees += fees.protocol;
                    market.total_volume += gross;
                    let total_shares = Ledger::total_market_shares(&mut tx, market.id).await?;
                    market.liquidity_parameter = lmsr::recompute_b(
                        market.base_liquidity_parameter,
                        market.shared_pool_liquidity,
                        total_shares,
                    );
                    Ledger::update_market(&mut tx, &market).await?;

                    Ledger::upsert_position_buy(
                        &mut tx,
                        req.user_id,
                        option.id,
                        market.id,
                        side,
                        quantity,
                        gross,
                    )
                    .await?;

                    let price_per_share = (gross as i128 * PRECISION as i128 / quantity as i128) as i64;
                    let trade_id = Ledger::insert_trade(
                        &mut tx,
                        req.user_id,
                        market.id,
                        option.id,
                        "buy",
                        side,
                        quantity,
                        price_per_share,
                        total_charge,
                        fees.total,
                        now,
                    )
                    .await?;
                    snapshots::record_trade_snapshot(
                        &mut tx,
                        &option,
                        market.liquidity_parameter,
                        now,
                        gross,
                        Some(trade_id),
                    )
                    .await?;

                    let yes_price =
                        lmsr::yes_price(option.yes_quantity, option.no_quantity, market.liquidity_parameter)
                            .map_err(TransactionError::validation)?;
                    Ok(TradeCommit {
                        receipt: TradeReceipt {
                            trade_id,
                            market_id: market.id,
                            option_id: option.id,
                            trade_type: "buy".into(),
                            side,
                            quantity,
                            price_per_share,
                            gross,
                            fees_paid: fees.total,
                            total: total_charge,
                            new_balance: wallet.balance - total_charge,
                            yes_price,
                            no_price: PRECISION - yes_price,
                            realized_pnl: 0,
                        },
                        ts: now,
                        yes_qty: option.yes_quantity,
                        no_qty: option.no_quantity,
                    })
                })
            },
        )
        .await?;

    emit_committed(engine, req.user_id, &commit);
    Ok(commit.receipt)
}

/// Sell previously bought shares back to the market.
pub async fn sell_shares(engine: &Engine, req: SellRequest) -> Result<TradeReceipt> {
    let (side, quantity) = validate_trade_quantities(req.sell_yes, req.sell_no)?;
    let limits = engine.limits.get(&engine.pool).await?;
    let now = engine.now();

    let commit = engine
        .queue
        .run(
            (req.market_id, Some(req.option_id)),
            engine.queue_timeout(),
            async {
                with_retrying_tx!(&engine.pool, &engine.config.retry, tx, {
                    let mut market = Ledger::lock_market(&mut tx, req.market_id).await?;
                    if market.status()? != MarketStatus::Open {
                        return Err(anyhow::Error::new(TransactionError::MarketNotOpen));
                    }
                    if !market.is_initialized {
                        return Err(TransactionError::validation("market is not initialized"));
                    }
                    let mut option = Ledger::lock_option(&mut tx, req.option_id).await?;
                    if option.market_id != market.id {
                        return Err(TransactionError::validation(
                            "option does not belong to this market",
                        ));
                    }
                    if option.is_resolved {
                        return Err(anyhow::Error::new(TransactionError::OptionAlreadyResolved));
                    }

                    let wallet = Ledger::lock_wallet(&mut tx, req.user_id).await?;
                    let position = Ledger::lock_position(&mut tx, req.user_id, option.id)
                        .await?
                        .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("position")))?;
                    if position.is_claimed {
                        return Err(TransactionError::validation("position has been finalized"));
                    }
                    let (side_shares, side_cost) = match side {
                        Side::Yes => (position.yes_shares, position.total_yes_cost),
                        Side::No => (position.no_shares, position.total_no_cost),
                    };
                    if side_shares < quantity {
                        return Err(anyhow::Error::new(TransactionError::InsufficientShares {
                            required: quantity,
                            available: side_shares,
                        }));
                    }

                    let b = market.liquidity_parameter;
                    let (delta_yes, delta_no) = match side {
                        Side::Yes => (quantity, 0),
                        Side::No => (0, quantity),
                    };
                    let payout =
                        lmsr::sell_payout(option.yes_quantity, option.no_quantity, b, delta_yes, delta_no)
                            .map_err(TransactionError::validation)?;
                    let fees = limits.fees.split(payout);
                    let net = payout - fees.total;

                    check_trade_cost(payout, &limits)?;
                    let day_volume =
                        Ledger::user_volume_since(&mut tx, req.user_id, day_start(now)).await? + payout;
                    let position_cost = Ledger::user_market_cost(&mut tx, req.user_id, market.id).await?;
                    check_exposure(position_cost, day_volume, &limits)?;
                    check_sell_slippage(net, req.expected_payout, req.slippage_bps, req.min_payout)?;

                    if market.shared_pool_liquidity < payout {
                        return Err(anyhow::Error::new(TransactionError::Conflict(format!(
                            "pool {} cannot cover payout {payout}",
                            market.shared_pool_liquidity
                        ))));
                    }

                    // proportional cost basis with round-to-nearest
                    let basis = if side_shares > 0 && side_cost > 0 {
                        let numer = side_cost as i128 * quantity as i128;
                        let rounded = (numer + side_shares as i128 / 2) / side_shares as i128;
                        (rounded.max(0) as i64).min(side_cost)
                    } else {
                        0
                    };
                    let realized = net - basis;

                    option.yes_quantity -= delta_yes;
                    option.no_quantity -= delta_no;
                    Ledger::update_option_quantities(
                        &mut tx,
                        option.id,
                        option.yes_quantity,
                        option.no_quantity,
                    )
                    .await?;

                    market.shared_pool_liquidity -= payout;
                    market.accumulated_lp_fees += fees.lp;
                    market.creator_fees += fees.creator;
                    market.protocol_fees += fees.protocol;
                    market.total_volume += payout;
                    let total_shares = Ledger::total_market_shares(&mut tx, market.id).await?;
                    market.liquidity_parameter = lmsr::recompute_b(
                        market.base_liquidity_parameter,
                        market.shared_pool_liquidity,
                        total_shares,
                    );
                    Ledger::update_market(&mut tx, &market).await?;

                    Ledger::update_position_sell(
                        &mut tx,
                        req.user_id,
                        option.id,
                        side,
                        quantity,
                        basis,
                        realized,
                    )
                    .await?;
                    Ledger::credit_wallet(&mut tx, req.user_id, net).await?;

                    let price_per_share = (payout as i128 * PRECISION as i128 / quantity as i128) as i64;
                    let trade_id = Ledger::insert_trade(
                        &mut tx,
                        req.user_id,
                        market.id,
                        option.id,
                        "sell",
                        side,
                        quantity,
                        price_per_share,
                        net,
                        fees.total,
                        now,
                    )
                    .await?;
                    snapshots::record_trade_snapshot(
                        &mut tx,
                        &option,
                        market.liquidity_parameter,
                        now,
                        payout,
                        Some(trade_id),
                    )
                    .await?;

                    let yes_price =
                        lmsr::yes_price(option.yes_quantity, option.no_quantity, market.liquidity_parameter)
                            .map_err(TransactionError::validation)?;
                    Ok(TradeCommit {
                        receipt: TradeReceipt {
                            trade_id,
                            market_id: market.id,
                            option_id: option.id,
                            trade_type: "sell".into(),
                            side,
                            quantity,
                            price_per_share,
                            gross: payout,
                            fees_paid: fees.total,
                            total: net,
                            new_balance: wallet.balance + net,
                            yes_price,
                            no_price: PRECISION - yes_price,
                            realized_pnl: realized,
                        },
                        ts: now,
                        yes_qty: option.yes_quantity,
                        no_qty: option.no_quantity,
                    })
                })
            },
        )
        .await?;

    emit_committed(engine, req.user_id, &commit);
    Ok(commit.receipt)
}

fn emit_committed(engine: &Engine, user_id: i64, commit: &TradeCommit) {
    let r = &commit.receipt;
    engine.bus.emit(UpdateEnvelope::Trade {
        market_id: r.market_id,
        option_id: r.option_id,
        trade_type: r.trade_type.clone(),
        side: r.side,
        quantity: r.quantity,
        price_per_share: r.price_per_share,
        ts: commit.ts,
    });
    engine.bus.emit(UpdateEnvelope::Price {
        option_id: r.option_id,
        yes_price: r.yes_price,
        no_price: r.no_price,
        yes_qty: commit.yes_qty,
        no_qty: commit.no_qty,
        ts: commit.ts,
    });
    engine.bus.emit(UpdateEnvelope::Balance {
        user_id,
        new_balance: r.new_balance,
        ts: commit.ts,
    });
}

/// Redeem a finalized position: winning shares pay face value, one
/// micro-share to one micro-USDC. Idempotent under `is_claimed`.
pub async fn claim_winnings(
    engine: &Engine,
    user_id: i64,
    market_id: i64,
    option_id: i64,
) -> Result<ClaimOutcome> {
    let now = engine.now();
    let (outcome, new_balance) = engine
        .queue
        .run((market_id, Some(option_id)), engine.queue_timeout(), async {
            with_retrying_tx!(&engine.pool, &engine.config.retry, tx, {
                let mut market = Ledger::lock_market(&mut tx, market_id).await?;
                // a disputed market is frozen: no payouts while the outcome
                // is contested
                if market.status()? == MarketStatus::Disputed {
                    return Err(anyhow::Error::new(TransactionError::MarketNotOpen));
                }
                let option = Ledger::lock_option(&mut tx, option_id).await?;
                if option.market_id != market.id {
                    return Err(TransactionError::validation(
                        "option does not belong to this market",
                    ));
                }
                if !option.is_resolved {
                    return Err(TransactionError::validation("option is not resolved yet"));
                }
                let winning_side = option
                    .winning_side
                    .ok_or_else(|| TransactionError::validation("resolved option has no winning side"))?;

                let wallet = Ledger::lock_wallet(&mut tx, user_id).await?;
                let position = Ledger::lock_position(&mut tx, user_id, option_id)
                    .await?
                    .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("position")))?;
                if position.is_claimed {
                    return Ok((
                        ClaimOutcome {
                            payout: 0,
                            winning_side,
                            realized_pnl: 0,
                            already_claimed: true,
                        },
                        wallet.balance,
                    ));
                }

                let winning_shares = if winning_side == 1 {
                    position.yes_shares
                } else {
                    position.no_shares
                };
                let payout = winning_shares;
                if payout > market.shared_pool_liquidity {
                    return Err(anyhow::Error::new(TransactionError::Conflict(format!(
                        "pool {} cannot cover payout {payout}",
                        market.shared_pool_liquidity
                    ))));
                }

                let realized = payout - (position.total_yes_cost + position.total_no_cost);
                Ledger::finalize_position(&mut tx, user_id, option_id, realized).await?;
                let new_balance = if payout > 0 {
                    market.shared_pool_liquidity -= payout;
                    Ledger::update_market(&mut tx, &market).await?;
                    Ledger::credit_wallet(&mut tx, user_id, payout).await?
                } else {
                    wallet.balance
                };

                Ok((
                    ClaimOutcome {
                        payout,
                        winning_side,
                        realized_pnl: realized,
                        already_claimed: false,
                    },
                    new_balance,
                ))
            })
        })
        .await?;

    if !outcome.already_claimed && outcome.payout > 0 {
        engine.bus.emit(UpdateEnvelope::Balance {
            user_id,
            new_balance,
            ts: now,
        });
    }
    Ok(outcome)
}
