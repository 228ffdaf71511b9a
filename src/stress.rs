//! Concurrent soak harness for the exchange core.
//!
//! Drives real buys, sells, liquidity deposits, resolutions, and claims
//! through the public operations against a disposable database, then sweeps
//! the financial invariants: cash conservation, no negative state, and
//! pending-claims safety. Parameters come from STRESS_* environment
//! variables.

use crate::engine::{self, CreateMarketRequest, Engine};
use crate::error::as_transaction_error;
use crate::jobs;
use crate::liquidity;
use crate::resolution::{self, SubmitResolutionRequest};
use crate::store::Ledger;
use crate::trade::{self, BuyRequest, SellRequest};
use anyhow::{anyhow, Result};
use rand::prelude::*;
use sqlx::{PgPool, Row};
use std::env;
use std::time::Instant;
use tracing::{info, warn};

const DEFAULT_NUM_USERS: usize = 20;
const DEFAULT_NUM_MARKETS: usize = 5;
const DEFAULT_TRADES_PER_USER: usize = 50;
const DEFAULT_BATCH_SIZE: usize = 16;
const DEFAULT_SELL_PROBABILITY: f64 = 0.25;

/// Initial wallet top-up per user: 10k USDC.
const INITIAL_DEPOSIT: i64 = 10_000_000_000;
/// Creator seed liquidity per market: 1k USDC.
const SEED_LIQUIDITY: i64 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct StressConfig {
    pub num_users: usize,
    pub num_markets: usize,
    pub trades_per_user: usize,
    pub batch_size: usize,
    pub sell_probability: f64,
}

impl StressConfig {
    pub fn from_env() -> Self {
        Self {
            num_users: env_usize("STRESS_NUM_USERS", DEFAULT_NUM_USERS),
            num_markets: env_usize("STRESS_NUM_MARKETS", DEFAULT_NUM_MARKETS),
            trades_per_user: env_usize("STRESS_TRADES_PER_USER", DEFAULT_TRADES_PER_USER),
            batch_size: env_usize("STRESS_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            sell_probability: env_f64("STRESS_SELL_PROBABILITY", DEFAULT_SELL_PROBABILITY)
                .clamp(0.0, 1.0),
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

/// Drop every engine table so the run starts clean.
pub async fn reset_database(pool: &PgPool) -> Result<()> {
    for table in [
        "disputes",
        "resolution_submissions",
        "price_snapshots",
        "trades",
        "lp_positions",
        "user_positions",
        "market_options",
        "markets",
        "wallets",
        "admin_config",
        "users",
    ] {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
            .execute(pool)
            .await?;
    }
    Ok(())
}

struct Fixture {
    admin_id: i64,
    user_ids: Vec<i64>,
    /// (market_id, option_ids)
    markets: Vec<(i64, Vec<i64>)>,
    total_deposited: i64,
}

async fn build_fixture(engine: &Engine, stress: &StressConfig) -> Result<Fixture> {
    let admin_id = Ledger::create_user(&engine.pool, "stress_admin", true).await?;
    engine::deposit(engine, admin_id, INITIAL_DEPOSIT).await?;
    let mut total_deposited = INITIAL_DEPOSIT;

    let mut user_ids = Vec::with_capacity(stress.num_users);
    for i in 0..stress.num_users {
        let user_id =
            Ledger::create_user(&engine.pool, &format!("stress_user_{i}"), false).await?;
        engine::deposit(engine, user_id, INITIAL_DEPOSIT).await?;
        total_deposited += INITIAL_DEPOSIT;
        user_ids.push(user_id);
    }
    info!(users = stress.num_users, "created stress users");

    let expiration = chrono::Utc::now().timestamp() + 30 * 86_400;
    let mut markets = Vec::with_capacity(stress.num_markets);
    for i in 0..stress.num_markets {
        let summary = engine::create_market(
            engine,
            CreateMarketRequest {
                creator_id: admin_id,
                question: format!("Stress market #{i}?"),
                option_labels: vec![format!("outcome-{i}-a"), format!("outcome-{i}-b")],
                expiration_ts: expiration,
                resolution_mode: "authority".into(),
                base_liquidity_parameter: 1_000,
            },
        )
        .await?;
        engine::initialize_market(engine, admin_id, summary.id).await?;
        liquidity::add_liquidity(engine, admin_id, summary.id, SEED_LIQUIDITY).await?;
        let option_ids = summary.options.iter().map(|o| o.id).collect();
        markets.push((summary.id, option_ids));
    }
    info!(markets = stress.num_markets, "created and seeded stress markets");

    Ok(Fixture {
        admin_id,
        user_ids,
        markets,
        total_deposited,
    })
}

#[derive(Debug, Default)]
struct TradeStats {
    executed: usize,
    rejected: usize,
    failed: usize,
}

async fn run_trade_wave(engine: &Engine, stress: &StressConfig, fixture: &Fixture) -> Result<TradeStats> {
    let mut stats = TradeStats::default();
    let total = fixture.user_ids.len() * stress.trades_per_user;
    let started = Instant::now();

    let mut pending = Vec::new();
    for i in 0..total {
        let engine = engine.clone();
        let user_id = fixture.user_ids[i % fixture.user_ids.len()];
        let (market_id, option_ids) = fixture.markets[i % fixture.markets.len()].clone();
        let sell_probability = stress.sell_probability;

        pending.push(tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            let option_id = option_ids[rng.gen_range(0..option_ids.len())];
            let quantity = rng.gen_range(100_000i64..5_000_000);
            let buy_yes = rng.gen_bool(0.5);

            if rng.gen_bool(sell_probability) {
                let req = SellRequest {
                    user_id,
                    market_id,
                    option_id,
                    sell_yes: if buy_yes { quantity } else { 0 },
                    sell_no: if buy_yes { 0 } else { quantity },
                    min_payout: None,
                    expected_payout: None,
                    slippage_bps: None,
                };
                trade::sell_shares(&engine, req).await.map(|_| ())
            } else {
                let req = BuyRequest {
                    user_id,
                    market_id,
                    option_id,
                    buy_yes: if buy_yes { quantity } else { 0 },
                    buy_no: if buy_yes { 0 } else { quantity },
                    max_cost: None,
                    expected_cost: None,
                    slippage_bps: None,
                };
                trade::buy_shares(&engine, req).await.map(|_| ())
            }
        }));

        if pending.len() >= stress.batch_size {
            drain(&mut pending, &mut stats).await;
        }
    }
    drain(&mut pending, &mut stats).await;

    let secs = started.elapsed().as_secs_f64();
    info!(
        executed = stats.executed,
        rejected = stats.rejected,
        failed = stats.failed,
        throughput = format!("{:.0}/s", stats.executed as f64 / secs.max(0.001)),
        "trade wave finished"
    );
    Ok(stats)
}

async fn drain(
    pending: &mut Vec<tokio::task::JoinHandle<Result<()>>>,
    stats: &mut TradeStats,
) {
    for handle in pending.drain(..) {
        match handle.await {
            Ok(Ok(())) => stats.executed += 1,
            // business rejections (insufficient shares on a sell, caps) are
            // expected noise in a random workload
            Ok(Err(e)) if as_transaction_error(&e).is_some() => stats.rejected += 1,
            Ok(Err(e)) => {
                warn!(error = %e, "trade failed unexpectedly");
                stats.failed += 1;
            }
            Err(e) => {
                warn!(error = %e, "trade task panicked");
                stats.failed += 1;
            }
        }
    }
}

async fn resolve_and_settle(engine: &Engine, fixture: &Fixture) -> Result<()> {
    for (market_id, option_ids) in &fixture.markets {
        for (i, option_id) in option_ids.iter().enumerate() {
            resolution::submit_resolution(
                engine,
                SubmitResolutionRequest {
                    user_id: fixture.admin_id,
                    market_id: *market_id,
                    option_id: *option_id,
                    outcome: if i % 2 == 0 { "yes".into() } else { "no".into() },
                    winning_side: None,
                    evidence: None,
                    signature: None,
                },
            )
            .await?;
        }
    }
    // run the sweep synchronously so the harness does not race the spawned
    // settlement tasks
    jobs::sweep_unsettled(engine).await?;
    jobs::sweep_unsettled(engine).await?;

    // LPs exit
    for (market_id, _) in &fixture.markets {
        match liquidity::claim_lp_rewards(engine, fixture.admin_id, *market_id, None).await {
            Ok(outcome) => info!(market_id, payout = outcome.payout, "LP exit"),
            Err(e) if as_transaction_error(&e).is_some() => {
                info!(market_id, error = %e, "LP exit rejected")
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Cash conservation: wallets + pools + fee accumulators must equal deposits.
pub async fn verify_conservation(pool: &PgPool, expected_total: i64) -> Result<()> {
    let wallets: i64 =
        sqlx::query_scalar("SELECT COALESCE(SUM(balance), 0)::BIGINT FROM wallets")
            .fetch_one(pool)
            .await?;
    let row = sqlx::query(
        "SELECT
            COALESCE(SUM(shared_pool_liquidity), 0)::BIGINT AS pools,
            COALESCE(SUM(accumulated_lp_fees), 0)::BIGINT AS lp_fees,
            COALESCE(SUM(creator_fees), 0)::BIGINT AS creator_fees,
            COALESCE(SUM(protocol_fees), 0)::BIGINT AS protocol_fees
         FROM markets",
    )
    .fetch_one(pool)
    .await?;
    let pools: i64 = row.get("pools");
    let lp_fees: i64 = row.get("lp_fees");
    let creator_fees: i64 = row.get("creator_fees");
    let protocol_fees: i64 = row.get("protocol_fees");

    let total = wallets + pools + lp_fees + creator_fees + protocol_fees;
    if total != expected_total {
        return Err(anyhow!(
            "cash conservation violated: wallets {wallets} + pools {pools} + lp {lp_fees} \
             + creator {creator_fees} + protocol {protocol_fees} = {total}, expected {expected_total}"
        ));
    }
    info!(total, "cash conservation holds");
    Ok(())
}

/// No-negative-state and reservation invariants over every row.
pub async fn verify_non_negative(pool: &PgPool) -> Result<()> {
    let bad_wallets: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM wallets WHERE balance < 0")
            .fetch_one(pool)
            .await?;
    let bad_markets: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM markets
         WHERE shared_pool_liquidity < 0
            OR accumulated_lp_fees < 0
            OR total_lp_shares < 0
            OR reserved_liquidity < 0
            OR reserved_liquidity > shared_pool_liquidity",
    )
    .fetch_one(pool)
    .await?;
    let bad_options: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM market_options WHERE yes_quantity < 0 OR no_quantity < 0",
    )
    .fetch_one(pool)
    .await?;
    let bad_positions: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM user_positions WHERE yes_shares < 0 OR no_shares < 0",
    )
    .fetch_one(pool)
    .await?;

    if bad_wallets + bad_markets + bad_options + bad_positions > 0 {
        return Err(anyhow!(
            "negative state detected: wallets {bad_wallets}, markets {bad_markets}, \
             options {bad_options}, positions {bad_positions}"
        ));
    }
    info!("no negative state");
    Ok(())
}

/// Pending-claims safety for resolved markets.
pub async fn verify_pending_claims(pool: &PgPool) -> Result<()> {
    let markets = sqlx::query("SELECT id FROM markets WHERE status = 'resolved'")
        .fetch_all(pool)
        .await?;
    for row in markets {
        let market_id: i64 = row.get("id");
        let market = Ledger::get_market(pool, market_id).await?;
        let pending = Ledger::pending_claims(pool, market_id).await?;
        if market.shared_pool_liquidity < pending + market.reserved_liquidity {
            return Err(anyhow!(
                "pending-claims safety violated on market {market_id}: pool {} < pending {pending} + reserved {}",
                market.shared_pool_liquidity,
                market.reserved_liquidity
            ));
        }
    }
    info!("pending-claims safety holds");
    Ok(())
}

/// Full soak: fixture, concurrent trade wave, resolution, settlement, LP
/// exits, invariant sweep.
pub async fn run_stress_test(engine: &Engine) -> Result<()> {
    let stress = StressConfig::from_env();
    info!(?stress, "starting stress run");

    let fixture = build_fixture(engine, &stress).await?;
    let stats = run_trade_wave(engine, &stress, &fixture).await?;
    if stats.failed > 0 {
        return Err(anyhow!("{} trades failed with unexpected errors", stats.failed));
    }

    resolve_and_settle(engine, &fixture).await?;

    verify_conservation(&engine.pool, fixture.total_deposited).await?;
    verify_non_negative(&engine.pool).await?;
    verify_pending_claims(&engine.pool).await?;
    info!("stress run passed");
    Ok(())
}
