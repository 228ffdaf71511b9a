//! Ledger store: every row read and write funnels through here.
//!
//! Locking helpers follow the global order
//! Market -> Option -> Wallet -> User -> LpPosition/UserPosition
//! and are the only functions issuing `SELECT ... FOR UPDATE`. Callers that
//! need several rows must acquire them in that order. Mutable entities are
//! last-writer-wins under their row lock; trades, snapshots, submissions and
//! disputes are append-only and never updated.
//!
//! Money columns are BIGINT micro-units; timestamps are BIGINT Unix seconds.

use crate::config::Config;
use crate::error::TransactionError;
use anyhow::Result;
use sqlx::{PgPool, Row};

pub type PgTx<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

// ---------------------------------------------------------------------------
// Enums persisted as TEXT
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Resolving,
    Resolved,
    Disputed,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::Resolving => "resolving",
            MarketStatus::Resolved => "resolved",
            MarketStatus::Disputed => "disputed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "open" => Ok(MarketStatus::Open),
            "resolving" => Ok(MarketStatus::Resolving),
            "resolved" => Ok(MarketStatus::Resolved),
            "disputed" => Ok(MarketStatus::Disputed),
            other => Err(format!("unknown market status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    Oracle,
    Authority,
    Opinion,
}

impl ResolutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMode::Oracle => "oracle",
            ResolutionMode::Authority => "authority",
            ResolutionMode::Opinion => "opinion",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "oracle" => Ok(ResolutionMode::Oracle),
            "authority" => Ok(ResolutionMode::Authority),
            "opinion" => Ok(ResolutionMode::Opinion),
            other => Err(format!("unknown resolution mode: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
    pub created_ts: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Wallet {
    pub user_id: i64,
    pub balance: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Market {
    pub id: i64,
    pub creator_id: i64,
    pub question: String,
    pub resolution_mode: String,
    pub status: String,
    pub expiration_ts: i64,
    pub shared_pool_liquidity: i64,
    pub accumulated_lp_fees: i64,
    pub creator_fees: i64,
    pub protocol_fees: i64,
    pub total_lp_shares: i64,
    pub reserved_liquidity: i64,
    pub liquidity_parameter: i64,
    pub base_liquidity_parameter: i64,
    pub is_initialized: bool,
    pub total_volume: i64,
    pub created_ts: i64,
}

impl Market {
    pub fn status(&self) -> Result<MarketStatus> {
        MarketStatus::parse(&self.status).map_err(TransactionError::validation)
    }

    pub fn mode(&self) -> Result<ResolutionMode> {
        ResolutionMode::parse(&self.resolution_mode).map_err(TransactionError::validation)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MarketOption {
    pub id: i64,
    pub market_id: i64,
    pub label: String,
    pub yes_quantity: i64,
    pub no_quantity: i64,
    pub is_resolved: bool,
    pub winning_side: Option<i16>,
    pub resolved_ts: Option<i64>,
    pub resolved_by: Option<i64>,
    pub dispute_deadline_ts: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserPosition {
    pub user_id: i64,
    pub option_id: i64,
    pub market_id: i64,
    pub yes_shares: i64,
    pub no_shares: i64,
    pub total_yes_cost: i64,
    pub total_no_cost: i64,
    pub realized_pnl: i64,
    pub is_claimed: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LpPosition {
    pub user_id: i64,
    pub market_id: i64,
    pub shares: i64,
    pub deposited_amount: i64,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct SubmissionRow {
    pub id: i64,
    pub market_id: i64,
    pub option_id: i64,
    pub user_id: i64,
    pub outcome: String,
    pub evidence: Option<String>,
    pub submitted_ts: i64,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubmissionWithUser {
    pub user_id: i64,
    pub outcome: String,
    pub submitted_ts: i64,
    pub is_admin: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AdminConfigRow {
    pub version: i64,
    pub total_fee_bps: i64,
    pub creator_fee_bps: i64,
    pub protocol_fee_bps: i64,
    pub lp_fee_bps: i64,
    pub max_trade_cost: i64,
    pub max_position_cost: i64,
    pub max_daily_volume: i64,
    pub dispute_fee: i64,
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        username TEXT UNIQUE NOT NULL,
        is_admin BOOLEAN NOT NULL DEFAULT FALSE,
        created_ts BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS wallets (
        user_id BIGINT PRIMARY KEY REFERENCES users(id),
        balance BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS markets (
        id BIGSERIAL PRIMARY KEY,
        creator_id BIGINT NOT NULL REFERENCES users(id),
        question TEXT NOT NULL,
        resolution_mode TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        expiration_ts BIGINT NOT NULL,
        shared_pool_liquidity BIGINT NOT NULL DEFAULT 0 CHECK (shared_pool_liquidity >= 0),
        accumulated_lp_fees BIGINT NOT NULL DEFAULT 0 CHECK (accumulated_lp_fees >= 0),
        creator_fees BIGINT NOT NULL DEFAULT 0,
        protocol_fees BIGINT NOT NULL DEFAULT 0,
        total_lp_shares BIGINT NOT NULL DEFAULT 0 CHECK (total_lp_shares >= 0),
        reserved_liquidity BIGINT NOT NULL DEFAULT 0 CHECK (reserved_liquidity >= 0),
        liquidity_parameter BIGINT NOT NULL,
        base_liquidity_parameter BIGINT NOT NULL,
        is_initialized BOOLEAN NOT NULL DEFAULT FALSE,
        total_volume BIGINT NOT NULL DEFAULT 0,
        created_ts BIGINT NOT NULL,
        CHECK (reserved_liquidity <= shared_pool_liquidity)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS market_options (
        id BIGSERIAL PRIMARY KEY,
        market_id BIGINT NOT NULL REFERENCES markets(id),
        label TEXT NOT NULL,
        yes_quantity BIGINT NOT NULL DEFAULT 0 CHECK (yes_quantity >= 0),
        no_quantity BIGINT NOT NULL DEFAULT 0 CHECK (no_quantity >= 0),
        is_resolved BOOLEAN NOT NULL DEFAULT FALSE,
        winning_side SMALLINT,
        resolved_ts BIGINT,
        resolved_by BIGINT,
        dispute_deadline_ts BIGINT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_positions (
        user_id BIGINT NOT NULL REFERENCES users(id),
        option_id BIGINT NOT NULL REFERENCES market_options(id),
        market_id BIGINT NOT NULL REFERENCES markets(id),
        yes_shares BIGINT NOT NULL DEFAULT 0 CHECK (yes_shares >= 0),
        no_shares BIGINT NOT NULL DEFAULT 0 CHECK (no_shares >= 0),
        total_yes_cost BIGINT NOT NULL DEFAULT 0,
        total_no_cost BIGINT NOT NULL DEFAULT 0,
        realized_pnl BIGINT NOT NULL DEFAULT 0,
        is_claimed BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (user_id, option_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lp_positions (
        user_id BIGINT NOT NULL REFERENCES users(id),
        market_id BIGINT NOT NULL REFERENCES markets(id),
        shares BIGINT NOT NULL DEFAULT 0 CHECK (shares >= 0),
        deposited_amount BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, market_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trades (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL,
        market_id BIGINT NOT NULL,
        option_id BIGINT NOT NULL,
        trade_type TEXT NOT NULL,
        side TEXT NOT NULL,
        quantity BIGINT NOT NULL,
        price_per_share BIGINT NOT NULL,
        total_cost BIGINT NOT NULL,
        fees_paid BIGINT NOT NULL,
        status TEXT NOT NULL DEFAULT 'completed',
        created_ts BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_trades_user_day ON trades (user_id, created_ts)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS price_snapshots (
        id BIGSERIAL PRIMARY KEY,
        option_id BIGINT NOT NULL,
        market_id BIGINT NOT NULL,
        ts BIGINT NOT NULL,
        yes_price BIGINT NOT NULL,
        no_price BIGINT NOT NULL,
        yes_qty BIGINT NOT NULL,
        no_qty BIGINT NOT NULL,
        volume BIGINT NOT NULL DEFAULT 0,
        snapshot_type TEXT NOT NULL,
        trade_id BIGINT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_snapshots_option_ts ON price_snapshots (option_id, ts)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resolution_submissions (
        id BIGSERIAL PRIMARY KEY,
        market_id BIGINT NOT NULL,
        option_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        outcome TEXT NOT NULL,
        evidence TEXT,
        submitted_ts BIGINT NOT NULL,
        signature TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS disputes (
        id BIGSERIAL PRIMARY KEY,
        market_id BIGINT NOT NULL,
        option_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        reason TEXT NOT NULL,
        evidence TEXT,
        resolution_fee_paid BIGINT NOT NULL,
        created_ts BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS admin_config (
        id SMALLINT PRIMARY KEY CHECK (id = 1),
        version BIGINT NOT NULL DEFAULT 1,
        total_fee_bps BIGINT NOT NULL,
        creator_fee_bps BIGINT NOT NULL,
        protocol_fee_bps BIGINT NOT NULL,
        lp_fee_bps BIGINT NOT NULL,
        max_trade_cost BIGINT NOT NULL,
        max_position_cost BIGINT NOT NULL,
        max_daily_volume BIGINT NOT NULL,
        dispute_fee BIGINT NOT NULL,
        updated_ts BIGINT NOT NULL
    )
    "#,
];

/// Idempotent schema bootstrap plus the admin_config seed row.
pub async fn create_schema(pool: &PgPool, config: &Config) -> Result<()> {
    for ddl in SCHEMA {
        sqlx::query(ddl).execute(pool).await?;
    }
    sqlx::query(
        "INSERT INTO admin_config
            (id, total_fee_bps, creator_fee_bps, protocol_fee_bps, lp_fee_bps,
             max_trade_cost, max_position_cost, max_daily_volume, dispute_fee, updated_ts)
         VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(config.fees.total_fee_bps)
    .bind(config.fees.creator_fee_bps)
    .bind(config.fees.protocol_fee_bps)
    .bind(config.fees.lp_fee_bps)
    .bind(config.limits.max_trade_cost)
    .bind(config.limits.max_position_cost)
    .bind(config.limits.max_daily_volume)
    .bind(crate::config::DISPUTE_FEE)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Typed row operations. Associated functions take a transaction so the
/// caller controls the commit boundary.
pub struct Ledger;

impl Ledger {
    // ---- users & wallets --------------------------------------------------

    pub async fn create_user(pool: &PgPool, username: &str, is_admin: bool) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let row = sqlx::query(
            "INSERT INTO users (username, is_admin, created_ts) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(username)
        .bind(is_admin)
        .bind(now)
        .fetch_one(pool)
        .await?;
        let user_id: i64 = row.get("id");
        sqlx::query("INSERT INTO wallets (user_id, balance) VALUES ($1, 0)")
            .bind(user_id)
            .execute(pool)
            .await?;
        Ok(user_id)
    }

    pub async fn get_user(tx: &mut PgTx<'_>, user_id: i64) -> Result<User> {
        sqlx::query_as::<_, User>("SELECT id, username, is_admin, created_ts FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("user")))
    }

    /// External top-up; the only way balance enters the system.
    pub async fn deposit(pool: &PgPool, user_id: i64, amount: i64) -> Result<i64> {
        if amount <= 0 {
            return Err(TransactionError::validation("deposit must be positive"));
        }
        let row = sqlx::query(
            "UPDATE wallets SET balance = balance + $1 WHERE user_id = $2 RETURNING balance",
        )
        .bind(amount)
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("wallet")))?;
        Ok(row.get("balance"))
    }

    pub async fn lock_wallet(tx: &mut PgTx<'_>, user_id: i64) -> Result<Wallet> {
        sqlx::query_as::<_, Wallet>(
            "SELECT user_id, balance FROM wallets WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("wallet")))
    }

    /// Guarded debit: fails the row match instead of going negative.
    pub async fn debit_wallet(tx: &mut PgTx<'_>, user_id: i64, amount: i64) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE wallets SET balance = balance - $1
             WHERE user_id = $2 AND balance - $1 >= 0",
        )
        .bind(amount)
        .bind(user_id)
        .execute(tx.as_mut())
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    pub async fn credit_wallet(tx: &mut PgTx<'_>, user_id: i64, amount: i64) -> Result<i64> {
        let row = sqlx::query(
            "UPDATE wallets SET balance = balance + $1 WHERE user_id = $2 RETURNING balance",
        )
        .bind(amount)
        .bind(user_id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("wallet")))?;
        Ok(row.get("balance"))
    }

    pub async fn wallet_balance(tx: &mut PgTx<'_>, user_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT balance FROM wallets WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("wallet")))?;
        Ok(row.get("balance"))
    }

    // ---- markets ----------------------------------------------------------

    pub async fn insert_market(
        tx: &mut PgTx<'_>,
        creator_id: i64,
        question: &str,
        mode: ResolutionMode,
        expiration_ts: i64,
        b0: i64,
    ) -> Result<Market> {
        let now = chrono::Utc::now().timestamp();
        let b = crate::lmsr::recompute_b(b0, 0, 0);
        let market = sqlx::query_as::<_, Market>(
            "INSERT INTO markets
                (creator_id, question, resolution_mode, status, expiration_ts,
                 liquidity_parameter, base_liquidity_parameter, created_ts)
             VALUES ($1, $2, $3, 'open', $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(creator_id)
        .bind(question)
        .bind(mode.as_str())
        .bind(expiration_ts)
        .bind(b)
        .bind(b0)
        .bind(now)
        .fetch_one(tx.as_mut())
        .await?;
        Ok(market)
    }

    pub async fn lock_market(tx: &mut PgTx<'_>, market_id: i64) -> Result<Market> {
        sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE id = $1 FOR UPDATE")
            .bind(market_id)
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("market")))
    }

    pub async fn get_market(pool: &PgPool, market_id: i64) -> Result<Market> {
        sqlx::query_as::<_, Market>("SELECT * FROM markets WHERE id = $1")
            .bind(market_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("market")))
    }

    /// Write back every mutable market column. Callers hold the row lock.
    pub async fn update_market(tx: &mut PgTx<'_>, market: &Market) -> Result<()> {
        sqlx::query(
            "UPDATE markets SET
                status = $1,
                shared_pool_liquidity = $2,
                accumulated_lp_fees = $3,
                creator_fees = $4,
                protocol_fees = $5,
                total_lp_shares = $6,
                reserved_liquidity = $7,
                liquidity_parameter = $8,
                is_initialized = $9,
                total_volume = $10
             WHERE id = $11",
        )
        .bind(&market.status)
        .bind(market.shared_pool_liquidity)
        .bind(market.accumulated_lp_fees)
        .bind(market.creator_fees)
        .bind(market.protocol_fees)
        .bind(market.total_lp_shares)
        .bind(market.reserved_liquidity)
        .bind(market.liquidity_parameter)
        .bind(market.is_initialized)
        .bind(market.total_volume)
        .bind(market.id)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    pub async fn set_market_status(
        tx: &mut PgTx<'_>,
        market_id: i64,
        status: MarketStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE markets SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(market_id)
            .execute(tx.as_mut())
            .await?;
        Ok(())
    }

    // ---- options ----------------------------------------------------------

    pub async fn insert_option(tx: &mut PgTx<'_>, market_id: i64, label: &str) -> Result<MarketOption> {
        let option = sqlx::query_as::<_, MarketOption>(
            "INSERT INTO market_options (market_id, label) VALUES ($1, $2) RETURNING *",
        )
        .bind(market_id)
        .bind(label)
        .fetch_one(tx.as_mut())
        .await?;
        Ok(option)
    }

    pub async fn lock_option(tx: &mut PgTx<'_>, option_id: i64) -> Result<MarketOption> {
        sqlx::query_as::<_, MarketOption>("SELECT * FROM market_options WHERE id = $1 FOR UPDATE")
            .bind(option_id)
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("option")))
    }

    pub async fn get_option(pool: &PgPool, option_id: i64) -> Result<MarketOption> {
        sqlx::query_as::<_, MarketOption>("SELECT * FROM market_options WHERE id = $1")
            .bind(option_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("option")))
    }

    pub async fn options_for_market<'e, E>(executor: E, market_id: i64) -> Result<Vec<MarketOption>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        Ok(sqlx::query_as::<_, MarketOption>(
            "SELECT * FROM market_options WHERE market_id = $1 ORDER BY id",
        )
        .bind(market_id)
        .fetch_all(executor)
        .await?)
    }

    pub async fn update_option_quantities(
        tx: &mut PgTx<'_>,
        option_id: i64,
        yes_quantity: i64,
        no_quantity: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE market_options SET yes_quantity = $1, no_quantity = $2 WHERE id = $3")
            .bind(yes_quantity)
            .bind(no_quantity)
            .bind(option_id)
            .execute(tx.as_mut())
            .await?;
        Ok(())
    }

    pub async fn resolve_option(
        tx: &mut PgTx<'_>,
        option_id: i64,
        winning_side: i16,
        resolved_ts: i64,
        resolved_by: i64,
        dispute_deadline_ts: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE market_options SET
                is_resolved = TRUE,
                winning_side = $1,
                resolved_ts = $2,
                resolved_by = $3,
                dispute_deadline_ts = $4
             WHERE id = $5 AND NOT is_resolved",
        )
        .bind(winning_side)
        .bind(resolved_ts)
        .bind(resolved_by)
        .bind(dispute_deadline_ts)
        .bind(option_id)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    /// Outstanding micro-shares across every option of the market; drives the
    /// liquidity-parameter schedule together with the pool.
    pub async fn total_market_shares(tx: &mut PgTx<'_>, market_id: i64) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(yes_quantity + no_quantity), 0)::BIGINT
             FROM market_options WHERE market_id = $1",
        )
        .bind(market_id)
        .fetch_one(tx.as_mut())
        .await?;
        Ok(total)
    }

    pub async fn unresolved_option_count(tx: &mut PgTx<'_>, market_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM market_options WHERE market_id = $1 AND NOT is_resolved",
        )
        .bind(market_id)
        .fetch_one(tx.as_mut())
        .await?;
        Ok(count)
    }

    // ---- user positions ---------------------------------------------------

    pub async fn lock_position(
        tx: &mut PgTx<'_>,
        user_id: i64,
        option_id: i64,
    ) -> Result<Option<UserPosition>> {
        Ok(sqlx::query_as::<_, UserPosition>(
            "SELECT * FROM user_positions WHERE user_id = $1 AND option_id = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(option_id)
        .fetch_optional(tx.as_mut())
        .await?)
    }

    /// Record a buy into the position, creating the row on first trade.
    pub async fn upsert_position_buy(
        tx: &mut PgTx<'_>,
        user_id: i64,
        option_id: i64,
        market_id: i64,
        side: crate::lmsr::Side,
        shares_delta: i64,
        cost_delta: i64,
    ) -> Result<()> {
        match side {
            crate::lmsr::Side::Yes => {
                sqlx::query(
                    "INSERT INTO user_positions
                        (user_id, option_id, market_id, yes_shares, no_shares,
                         total_yes_cost, total_no_cost)
                     VALUES ($1, $2, $3, $4, 0, $5, 0)
                     ON CONFLICT (user_id, option_id) DO UPDATE SET
                        yes_shares = user_positions.yes_shares + $4,
                        total_yes_cost = user_positions.total_yes_cost + $5",
                )
                .bind(user_id)
                .bind(option_id)
                .bind(market_id)
                .bind(shares_delta)
                .bind(cost_delta)
                .execute(tx.as_mut())
                .await?;
            }
            crate::lmsr::Side::No => {
                sqlx::query(
                    "INSERT INTO user_positions
                        (user_id, option_id, market_id, yes_shares, no_shares,
                         total_yes_cost, total_no_cost)
                     VALUES ($1, $2, $3, 0, $4, 0, $5)
                     ON CONFLICT (user_id, option_id) DO UPDATE SET
                        no_shares = user_positions.no_shares + $4,
                        total_no_cost = user_positions.total_no_cost + $5",
                )
                .bind(user_id)
                .bind(option_id)
                .bind(market_id)
                .bind(shares_delta)
                .bind(cost_delta)
                .execute(tx.as_mut())
                .await?;
            }
        }
        Ok(())
    }

    /// Unwind a sell: shares and proportional cost leave the side, realized
    /// PnL accumulates.
    pub async fn update_position_sell(
        tx: &mut PgTx<'_>,
        user_id: i64,
        option_id: i64,
        side: crate::lmsr::Side,
        shares_sold: i64,
        cost_unwound: i64,
        realized_pnl_delta: i64,
    ) -> Result<()> {
        match side {
            crate::lmsr::Side::Yes => {
                sqlx::query(
                    "UPDATE user_positions SET
                        yes_shares = yes_shares - $1,
                        total_yes_cost = total_yes_cost - $2,
                        realized_pnl = realized_pnl + $3
                     WHERE user_id = $4 AND option_id = $5",
                )
                .bind(shares_sold)
                .bind(cost_unwound)
                .bind(realized_pnl_delta)
                .bind(user_id)
                .bind(option_id)
                .execute(tx.as_mut())
                .await?;
            }
            crate::lmsr::Side::No => {
                sqlx::query(
                    "UPDATE user_positions SET
                        no_shares = no_shares - $1,
                        total_no_cost = total_no_cost - $2,
                        realized_pnl = realized_pnl + $3
                     WHERE user_id = $4 AND option_id = $5",
                )
                .bind(shares_sold)
                .bind(cost_unwound)
                .bind(realized_pnl_delta)
                .bind(user_id)
                .bind(option_id)
                .execute(tx.as_mut())
                .await?;
            }
        }
        Ok(())
    }

    /// Terminal settlement write: zero both sides, set the claim flag.
    /// `is_claimed` is the sole finalization flag; no mutation may follow it.
    pub async fn finalize_position(
        tx: &mut PgTx<'_>,
        user_id: i64,
        option_id: i64,
        realized_pnl_delta: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE user_positions SET
                yes_shares = 0,
                no_shares = 0,
                total_yes_cost = 0,
                total_no_cost = 0,
                realized_pnl = realized_pnl + $1,
                is_claimed = TRUE
             WHERE user_id = $2 AND option_id = $3 AND NOT is_claimed",
        )
        .bind(realized_pnl_delta)
        .bind(user_id)
        .bind(option_id)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    pub async fn unclaimed_positions_for_option(
        tx: &mut PgTx<'_>,
        option_id: i64,
    ) -> Result<Vec<UserPosition>> {
        Ok(sqlx::query_as::<_, UserPosition>(
            "SELECT * FROM user_positions
             WHERE option_id = $1 AND NOT is_claimed
             ORDER BY user_id
             FOR UPDATE",
        )
        .bind(option_id)
        .fetch_all(tx.as_mut())
        .await?)
    }

    /// Micro-USDC the pool still owes traders: unclaimed winning shares
    /// across the market's resolved options.
    pub async fn pending_claims<'e, E>(executor: E, market_id: i64) -> Result<i64>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let pending: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(
                CASE WHEN o.winning_side = 1 THEN p.yes_shares ELSE p.no_shares END
             ), 0)::BIGINT
             FROM user_positions p
             JOIN market_options o ON o.id = p.option_id
             WHERE o.market_id = $1 AND o.is_resolved AND NOT p.is_claimed",
        )
        .bind(market_id)
        .fetch_one(executor)
        .await?;
        Ok(pending)
    }

    /// Cumulative cost basis a user carries across every option of a market.
    pub async fn user_market_cost(tx: &mut PgTx<'_>, user_id: i64, market_id: i64) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(total_yes_cost + total_no_cost), 0)::BIGINT
             FROM user_positions
             WHERE user_id = $1 AND market_id = $2",
        )
        .bind(user_id)
        .bind(market_id)
        .fetch_one(tx.as_mut())
        .await?;
        Ok(total)
    }

    /// Gross volume the user traded since `since_ts` (UTC day start).
    pub async fn user_volume_since(tx: &mut PgTx<'_>, user_id: i64, since_ts: i64) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(ABS(total_cost)), 0)::BIGINT
             FROM trades
             WHERE user_id = $1 AND created_ts >= $2",
        )
        .bind(user_id)
        .bind(since_ts)
        .fetch_one(tx.as_mut())
        .await?;
        Ok(total)
    }

    // ---- LP positions -----------------------------------------------------

    pub async fn lock_lp_position(
        tx: &mut PgTx<'_>,
        user_id: i64,
        market_id: i64,
    ) -> Result<Option<LpPosition>> {
        Ok(sqlx::query_as::<_, LpPosition>(
            "SELECT * FROM lp_positions WHERE user_id = $1 AND market_id = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(market_id)
        .fetch_optional(tx.as_mut())
        .await?)
    }

    pub async fn get_lp_position(
        pool: &PgPool,
        user_id: i64,
        market_id: i64,
    ) -> Result<Option<LpPosition>> {
        Ok(sqlx::query_as::<_, LpPosition>(
            "SELECT * FROM lp_positions WHERE user_id = $1 AND market_id = $2",
        )
        .bind(user_id)
        .bind(market_id)
        .fetch_optional(pool)
        .await?)
    }

    pub async fn upsert_lp_add(
        tx: &mut PgTx<'_>,
        user_id: i64,
        market_id: i64,
        shares_delta: i64,
        deposit_delta: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO lp_positions (user_id, market_id, shares, deposited_amount)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (user_id, market_id) DO UPDATE SET
                shares = lp_positions.shares + $3,
                deposited_amount = lp_positions.deposited_amount + $4",
        )
        .bind(user_id)
        .bind(market_id)
        .bind(shares_delta)
        .bind(deposit_delta)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    /// Write the post-withdrawal LP state; the row disappears at zero shares.
    pub async fn settle_lp_position(
        tx: &mut PgTx<'_>,
        user_id: i64,
        market_id: i64,
        remaining_shares: i64,
        remaining_deposit: i64,
    ) -> Result<()> {
        if remaining_shares <= 0 {
            sqlx::query("DELETE FROM lp_positions WHERE user_id = $1 AND market_id = $2")
                .bind(user_id)
                .bind(market_id)
                .execute(tx.as_mut())
                .await?;
        } else {
            sqlx::query(
                "UPDATE lp_positions SET shares = $1, deposited_amount = $2
                 WHERE user_id = $3 AND market_id = $4",
            )
            .bind(remaining_shares)
            .bind(remaining_deposit)
            .bind(user_id)
            .bind(market_id)
            .execute(tx.as_mut())
            .await?;
        }
        Ok(())
    }

    // ---- trades -----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_trade(
        tx: &mut PgTx<'_>,
        user_id: i64,
        market_id: i64,
        option_id: i64,
        trade_type: &str,
        side: crate::lmsr::Side,
        quantity: i64,
        price_per_share: i64,
        total_cost: i64,
        fees_paid: i64,
        created_ts: i64,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO trades
                (user_id, market_id, option_id, trade_type, side, quantity,
                 price_per_share, total_cost, fees_paid, status, created_ts)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'completed', $10)
             RETURNING id",
        )
        .bind(user_id)
        .bind(market_id)
        .bind(option_id)
        .bind(trade_type)
        .bind(side.as_str())
        .bind(quantity)
        .bind(price_per_share)
        .bind(total_cost)
        .bind(fees_paid)
        .bind(created_ts)
        .fetch_one(tx.as_mut())
        .await?;
        Ok(row.get("id"))
    }

    // ---- resolution submissions & disputes --------------------------------

    pub async fn insert_submission(
        tx: &mut PgTx<'_>,
        market_id: i64,
        option_id: i64,
        user_id: i64,
        outcome: &str,
        evidence: Option<&str>,
        submitted_ts: i64,
        signature: Option<&str>,
    ) -> Result<SubmissionRow> {
        let row = sqlx::query_as::<_, SubmissionRow>(
            "INSERT INTO resolution_submissions
                (market_id, option_id, user_id, outcome, evidence, submitted_ts, signature)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(market_id)
        .bind(option_id)
        .bind(user_id)
        .bind(outcome)
        .bind(evidence)
        .bind(submitted_ts)
        .bind(signature)
        .fetch_one(tx.as_mut())
        .await?;
        Ok(row)
    }

    pub async fn submissions_for_option(
        tx: &mut PgTx<'_>,
        option_id: i64,
    ) -> Result<Vec<SubmissionRow>> {
        Ok(sqlx::query_as::<_, SubmissionRow>(
            "SELECT * FROM resolution_submissions
             WHERE option_id = $1
             ORDER BY submitted_ts, user_id",
        )
        .bind(option_id)
        .fetch_all(tx.as_mut())
        .await?)
    }

    /// Submission facts joined with the submitter's admin flag, in the
    /// deterministic (submitted_ts, user_id) order the resolver expects.
    pub async fn submission_views_for_option(
        tx: &mut PgTx<'_>,
        option_id: i64,
    ) -> Result<Vec<SubmissionWithUser>> {
        Ok(sqlx::query_as::<_, SubmissionWithUser>(
            "SELECT s.user_id, s.outcome, s.submitted_ts, u.is_admin
             FROM resolution_submissions s
             JOIN users u ON u.id = s.user_id
             WHERE s.option_id = $1
             ORDER BY s.submitted_ts, s.user_id",
        )
        .bind(option_id)
        .fetch_all(tx.as_mut())
        .await?)
    }

    /// Resolved options that still carry unclaimed positions; feeds the
    /// settlement sweep.
    pub async fn unsettled_options(pool: &PgPool) -> Result<Vec<(i64, i64)>> {
        let rows = sqlx::query(
            "SELECT DISTINCT o.market_id, o.id
             FROM market_options o
             JOIN user_positions p ON p.option_id = o.id
             WHERE o.is_resolved AND NOT p.is_claimed",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("market_id"), row.get("id")))
            .collect())
    }

    pub async fn submissions_for_market(
        pool: &PgPool,
        market_id: i64,
    ) -> Result<Vec<SubmissionRow>> {
        Ok(sqlx::query_as::<_, SubmissionRow>(
            "SELECT * FROM resolution_submissions
             WHERE market_id = $1
             ORDER BY submitted_ts, user_id",
        )
        .bind(market_id)
        .fetch_all(pool)
        .await?)
    }

    pub async fn insert_dispute(
        tx: &mut PgTx<'_>,
        market_id: i64,
        option_id: i64,
        user_id: i64,
        reason: &str,
        evidence: Option<&str>,
        fee_paid: i64,
        created_ts: i64,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO disputes
                (market_id, option_id, user_id, reason, evidence, resolution_fee_paid, created_ts)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(market_id)
        .bind(option_id)
        .bind(user_id)
        .bind(reason)
        .bind(evidence)
        .bind(fee_paid)
        .bind(created_ts)
        .fetch_one(tx.as_mut())
        .await?;
        Ok(row.get("id"))
    }

    // ---- admin config -----------------------------------------------------

    pub async fn get_admin_config(pool: &PgPool) -> Result<AdminConfigRow> {
        sqlx::query_as::<_, AdminConfigRow>(
            "SELECT version, total_fee_bps, creator_fee_bps, protocol_fee_bps, lp_fee_bps,
                    max_trade_cost, max_position_cost, max_daily_volume, dispute_fee
             FROM admin_config WHERE id = 1",
        )
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| anyhow::Error::new(TransactionError::NotFound("admin_config")))
    }

    /// Admin update; bumps the version so limit caches notice the reload.
    pub async fn update_admin_config(pool: &PgPool, row: &AdminConfigRow) -> Result<i64> {
        let version: i64 = sqlx::query_scalar(
            "UPDATE admin_config SET
                version = version + 1,
                total_fee_bps = $1,
                creator_fee_bps = $2,
                protocol_fee_bps = $3,
                lp_fee_bps = $4,
                max_trade_cost = $5,
                max_position_cost = $6,
                max_daily_volume = $7,
                dispute_fee = $8,
                updated_ts = $9
             WHERE id = 1
             RETURNING version",
        )
        .bind(row.total_fee_bps)
        .bind(row.creator_fee_bps)
        .bind(row.protocol_fee_bps)
        .bind(row.lp_fee_bps)
        .bind(row.max_trade_cost)
        .bind(row.max_position_cost)
        .bind(row.max_daily_volume)
        .bind(row.dispute_fee)
        .bind(chrono::Utc::now().timestamp())
        .fetch_one(pool)
        .await?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            MarketStatus::Open,
            MarketStatus::Resolving,
            MarketStatus::Resolved,
            MarketStatus::Disputed,
        ] {
            assert_eq!(MarketStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(MarketStatus::parse("finalized").is_err());
    }

    #[test]
    fn mode_round_trips() {
        for mode in [
            ResolutionMode::Oracle,
            ResolutionMode::Authority,
            ResolutionMode::Opinion,
        ] {
            assert_eq!(ResolutionMode::parse(mode.as_str()).unwrap(), mode);
        }
        assert!(ResolutionMode::parse("").is_err());
        // no legacy fallback: an absent mode is an error, not AUTHORITY
        assert!(ResolutionMode::parse("legacy").is_err());
    }
}
