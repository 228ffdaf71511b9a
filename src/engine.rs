//! Engine context and market lifecycle operations.
//!
//! [`Engine`] bundles the connection pool, configuration, market queue,
//! update bus, and limit cache; every operation module takes it by reference.
//! Cloning is cheap (pool and bus are handles, the rest is Arc'd).

use crate::config::Config;
use crate::error::TransactionError;
use crate::lmsr;
use crate::queue::MarketQueue;
use crate::runtime::with_retrying_tx;
use crate::store::{self, Ledger, Market, MarketOption, ResolutionMode};
use crate::updates::{MarketEvent, UpdateBus, UpdateEnvelope};
use crate::validation::LimitsCache;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Engine {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub queue: Arc<MarketQueue>,
    pub bus: UpdateBus,
    pub limits: LimitsCache,
}

impl Engine {
    pub fn new(pool: PgPool, config: Config) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            queue: Arc::new(MarketQueue::new()),
            bus: UpdateBus::default(),
            limits: LimitsCache::new(),
        }
    }

    /// Idempotent schema bootstrap; call once at startup.
    pub async fn bootstrap(&self) -> Result<()> {
        store::create_schema(&self.pool, &self.config).await
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.config.queue.timeout_ms)
    }

    pub fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Re-read admin limits on next use.
    pub async fn reload_limits(&self) {
        self.limits.invalidate().await;
    }
}

// ---------------------------------------------------------------------------
// Market lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateMarketRequest {
    pub creator_id: i64,
    pub question: String,
    pub option_labels: Vec<String>,
    pub expiration_ts: i64,
    /// Required; markets without an explicit mode are rejected.
    pub resolution_mode: String,
    pub base_liquidity_parameter: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionState {
    pub id: i64,
    pub label: String,
    pub yes_price: i64,
    pub no_price: i64,
    pub yes_quantity: i64,
    pub no_quantity: i64,
    pub is_resolved: bool,
    pub winning_side: Option<i16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketSummary {
    pub id: i64,
    pub creator_id: i64,
    pub question: String,
    pub resolution_mode: String,
    pub status: String,
    pub expiration_ts: i64,
    pub shared_pool_liquidity: i64,
    pub accumulated_lp_fees: i64,
    pub total_lp_shares: i64,
    pub reserved_liquidity: i64,
    pub liquidity_parameter: i64,
    pub is_initialized: bool,
    pub total_volume: i64,
    pub options: Vec<OptionState>,
}

pub fn summarize(market: &Market, options: &[MarketOption]) -> Result<MarketSummary> {
    let b = market.liquidity_parameter;
    let mut option_states = Vec::with_capacity(options.len());
    for option in options {
        let yes_price = lmsr::yes_price(option.yes_quantity, option.no_quantity, b)
            .map_err(TransactionError::validation)?;
        option_states.push(OptionState {
            id: option.id,
            label: option.label.clone(),
            yes_price,
            no_price: lmsr::PRECISION - yes_price,
            yes_quantity: option.yes_quantity,
            no_quantity: option.no_quantity,
            is_resolved: option.is_resolved,
            winning_side: option.winning_side,
        });
    }
    Ok(MarketSummary {
        id: market.id,
        creator_id: market.creator_id,
        question: market.question.clone(),
        resolution_mode: market.resolution_mode.clone(),
        status: market.status.clone(),
        expiration_ts: market.expiration_ts,
        shared_pool_liquidity: market.shared_pool_liquidity,
        accumulated_lp_fees: market.accumulated_lp_fees,
        total_lp_shares: market.total_lp_shares,
        reserved_liquidity: market.reserved_liquidity,
        liquidity_parameter: market.liquidity_parameter,
        is_initialized: market.is_initialized,
        total_volume: market.total_volume,
        options: option_states,
    })
}

/// Create a market with its options. The market starts uninitialized; trading
/// and liquidity wait for [`initialize_market`].
pub async fn create_market(engine: &Engine, req: CreateMarketRequest) -> Result<MarketSummary> {
    if req.question.trim().is_empty() {
        return Err(TransactionError::validation("question must not be empty"));
    }
    if req.option_labels.is_empty() || req.option_labels.len() > 64 {
        return Err(TransactionError::validation(
            "a market needs between 1 and 64 options",
        ));
    }
    if req.base_liquidity_parameter <= 0 {
        return Err(TransactionError::validation(
            "base liquidity parameter must be positive",
        ));
    }
    let mode = ResolutionMode::parse(&req.resolution_mode).map_err(TransactionError::validation)?;
    if req.expiration_ts <= engine.now() {
        return Err(TransactionError::validation("expiration must be in the future"));
    }

    let summary = with_retrying_tx!(&engine.pool, &engine.config.retry, tx, {
        Ledger::get_user(&mut tx, req.creator_id).await?;
        let market = Ledger::insert_market(
            &mut tx,
            req.creator_id,
            req.question.trim(),
            mode,
            req.expiration_ts,
            req.base_liquidity_parameter,
        )
        .await?;
        let mut options = Vec::with_capacity(req.option_labels.len());
        for label in &req.option_labels {
            if label.trim().is_empty() {
                return Err(TransactionError::validation("option labels must not be empty"));
            }
            options.push(Ledger::insert_option(&mut tx, market.id, label.trim()).await?);
        }
        summarize(&market, &options)
    })?;

    engine.bus.emit(UpdateEnvelope::Market {
        market_id: summary.id,
        event: MarketEvent::Created,
        payload: serde_json::json!({ "question": summary.question }),
        ts: engine.now(),
    });
    Ok(summary)
}

/// Flip a market live. Only the creator or an admin may initialize, and only
/// once.
pub async fn initialize_market(engine: &Engine, user_id: i64, market_id: i64) -> Result<MarketSummary> {
    let summary = engine
        .queue
        .run((market_id, None), engine.queue_timeout(), async {
            with_retrying_tx!(&engine.pool, &engine.config.retry, tx, {
                let mut market = Ledger::lock_market(&mut tx, market_id).await?;
                let user = Ledger::get_user(&mut tx, user_id).await?;
                if user.id != market.creator_id && !user.is_admin {
                    return Err(anyhow::Error::new(TransactionError::Unauthorized(
                        "only the creator or an admin may initialize a market".into(),
                    )));
                }
                if market.is_initialized {
                    return Err(TransactionError::validation("market is already initialized"));
                }
                let options = Ledger::options_for_market(tx.as_mut(), market_id).await?;
                if options.is_empty() {
                    return Err(TransactionError::validation("market has no options"));
                }
                market.is_initialized = true;
                Ledger::update_market(&mut tx, &market).await?;
                summarize(&market, &options)
            })
        })
        .await?;

    engine.bus.emit(UpdateEnvelope::Market {
        market_id,
        event: MarketEvent::Initialized,
        payload: serde_json::json!({}),
        ts: engine.now(),
    });
    Ok(summary)
}

/// Point-in-time market view; no locks.
pub async fn get_market_state(engine: &Engine, market_id: i64) -> Result<MarketSummary> {
    let market = Ledger::get_market(&engine.pool, market_id).await?;
    let options = Ledger::options_for_market(&engine.pool, market_id).await?;
    summarize(&market, &options)
}

/// External top-up; emits a balance envelope on success.
pub async fn deposit(engine: &Engine, user_id: i64, amount: i64) -> Result<i64> {
    let new_balance = Ledger::deposit(&engine.pool, user_id, amount).await?;
    engine.bus.emit(UpdateEnvelope::Balance {
        user_id,
        new_balance,
        ts: engine.now(),
    });
    Ok(new_balance)
}

/// Admin limits update; bumps the config version and drops cached limits.
pub async fn update_admin_config(engine: &Engine, row: &store::AdminConfigRow) -> Result<i64> {
    let version = Ledger::update_admin_config(&engine.pool, row).await?;
    engine.reload_limits().await;
    Ok(version)
}
