//! Engine configuration.
//!
//! Environment variables override defaults; invalid values are clamped with a
//! warning rather than aborting startup. The admin-tunable trade limits live
//! in the `admin_config` row (see `validation`); the values here seed that row
//! on first boot.

use serde::{Deserialize, Serialize};
use std::env;
use tracing::warn;

/// Total trade fee in basis points (2%).
pub const TOTAL_FEE_BPS: i64 = 200;

/// Flat fee charged to file a dispute, in micro-USDC (100 USDC).
pub const DISPUTE_FEE: i64 = 100_000_000;

/// Dispute window after an option resolves, in seconds (2 hours).
pub const DISPUTE_WINDOW_SECS: i64 = 7_200;

/// Smallest tradable quantity, in micro-shares (0.1 share).
pub const MIN_SHARES_PER_TRADE: i64 = 100_000;

/// Smallest gross trade cost, in micro-USDC (0.1 USDC).
pub const MIN_TRADE_COST: i64 = 100_000;

/// Smallest LP deposit, in micro-USDC (1 USDC).
pub const MIN_LP_DEPOSIT: i64 = 1_000_000;

const BPS_DENOMINATOR: i64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub fees: FeeConfig,
    pub limits: LimitDefaults,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
}

/// Fee split table. The three partitions must sum to `total_fee_bps`; the LP
/// share absorbs integer remainders so the split is exact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    pub total_fee_bps: i64,
    pub creator_fee_bps: i64,
    pub protocol_fee_bps: i64,
    pub lp_fee_bps: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub total: i64,
    pub creator: i64,
    pub protocol: i64,
    pub lp: i64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            total_fee_bps: TOTAL_FEE_BPS,
            creator_fee_bps: 50,
            protocol_fee_bps: 50,
            lp_fee_bps: 100,
        }
    }
}

impl FeeConfig {
    /// Partition the fee on a gross notional. Floor division throughout;
    /// the LP bucket receives the remainder so creator+protocol+lp == total.
    pub fn split(&self, gross: i64) -> FeeBreakdown {
        let gross = gross.max(0) as i128;
        let total = (gross * self.total_fee_bps as i128 / BPS_DENOMINATOR as i128) as i64;
        let creator = (gross * self.creator_fee_bps as i128 / BPS_DENOMINATOR as i128) as i64;
        let protocol = (gross * self.protocol_fee_bps as i128 / BPS_DENOMINATOR as i128) as i64;
        let lp = total - creator - protocol;
        FeeBreakdown {
            total,
            creator,
            protocol,
            lp,
        }
    }
}

/// Seed values for the admin_config limits row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitDefaults {
    /// Largest single-trade charge, micro-USDC.
    pub max_trade_cost: i64,
    /// Largest cumulative position cost per (user, market), micro-USDC.
    pub max_position_cost: i64,
    /// Largest per-user traded volume per UTC day, micro-USDC.
    pub max_daily_volume: i64,
}

impl Default for LimitDefaults {
    fn default() -> Self {
        Self {
            max_trade_cost: 10_000_000_000,     // 10k USDC
            max_position_cost: 50_000_000_000,  // 50k USDC
            max_daily_volume: 100_000_000_000,  // 100k USDC
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Default wait budget for a queued operation, milliseconds.
    pub timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fees: FeeConfig::default(),
            limits: LimitDefaults::default(),
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(v) = env::var("ENGINE_CREATOR_FEE_BPS") {
            config.fees.creator_fee_bps = v.parse().unwrap_or(config.fees.creator_fee_bps);
        }
        if let Ok(v) = env::var("ENGINE_PROTOCOL_FEE_BPS") {
            config.fees.protocol_fee_bps = v.parse().unwrap_or(config.fees.protocol_fee_bps);
        }
        if let Ok(v) = env::var("ENGINE_LP_FEE_BPS") {
            config.fees.lp_fee_bps = v.parse().unwrap_or(config.fees.lp_fee_bps);
        }
        if let Ok(v) = env::var("ENGINE_MAX_TRADE_COST") {
            config.limits.max_trade_cost = v.parse().unwrap_or(config.limits.max_trade_cost);
        }
        if let Ok(v) = env::var("ENGINE_MAX_POSITION_COST") {
            config.limits.max_position_cost = v.parse().unwrap_or(config.limits.max_position_cost);
        }
        if let Ok(v) = env::var("ENGINE_MAX_DAILY_VOLUME") {
            config.limits.max_daily_volume = v.parse().unwrap_or(config.limits.max_daily_volume);
        }
        if let Ok(v) = env::var("ENGINE_MAX_RETRIES") {
            config.retry.max_retries = v.parse().unwrap_or(config.retry.max_retries);
        }
        if let Ok(v) = env::var("ENGINE_RETRY_BACKOFF_MS") {
            config.retry.initial_backoff_ms = v.parse().unwrap_or(config.retry.initial_backoff_ms);
        }
        if let Ok(v) = env::var("ENGINE_RETRY_MAX_BACKOFF_MS") {
            config.retry.max_backoff_ms = v.parse().unwrap_or(config.retry.max_backoff_ms);
        }
        if let Ok(v) = env::var("ENGINE_QUEUE_TIMEOUT_MS") {
            config.queue.timeout_ms = v.parse().unwrap_or(config.queue.timeout_ms);
        }

        config.validate();
        config
    }

    /// Clamp invalid values back to defaults, warning about each.
    fn validate(&mut self) {
        let fee_sum =
            self.fees.creator_fee_bps + self.fees.protocol_fee_bps + self.fees.lp_fee_bps;
        if fee_sum != self.fees.total_fee_bps
            || self.fees.creator_fee_bps < 0
            || self.fees.protocol_fee_bps < 0
            || self.fees.lp_fee_bps < 0
        {
            warn!(
                creator = self.fees.creator_fee_bps,
                protocol = self.fees.protocol_fee_bps,
                lp = self.fees.lp_fee_bps,
                total = self.fees.total_fee_bps,
                "fee split does not partition the total fee, using defaults"
            );
            self.fees = FeeConfig::default();
        }

        if self.limits.max_trade_cost < MIN_TRADE_COST {
            warn!(
                max_trade_cost = self.limits.max_trade_cost,
                "max_trade_cost below minimum trade cost, using default"
            );
            self.limits.max_trade_cost = LimitDefaults::default().max_trade_cost;
        }
        if self.limits.max_position_cost < self.limits.max_trade_cost {
            warn!(
                max_position_cost = self.limits.max_position_cost,
                "max_position_cost below max_trade_cost, using default"
            );
            self.limits.max_position_cost = LimitDefaults::default().max_position_cost;
        }
        if self.limits.max_daily_volume < self.limits.max_trade_cost {
            warn!(
                max_daily_volume = self.limits.max_daily_volume,
                "max_daily_volume below max_trade_cost, using default"
            );
            self.limits.max_daily_volume = LimitDefaults::default().max_daily_volume;
        }

        if self.retry.max_retries == 0 || self.retry.max_retries > 10 {
            warn!(max_retries = self.retry.max_retries, "invalid retry count, using default");
            self.retry.max_retries = RetryConfig::default().max_retries;
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            warn!("max backoff below initial backoff, using defaults");
            self.retry = RetryConfig::default();
        }
        if self.queue.timeout_ms == 0 {
            warn!("queue timeout of zero, using default");
            self.queue.timeout_ms = QueueConfig::default().timeout_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_split_partitions_exactly() {
        let fees = FeeConfig::default();
        // 2% of 1 USDC gross
        let parts = fees.split(1_000_000);
        assert_eq!(parts.total, 20_000);
        assert_eq!(parts.creator + parts.protocol + parts.lp, parts.total);
        assert_eq!(parts.creator, 5_000);
        assert_eq!(parts.protocol, 5_000);
        assert_eq!(parts.lp, 10_000);
    }

    #[test]
    fn split_remainder_goes_to_lp() {
        let fees = FeeConfig::default();
        // an awkward gross where floor division drops micros
        let parts = fees.split(999_999);
        assert_eq!(parts.creator + parts.protocol + parts.lp, parts.total);
        assert!(parts.lp >= parts.creator);
    }

    #[test]
    fn split_of_zero_is_zero() {
        let parts = FeeConfig::default().split(0);
        assert_eq!(parts.total, 0);
        assert_eq!(parts.lp, 0);
    }

    #[test]
    fn validate_restores_broken_fee_table() {
        let mut config = Config::default();
        config.fees.creator_fee_bps = 9_999;
        config.validate();
        assert_eq!(
            config.fees.creator_fee_bps + config.fees.protocol_fee_bps + config.fees.lp_fee_bps,
            config.fees.total_fee_bps
        );
    }

    #[test]
    fn validate_restores_zero_queue_timeout() {
        let mut config = Config::default();
        config.queue.timeout_ms = 0;
        config.validate();
        assert_eq!(config.queue.timeout_ms, 30_000);
    }
}
