//! Price snapshots and on-demand OHLC aggregation.
//!
//! Every trade appends a snapshot inside the trade's own transaction so the
//! chart history can never disagree with the trade log. Range queries read
//! raw rows; OHLC candles are bucketed in-process, no materialized table.

use crate::error::TransactionError;
use crate::lmsr;
use crate::store::{MarketOption, PgTx};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct PriceSnapshot {
    pub id: i64,
    pub option_id: i64,
    pub market_id: i64,
    pub ts: i64,
    pub yes_price: i64,
    pub no_price: i64,
    pub yes_qty: i64,
    pub no_qty: i64,
    pub volume: i64,
    pub snapshot_type: String,
    pub trade_id: Option<i64>,
}

/// Candle over one interval bucket. Prices are YES micro-prices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub bucket_ts: i64,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: i64,
    pub samples: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Interval {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "1m" => Ok(Interval::M1),
            "5m" => Ok(Interval::M5),
            "15m" => Ok(Interval::M15),
            "1h" => Ok(Interval::H1),
            "4h" => Ok(Interval::H4),
            "1d" => Ok(Interval::D1),
            other => Err(TransactionError::validation(format!(
                "unknown interval '{other}', expected one of 1m, 5m, 15m, 1h, 4h, 1d"
            ))),
        }
    }

    pub fn secs(&self) -> i64 {
        match self {
            Interval::M1 => 60,
            Interval::M5 => 300,
            Interval::M15 => 900,
            Interval::H1 => 3_600,
            Interval::H4 => 14_400,
            Interval::D1 => 86_400,
        }
    }
}

/// Append a snapshot of the option's post-trade state. Runs inside the same
/// transaction as the state change it describes.
pub async fn record_trade_snapshot(
    tx: &mut PgTx<'_>,
    option: &MarketOption,
    b: i64,
    ts: i64,
    volume: i64,
    trade_id: Option<i64>,
) -> Result<()> {
    let yes_price = lmsr::yes_price(option.yes_quantity, option.no_quantity, b)
        .map_err(TransactionError::validation)?;
    insert_snapshot(
        tx,
        option,
        ts,
        yes_price,
        lmsr::PRECISION - yes_price,
        volume,
        "trade",
        trade_id,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_snapshot(
    tx: &mut PgTx<'_>,
    option: &MarketOption,
    ts: i64,
    yes_price: i64,
    no_price: i64,
    volume: i64,
    snapshot_type: &str,
    trade_id: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO price_snapshots
            (option_id, market_id, ts, yes_price, no_price, yes_qty, no_qty,
             volume, snapshot_type, trade_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(option.id)
    .bind(option.market_id)
    .bind(ts)
    .bind(yes_price)
    .bind(no_price)
    .bind(option.yes_quantity)
    .bind(option.no_quantity)
    .bind(volume)
    .bind(snapshot_type)
    .bind(trade_id)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

/// Raw series for an option, ascending by time.
pub async fn get_price_history(
    pool: &PgPool,
    option_id: i64,
    from_ts: i64,
    to_ts: i64,
) -> Result<Vec<PriceSnapshot>> {
    if from_ts > to_ts {
        return Err(TransactionError::validation("range start is after range end"));
    }
    Ok(sqlx::query_as::<_, PriceSnapshot>(
        "SELECT * FROM price_snapshots
         WHERE option_id = $1 AND ts >= $2 AND ts <= $3
         ORDER BY ts, id",
    )
    .bind(option_id)
    .bind(from_ts)
    .bind(to_ts)
    .fetch_all(pool)
    .await?)
}

/// Candles for an option over a range, aggregated on demand.
pub async fn get_ohlc(
    pool: &PgPool,
    option_id: i64,
    interval: Interval,
    from_ts: i64,
    to_ts: i64,
) -> Result<Vec<Candle>> {
    let series = get_price_history(pool, option_id, from_ts, to_ts).await?;
    Ok(aggregate_ohlc(&series, interval))
}

/// Bucket a snapshot series into candles. Input must be ascending by ts;
/// empty buckets are omitted.
pub fn aggregate_ohlc(series: &[PriceSnapshot], interval: Interval) -> Vec<Candle> {
    let width = interval.secs();
    let mut candles: Vec<Candle> = Vec::new();
    for snap in series {
        let bucket_ts = snap.ts - snap.ts.rem_euclid(width);
        match candles.last_mut() {
            Some(candle) if candle.bucket_ts == bucket_ts => {
                candle.high = candle.high.max(snap.yes_price);
                candle.low = candle.low.min(snap.yes_price);
                candle.close = snap.yes_price;
                candle.volume += snap.volume;
                candle.samples += 1;
            }
            _ => candles.push(Candle {
                bucket_ts,
                open: snap.yes_price,
                high: snap.yes_price,
                low: snap.yes_price,
                close: snap.yes_price,
                volume: snap.volume,
                samples: 1,
            }),
        }
    }
    candles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(ts: i64, yes_price: i64, volume: i64) -> PriceSnapshot {
        PriceSnapshot {
            id: 0,
            option_id: 1,
            market_id: 1,
            ts,
            yes_price,
            no_price: lmsr::PRECISION - yes_price,
            yes_qty: 0,
            no_qty: 0,
            volume,
            snapshot_type: "trade".into(),
            trade_id: None,
        }
    }

    #[test]
    fn interval_parse_round_trip() {
        for (s, secs) in [("1m", 60), ("5m", 300), ("15m", 900), ("1h", 3600), ("4h", 14400), ("1d", 86400)] {
            assert_eq!(Interval::parse(s).unwrap().secs(), secs);
        }
        assert!(Interval::parse("2h").is_err());
    }

    #[test]
    fn single_bucket_ohlc() {
        let series = vec![snap(60, 500_000, 10), snap(70, 530_000, 20), snap(110, 480_000, 5)];
        let candles = aggregate_ohlc(&series, Interval::M1);
        assert_eq!(candles.len(), 1);
        let c = &candles[0];
        assert_eq!(c.bucket_ts, 60);
        assert_eq!(c.open, 500_000);
        assert_eq!(c.high, 530_000);
        assert_eq!(c.low, 480_000);
        assert_eq!(c.close, 480_000);
        assert_eq!(c.volume, 35);
        assert_eq!(c.samples, 3);
    }

    #[test]
    fn snapshots_split_across_buckets() {
        let series = vec![snap(0, 400_000, 1), snap(59, 450_000, 1), snap(60, 600_000, 2)];
        let candles = aggregate_ohlc(&series, Interval::M1);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 450_000);
        assert_eq!(candles[1].open, 600_000);
    }

    #[test]
    fn empty_buckets_are_omitted() {
        let series = vec![snap(0, 500_000, 1), snap(86_400 * 3, 510_000, 1)];
        let candles = aggregate_ohlc(&series, Interval::D1);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].bucket_ts, 0);
        assert_eq!(candles[1].bucket_ts, 86_400 * 3);
    }

    #[test]
    fn empty_series_gives_no_candles() {
        assert!(aggregate_ohlc(&[], Interval::H1).is_empty());
    }

    #[test]
    fn hourly_bucket_alignment() {
        let series = vec![snap(3_650, 500_000, 1)];
        let candles = aggregate_ohlc(&series, Interval::H1);
        assert_eq!(candles[0].bucket_ts, 3_600);
    }
}
