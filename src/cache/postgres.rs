//! PostgreSQL bar store.
//!
//! Mirrors [`super::InMemoryBarStore`] semantics on top of a `bars` table
//! with a composite primary key, so the upsert is a single
//! `INSERT .. ON CONFLICT .. DO UPDATE` statement per bar.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::debug;

use super::store::BarStore;
use crate::data::types::{Bar, Timeframe};
use crate::error::{CacheError, CacheResult};

/// Bar row as stored.
#[derive(Debug, FromRow)]
struct BarRow {
    instrument_id: String,
    timeframe: String,
    bucket_start: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

impl BarRow {
    fn into_bar(self) -> CacheResult<Bar> {
        let timeframe = Timeframe::parse(&self.timeframe).ok_or_else(|| {
            CacheError::InvalidRow(format!("unknown timeframe '{}'", self.timeframe))
        })?;
        Ok(Bar {
            instrument_id: self.instrument_id,
            timeframe,
            bucket_start: self.bucket_start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        })
    }
}

/// PostgreSQL-backed bar store.
pub struct PostgresBarStore {
    pool: PgPool,
}

impl PostgresBarStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a bounded pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> CacheResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the bars table if it does not exist yet.
    pub async fn ensure_schema(&self) -> CacheResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bars (
                instrument_id TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                bucket_start TIMESTAMPTZ NOT NULL,
                open NUMERIC NOT NULL,
                high NUMERIC NOT NULL,
                low NUMERIC NOT NULL,
                close NUMERIC NOT NULL,
                volume NUMERIC NOT NULL,
                PRIMARY KEY (instrument_id, timeframe, bucket_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BarStore for PostgresBarStore {
    async fn upsert_bars(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
        bars: &[Bar],
    ) -> CacheResult<usize> {
        if bars.is_empty() {
            return Ok(0);
        }

        let mut written = 0usize;
        for bar in bars {
            sqlx::query(
                r#"
                INSERT INTO bars (
                    instrument_id, timeframe, bucket_start,
                    open, high, low, close, volume
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (instrument_id, timeframe, bucket_start)
                DO UPDATE SET
                    open = EXCLUDED.open,
                    high = EXCLUDED.high,
                    low = EXCLUDED.low,
                    close = EXCLUDED.close,
                    volume = EXCLUDED.volume
                "#,
            )
            .bind(instrument_id)
            .bind(timeframe.as_str())
            .bind(bar.bucket_start)
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .execute(&self.pool)
            .await?;
            written += 1;
        }

        debug!(
            "Upserted {} bar(s) for {} {}",
            written, instrument_id, timeframe
        );
        Ok(written)
    }

    async fn query(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CacheResult<Vec<Bar>> {
        let rows = sqlx::query_as::<_, BarRow>(
            r#"
            SELECT instrument_id, timeframe, bucket_start,
                   open, high, low, close, volume
            FROM bars
            WHERE instrument_id = $1
              AND timeframe = $2
              AND bucket_start >= $3
              AND bucket_start < $4
            ORDER BY bucket_start ASC
            "#,
        )
        .bind(instrument_id)
        .bind(timeframe.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BarRow::into_bar).collect()
    }

    async fn coverage(
        &self,
        instrument_id: &str,
        timeframe: Timeframe,
    ) -> CacheResult<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let row: Option<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT MIN(bucket_start), MAX(bucket_start)
            FROM bars
            WHERE instrument_id = $1 AND timeframe = $2
            "#,
        )
        .bind(instrument_id)
        .bind(timeframe.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(min, max)| min.zip(max)))
    }
}
