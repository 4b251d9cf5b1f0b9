use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use super::Store;
use crate::error::AnomalyError;
use crate::types::{format_date, DailyCount, Observation, Threshold, DATE_FORMAT};

/// Rows per multi-value INSERT, kept well under SQLite's bind-parameter limit
const OBSERVATION_CHUNK: usize = 400;
const THRESHOLD_CHUNK: usize = 150;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS registration_events (
        user_id INTEGER PRIMARY KEY AUTOINCREMENT,
        reg_datetime TEXT NOT NULL,
        country TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_registration_events_day
        ON registration_events (reg_datetime, country)",
    "CREATE TABLE IF NOT EXISTS anomaly_thresholds (
        registration_dt TEXT NOT NULL,
        country TEXT NOT NULL,
        lower_bound REAL NOT NULL,
        upper_bound REAL NOT NULL,
        registrations_cnt INTEGER NOT NULL,
        PRIMARY KEY (registration_dt, country)
    )",
];

/// SQLite-backed store using an sqlx connection pool
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and ensure the schema exists.
    /// `":memory:"` gives a private in-memory database on a single connection.
    pub async fn open(path: &str, max_connections: u32) -> Result<Self, AnomalyError> {
        let (options, pool_options, max_connections) = if path == ":memory:" {
            // The database dies with its connection, so that connection is never recycled
            (
                SqliteConnectOptions::from_str("sqlite::memory:")?,
                SqlitePoolOptions::new()
                    .min_connections(1)
                    .max_connections(1)
                    .idle_timeout(None::<Duration>)
                    .max_lifetime(None::<Duration>),
                1,
            )
        } else {
            (
                SqliteConnectOptions::new().filename(path).create_if_missing(true),
                SqlitePoolOptions::new().max_connections(max_connections),
                max_connections,
            )
        };

        let pool = pool_options.connect_with(options).await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        tracing::debug!(path, max_connections, "SQLite store ready");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), AnomalyError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn column_date(row: &SqliteRow, column: &str) -> Result<NaiveDate, AnomalyError> {
    let raw: String = row.try_get(column)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(|e| {
        AnomalyError::StorageUnavailable(format!("malformed date '{}' in {}: {}", raw, column, e))
    })
}

fn column_count(row: &SqliteRow, column: &str) -> Result<u64, AnomalyError> {
    let raw: i64 = row.try_get(column)?;
    u64::try_from(raw).map_err(|_| {
        AnomalyError::StorageUnavailable(format!("negative count {} in {}", raw, column))
    })
}

fn to_sql_count(count: u64) -> Result<i64, AnomalyError> {
    i64::try_from(count)
        .map_err(|_| AnomalyError::InvalidInput(format!("count {} overflows storage", count)))
}

fn threshold_from_row(row: &SqliteRow) -> Result<Threshold, AnomalyError> {
    Ok(Threshold {
        date: column_date(row, "registration_dt")?,
        country: row.try_get("country")?,
        lower_bound: row.try_get("lower_bound")?,
        upper_bound: row.try_get("upper_bound")?,
        observed_count: column_count(row, "registrations_cnt")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str { "sqlite" }

    async fn append_observations(&self, batch: &[Observation]) -> Result<(), AnomalyError> {
        let mut tx = self.pool.begin().await?;
        for chunk in batch.chunks(OBSERVATION_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO registration_events (reg_datetime, country) ");
            builder.push_values(chunk, |mut b, obs| {
                b.push_bind(format_date(obs.date)).push_bind(obs.country.clone());
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn observation_span(&self) -> Result<Option<(NaiveDate, NaiveDate)>, AnomalyError> {
        let row = sqlx::query(
            "SELECT MIN(reg_datetime) AS first_day, MAX(reg_datetime) AS last_day
             FROM registration_events",
        )
        .fetch_one(&self.pool)
        .await?;

        let first: Option<String> = row.try_get("first_day")?;
        let last: Option<String> = row.try_get("last_day")?;
        match (first, last) {
            (Some(_), Some(_)) => Ok(Some((
                column_date(&row, "first_day")?,
                column_date(&row, "last_day")?,
            ))),
            _ => Ok(None),
        }
    }

    async fn daily_counts(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyCount>, AnomalyError> {
        let rows = sqlx::query(
            "SELECT reg_datetime, country, COUNT(*) AS registrations_cnt
             FROM registration_events
             WHERE reg_datetime BETWEEN ?1 AND ?2
             GROUP BY country, reg_datetime
             ORDER BY country, reg_datetime",
        )
        .bind(format_date(from))
        .bind(format_date(to))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(DailyCount {
                    date: column_date(row, "reg_datetime")?,
                    country: row.try_get("country")?,
                    count: column_count(row, "registrations_cnt")?,
                })
            })
            .collect()
    }

    async fn thresholds_for_date(&self, date: NaiveDate) -> Result<Vec<Threshold>, AnomalyError> {
        let rows = sqlx::query(
            "SELECT registration_dt, country, lower_bound, upper_bound, registrations_cnt
             FROM anomaly_thresholds
             WHERE registration_dt = ?1
             ORDER BY country",
        )
        .bind(format_date(date))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(threshold_from_row).collect()
    }

    async fn thresholds_for_country(
        &self,
        country: &str,
    ) -> Result<Vec<Threshold>, AnomalyError> {
        let rows = sqlx::query(
            "SELECT registration_dt, country, lower_bound, upper_bound, registrations_cnt
             FROM anomaly_thresholds
             WHERE country = ?1
             ORDER BY registration_dt",
        )
        .bind(country)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(threshold_from_row).collect()
    }

    async fn replace_thresholds(&self, rows: Vec<Threshold>) -> Result<(), AnomalyError> {
        let counts = rows
            .iter()
            .map(|row| to_sql_count(row.observed_count))
            .collect::<Result<Vec<_>, _>>()?;

        // Dropping the transaction on any error rolls it back
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM anomaly_thresholds").execute(&mut *tx).await?;

        for (chunk, chunk_counts) in rows.chunks(THRESHOLD_CHUNK).zip(counts.chunks(THRESHOLD_CHUNK)) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO anomaly_thresholds \
                 (registration_dt, country, lower_bound, upper_bound, registrations_cnt) ",
            );
            builder.push_values(chunk.iter().zip(chunk_counts), |mut b, (row, count)| {
                b.push_bind(format_date(row.date))
                    .push_bind(row.country.clone())
                    .push_bind(row.lower_bound)
                    .push_bind(row.upper_bound)
                    .push_bind(*count);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
