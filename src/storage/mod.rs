pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::AnomalyError;
use crate::types::{DailyCount, Observation, Threshold};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Backing store for raw registration events and the precomputed threshold table.
///
/// Observations are append-only. The threshold table is only ever replaced
/// wholesale, and readers must see either the previous set or the new one.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name, for logs
    fn name(&self) -> &str;

    async fn append_observations(&self, batch: &[Observation]) -> Result<(), AnomalyError>;

    /// First and last day with at least one observation
    async fn observation_span(&self) -> Result<Option<(NaiveDate, NaiveDate)>, AnomalyError>;

    /// Per-(country, date) counts within `[from, to]`, sorted by country then date.
    /// Days without observations are absent.
    async fn daily_counts(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyCount>, AnomalyError>;

    /// Threshold rows for one date, sorted by country
    async fn thresholds_for_date(&self, date: NaiveDate) -> Result<Vec<Threshold>, AnomalyError>;

    /// Threshold rows for one country, sorted by date
    async fn thresholds_for_country(&self, country: &str)
        -> Result<Vec<Threshold>, AnomalyError>;

    /// Atomically swap the whole threshold table for `rows`
    async fn replace_thresholds(&self, rows: Vec<Threshold>) -> Result<(), AnomalyError>;
}

/// Open the configured backend
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn Store>, AnomalyError> {
    let store: Arc<dyn Store> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Sqlite => {
            Arc::new(SqliteStore::open(&config.sqlite_path, config.max_connections).await?)
        }
    };

    tracing::info!(backend = store.name(), "Opened storage");
    Ok(store)
}
