use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;

use super::Store;
use crate::error::AnomalyError;
use crate::types::{DailyCount, Observation, Threshold};

/// Thread-safe in-process store.
///
/// Events are folded into per-country daily counters on insert; the raw
/// events themselves carry nothing else worth keeping.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    /// country -> date -> count
    counts: BTreeMap<String, BTreeMap<NaiveDate, u64>>,
    /// (date, country) -> row
    thresholds: BTreeMap<(NaiveDate, String), Threshold>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events appended so far
    pub fn observation_count(&self) -> u64 {
        let inner = self.inner.read();
        inner.counts.values().flat_map(|days| days.values()).sum()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str { "memory" }

    async fn append_observations(&self, batch: &[Observation]) -> Result<(), AnomalyError> {
        let mut inner = self.inner.write();
        for obs in batch {
            *inner
                .counts
                .entry(obs.country.clone())
                .or_default()
                .entry(obs.date)
                .or_insert(0) += 1;
        }
        Ok(())
    }

    async fn observation_span(&self) -> Result<Option<(NaiveDate, NaiveDate)>, AnomalyError> {
        let inner = self.inner.read();
        let first = inner.counts.values().filter_map(|days| days.keys().next()).min();
        let last = inner.counts.values().filter_map(|days| days.keys().next_back()).max();
        Ok(first.zip(last).map(|(f, l)| (*f, *l)))
    }

    async fn daily_counts(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyCount>, AnomalyError> {
        if from > to {
            return Ok(Vec::new());
        }
        let inner = self.inner.read();
        let mut result = Vec::new();
        for (country, days) in &inner.counts {
            for (date, count) in days.range(from..=to) {
                result.push(DailyCount {
                    date: *date,
                    country: country.clone(),
                    count: *count,
                });
            }
        }
        Ok(result)
    }

    async fn thresholds_for_date(&self, date: NaiveDate) -> Result<Vec<Threshold>, AnomalyError> {
        let inner = self.inner.read();
        Ok(inner
            .thresholds
            .range((date, String::new())..)
            .take_while(|((d, _), _)| *d == date)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn thresholds_for_country(
        &self,
        country: &str,
    ) -> Result<Vec<Threshold>, AnomalyError> {
        let inner = self.inner.read();
        Ok(inner
            .thresholds
            .values()
            .filter(|row| row.country == country)
            .cloned()
            .collect())
    }

    async fn replace_thresholds(&self, rows: Vec<Threshold>) -> Result<(), AnomalyError> {
        let table: BTreeMap<_, _> = rows
            .into_iter()
            .map(|row| ((row.date, row.country.clone()), row))
            .collect();
        // Built outside the lock so readers only ever wait for the swap
        self.inner.write().thresholds = table;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, d).unwrap()
    }

    fn row(d: u32, country: &str) -> Threshold {
        Threshold {
            date: day(d),
            country: country.into(),
            lower_bound: 1.0,
            upper_bound: 2.0,
            observed_count: 1,
        }
    }

    #[tokio::test]
    async fn aggregates_events_per_day_and_country() {
        let store = MemoryStore::new();
        store
            .append_observations(&[
                Observation::new(day(1), "UK"),
                Observation::new(day(1), "UK"),
                Observation::new(day(2), "UK"),
                Observation::new(day(1), "France"),
            ])
            .await
            .unwrap();

        let counts = store.daily_counts(day(1), day(31)).await.unwrap();
        let flat: Vec<_> = counts
            .iter()
            .map(|c| (c.country.as_str(), c.date, c.count))
            .collect();
        assert_eq!(
            flat,
            vec![("France", day(1), 1), ("UK", day(1), 2), ("UK", day(2), 1)]
        );
        assert_eq!(store.observation_count(), 4);
        assert_eq!(store.observation_span().await.unwrap(), Some((day(1), day(2))));
    }

    #[tokio::test]
    async fn daily_counts_respects_range() {
        let store = MemoryStore::new();
        let batch: Vec<_> = (1..=5).map(|d| Observation::new(day(d), "UK")).collect();
        store.append_observations(&batch).await.unwrap();

        let counts = store.daily_counts(day(2), day(4)).await.unwrap();
        assert_eq!(counts.len(), 3);
        assert!(store.daily_counts(day(4), day(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_store_has_no_span() {
        let store = MemoryStore::new();
        assert_eq!(store.observation_span().await.unwrap(), None);
    }

    #[tokio::test]
    async fn replace_swaps_whole_table() {
        let store = MemoryStore::new();
        store
            .replace_thresholds(vec![row(8, "UK"), row(8, "France"), row(9, "UK")])
            .await
            .unwrap();

        let on_8th = store.thresholds_for_date(day(8)).await.unwrap();
        assert_eq!(on_8th.len(), 2);
        assert_eq!(on_8th[0].country, "France");
        assert_eq!(store.thresholds_for_country("UK").await.unwrap().len(), 2);

        store.replace_thresholds(vec![row(10, "Greece")]).await.unwrap();
        assert!(store.thresholds_for_date(day(8)).await.unwrap().is_empty());
        assert_eq!(store.thresholds_for_date(day(10)).await.unwrap().len(), 1);
    }
}
