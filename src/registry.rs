//! Algorithm lookup by identifier, with memoised results per (algorithm, date).

use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::NaiveDate;
use lru::LruCache;
use parking_lot::Mutex;

use crate::algorithm::{AnomalyAlgorithm, MadAlgorithm, ThreeSigmaAlgorithm};
use crate::baseline::WindowSize;
use crate::config::RegistryConfig;
use crate::error::AnomalyError;
use crate::storage::Store;
use crate::types::{parse_date, CheckOutput};

/// Identifier used when the caller names no algorithm
pub const DEFAULT_ALGORITHM: &str = ThreeSigmaAlgorithm::ID;

type Constructor = fn(Arc<dyn Store>, WindowSize) -> Arc<dyn AnomalyAlgorithm>;

const ALGORITHMS: &[(&str, Constructor)] = &[
    (ThreeSigmaAlgorithm::ID, build_three_sigma),
    (MadAlgorithm::ID, build_mad),
];

fn build_three_sigma(store: Arc<dyn Store>, _window: WindowSize) -> Arc<dyn AnomalyAlgorithm> {
    Arc::new(ThreeSigmaAlgorithm::new(store))
}

fn build_mad(store: Arc<dyn Store>, window: WindowSize) -> Arc<dyn AnomalyAlgorithm> {
    Arc::new(MadAlgorithm::new(store, window))
}

type CacheKey = (String, NaiveDate);

struct CacheState {
    entries: LruCache<CacheKey, Arc<CheckOutput>>,
    /// Bumped on every clear
    generation: u64,
}

/// Bounded LRU of successful check results, safe to share across tasks.
///
/// Writers pass the generation they observed before computing; a result
/// computed before a `clear` is dropped instead of stored.
pub struct ResultCache {
    state: Mutex<CacheState>,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Result<Self, AnomalyError> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            AnomalyError::InvalidInput("result cache capacity must be at least 1".into())
        })?;
        Ok(Self {
            state: Mutex::new(CacheState { entries: LruCache::new(capacity), generation: 0 }),
        })
    }

    pub fn get(&self, algorithm: &str, date: NaiveDate) -> Option<Arc<CheckOutput>> {
        self.state.lock().entries.get(&(algorithm.to_string(), date)).cloned()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Store `output` unless the cache was cleared since `generation` was read.
    /// Returns whether the entry was stored.
    pub fn insert(
        &self,
        generation: u64,
        algorithm: &str,
        date: NaiveDate,
        output: Arc<CheckOutput>,
    ) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            tracing::debug!(algorithm, %date, "Dropping result computed before cache clear");
            return false;
        }
        if let Some((evicted, _)) = state.entries.push((algorithm.to_string(), date), output) {
            if evicted != (algorithm.to_string(), date) {
                tracing::trace!(algorithm = %evicted.0, date = %evicted.1, "Evicted cached result");
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().entries.cap().get()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.generation += 1;
    }
}

/// Maps algorithm identifiers to instances and memoises their results
pub struct AlgorithmRegistry {
    algorithms: Vec<Arc<dyn AnomalyAlgorithm>>,
    cache: ResultCache,
}

impl AlgorithmRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        config: &RegistryConfig,
        window: WindowSize,
    ) -> Result<Self, AnomalyError> {
        let algorithms = ALGORITHMS
            .iter()
            .map(|(_, build)| build(Arc::clone(&store), window))
            .collect::<Vec<_>>();

        tracing::info!(
            count = algorithms.len(),
            cache_capacity = config.cache_capacity,
            "Initialized anomaly algorithms"
        );

        Ok(Self {
            algorithms,
            cache: ResultCache::new(config.cache_capacity)?,
        })
    }

    /// Registered identifiers, in registration order
    pub fn algorithms(&self) -> Vec<&str> {
        self.algorithms.iter().map(|a| a.id()).collect()
    }

    /// Resolve an identifier; the empty string selects the default algorithm
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn AnomalyAlgorithm>, AnomalyError> {
        let id = if id.is_empty() { DEFAULT_ALGORITHM } else { id };
        self.algorithms
            .iter()
            .find(|a| a.id() == id)
            .cloned()
            .ok_or_else(|| AnomalyError::UnknownAlgorithm(id.to_string()))
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Run `algorithm` for `date` (`YYYY-MM-DD`).
    ///
    /// The algorithm is resolved before the date is looked at, so an unknown
    /// identifier is reported even when the date is malformed. A date with no
    /// threshold rows is `NoData`, never an empty success.
    pub async fn check(&self, algorithm: &str, date: &str) -> Result<Arc<CheckOutput>, AnomalyError> {
        let algo = self.resolve(algorithm)?;
        let date = parse_date(date)?;

        if let Some(hit) = self.cache.get(algo.id(), date) {
            tracing::debug!(algorithm = algo.id(), %date, "Result cache hit");
            return Ok(hit);
        }

        let generation = self.cache.generation();
        let output = algo.check(date).await?;
        if output.is_empty() {
            return Err(AnomalyError::NoData(date));
        }

        let output = Arc::new(output);
        self.cache.insert(generation, algo.id(), date, Arc::clone(&output));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::baseline::ThresholdComputer;
    use crate::storage::MemoryStore;
    use crate::types::{AnomalyResult, DailyCount, Observation, Threshold};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, d).unwrap()
    }

    fn registry(store: Arc<dyn Store>, capacity: usize) -> AlgorithmRegistry {
        AlgorithmRegistry::new(
            store,
            &RegistryConfig { cache_capacity: capacity },
            WindowSize::new(7).unwrap(),
        )
        .unwrap()
    }

    async fn store_with_row(d: u32, observed: u64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .replace_thresholds(vec![Threshold {
                date: day(d),
                country: "UK".into(),
                lower_bound: 10.0,
                upper_bound: 10.0,
                observed_count: observed,
            }])
            .await
            .unwrap();
        store
    }

    #[test]
    fn lists_registered_algorithms() {
        let reg = registry(Arc::new(MemoryStore::new()), 4);
        assert_eq!(reg.algorithms(), vec!["three-sigma", "mad"]);
        assert_eq!(reg.resolve("").unwrap().id(), "three-sigma");
        assert_eq!(reg.resolve("mad").unwrap().id(), "mad");
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let result = AlgorithmRegistry::new(
            Arc::new(MemoryStore::new()),
            &RegistryConfig { cache_capacity: 0 },
            WindowSize::new(7).unwrap(),
        );
        assert!(matches!(result, Err(AnomalyError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn unknown_algorithm_wins_over_bad_date() {
        let reg = registry(Arc::new(MemoryStore::new()), 4);
        let err = reg.check("prophet", "not-a-date").await.unwrap_err();
        assert_eq!(err, AnomalyError::UnknownAlgorithm("prophet".into()));

        let err = reg.check("", "2025/07/08").await.unwrap_err();
        assert!(matches!(err, AnomalyError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn empty_date_is_no_data() {
        let reg = registry(store_with_row(8, 10).await, 4);
        let err = reg.check("", "2025-07-01").await.unwrap_err();
        assert_eq!(err, AnomalyError::NoData(day(1)));
        assert!(reg.cache().is_empty());
    }

    #[tokio::test]
    async fn all_normal_is_a_populated_success() {
        let reg = registry(store_with_row(8, 10).await, 4);
        let result = reg.check("three-sigma", "2025-07-08").await.unwrap();
        assert_eq!(
            result.get("UK"),
            Some(&AnomalyResult { is_anomaly: false, registrations_cnt: 10 })
        );
    }

    #[tokio::test]
    async fn default_and_named_ids_share_cache_entries() {
        let reg = registry(store_with_row(8, 100).await, 4);
        let a = reg.check("", "2025-07-08").await.unwrap();
        let b = reg.check("three-sigma", "2025-07-08").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.cache().len(), 1);
    }

    /// Counts how often the underlying algorithm actually runs
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AnomalyAlgorithm for Counting {
        fn id(&self) -> &str { "counting" }

        async fn check(&self, date: NaiveDate) -> Result<CheckOutput, AnomalyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut out = CheckOutput::new();
            out.insert(
                date.to_string(),
                AnomalyResult { is_anomaly: false, registrations_cnt: 1 },
            );
            Ok(out)
        }
    }

    #[tokio::test]
    async fn cache_evicts_least_recently_used() {
        let counting = Arc::new(Counting { calls: AtomicUsize::new(0) });
        let reg = AlgorithmRegistry {
            algorithms: vec![counting.clone() as Arc<dyn AnomalyAlgorithm>],
            cache: ResultCache::new(2).unwrap(),
        };

        reg.check("counting", "2025-07-01").await.unwrap();
        reg.check("counting", "2025-07-02").await.unwrap();
        reg.check("counting", "2025-07-01").await.unwrap(); // hit, refreshes 07-01
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);

        reg.check("counting", "2025-07-03").await.unwrap(); // evicts 07-02
        assert_eq!(reg.cache().len(), 2);
        assert!(reg.cache().get("counting", day(1)).is_some());
        assert!(reg.cache().get("counting", day(2)).is_none());

        reg.check("counting", "2025-07-02").await.unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 4);
        assert_eq!(reg.cache().capacity(), 2);
    }

    #[test]
    fn insert_after_clear_is_dropped() {
        let cache = ResultCache::new(4).unwrap();
        let before = cache.generation();
        cache.clear();

        let output = Arc::new(CheckOutput::new());
        assert!(!cache.insert(before, "three-sigma", day(8), Arc::clone(&output)));
        assert!(cache.is_empty());
        assert!(cache.insert(cache.generation(), "three-sigma", day(8), output));
        assert_eq!(cache.len(), 1);
    }

    /// Holds each check open until released
    struct Gated {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl AnomalyAlgorithm for Gated {
        fn id(&self) -> &str { "gated" }

        async fn check(&self, date: NaiveDate) -> Result<CheckOutput, AnomalyError> {
            self.started.notify_one();
            self.release.notified().await;
            let mut out = CheckOutput::new();
            out.insert(
                date.to_string(),
                AnomalyResult { is_anomaly: false, registrations_cnt: 1 },
            );
            Ok(out)
        }
    }

    #[tokio::test]
    async fn result_racing_a_clear_is_not_cached() {
        let gated = Arc::new(Gated { started: Notify::new(), release: Notify::new() });
        let reg = Arc::new(AlgorithmRegistry {
            algorithms: vec![gated.clone() as Arc<dyn AnomalyAlgorithm>],
            cache: ResultCache::new(4).unwrap(),
        });

        let handle = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.check("gated", "2025-07-08").await })
        };
        gated.started.notified().await;
        reg.cache().clear();
        gated.release.notify_one();

        let output = handle.await.unwrap().unwrap();
        assert!(output.contains_key("2025-07-08"));
        assert!(reg.cache().is_empty());
    }

    /// Memory store whose backend can be taken offline
    struct Flaky {
        inner: MemoryStore,
        down: AtomicBool,
    }

    impl Flaky {
        fn guard(&self) -> Result<(), AnomalyError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(AnomalyError::StorageUnavailable("database is locked".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Store for Flaky {
        fn name(&self) -> &str { "flaky" }

        async fn append_observations(&self, batch: &[Observation]) -> Result<(), AnomalyError> {
            self.guard()?;
            self.inner.append_observations(batch).await
        }

        async fn observation_span(&self) -> Result<Option<(NaiveDate, NaiveDate)>, AnomalyError> {
            self.inner.observation_span().await
        }

        async fn daily_counts(
            &self,
            from: NaiveDate,
            to: NaiveDate,
        ) -> Result<Vec<DailyCount>, AnomalyError> {
            self.inner.daily_counts(from, to).await
        }

        async fn thresholds_for_date(&self, date: NaiveDate) -> Result<Vec<Threshold>, AnomalyError> {
            self.guard()?;
            self.inner.thresholds_for_date(date).await
        }

        async fn thresholds_for_country(
            &self,
            country: &str,
        ) -> Result<Vec<Threshold>, AnomalyError> {
            self.inner.thresholds_for_country(country).await
        }

        async fn replace_thresholds(&self, rows: Vec<Threshold>) -> Result<(), AnomalyError> {
            self.guard()?;
            self.inner.replace_thresholds(rows).await
        }
    }

    #[tokio::test]
    async fn storage_failures_reach_the_caller() {
        let store = Arc::new(Flaky { inner: MemoryStore::new(), down: AtomicBool::new(false) });
        let batch: Vec<_> = day(1)
            .iter_days()
            .take(8)
            .flat_map(|d| (0..10).map(move |_| Observation::new(d, "UK")))
            .collect();
        store.append_observations(&batch).await.unwrap();

        let computer = ThresholdComputer::new(WindowSize::new(7).unwrap());
        computer.run(store.as_ref()).await.unwrap();
        let reg = registry(store.clone(), 4);

        store.down.store(true, Ordering::SeqCst);
        let err = computer.run(store.as_ref()).await.unwrap_err();
        assert!(matches!(err, AnomalyError::StorageUnavailable(_)));
        let err = reg.check("", "2025-07-08").await.unwrap_err();
        assert_eq!(err, AnomalyError::StorageUnavailable("database is locked".into()));
        assert!(reg.cache().is_empty());

        // the earlier table is still served once the backend is back
        store.down.store(false, Ordering::SeqCst);
        let output = reg.check("", "2025-07-08").await.unwrap();
        assert_eq!(output["UK"].registrations_cnt, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cache_survives_concurrent_access() {
        let counting = Arc::new(Counting { calls: AtomicUsize::new(0) });
        let reg = Arc::new(AlgorithmRegistry {
            algorithms: vec![counting.clone() as Arc<dyn AnomalyAlgorithm>],
            cache: ResultCache::new(8).unwrap(),
        });

        let mut handles = Vec::new();
        for i in 0..64u32 {
            let reg = Arc::clone(&reg);
            handles.push(tokio::spawn(async move {
                let date = format!("2025-07-{:02}", i % 16 + 1);
                let out = reg.check("counting", &date).await.unwrap();
                assert!(out.contains_key(&date));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(reg.cache().len(), 8);
        reg.cache().clear();
        assert!(reg.cache().is_empty());
    }
}
