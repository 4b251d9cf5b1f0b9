//! Rolling-window baseline: per-(date, country) normal ranges from the
//! trailing window of strictly preceding days.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::AnomalyError;
use crate::storage::Store;
use crate::types::{DailyCount, Threshold};

/// Width of the normal range in standard deviations
pub const SIGMA_MULTIPLIER: f64 = 3.0;

/// Number of preceding days a bound is derived from. Always at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WindowSize(usize);

impl WindowSize {
    pub fn new(days: usize) -> Result<Self, AnomalyError> {
        if days < 1 {
            return Err(AnomalyError::InvalidInput(format!(
                "window size must be at least 1 day, got {}",
                days
            )));
        }
        Ok(Self(days))
    }

    pub fn days(self) -> usize {
        self.0
    }
}

impl TryFrom<u32> for WindowSize {
    type Error = AnomalyError;

    fn try_from(days: u32) -> Result<Self, Self::Error> {
        Self::new(days as usize)
    }
}

/// Mean and population standard deviation of one window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub mean: f64,
    pub std: f64,
}

impl WindowStats {
    /// Build from exact running sums over `n` values.
    ///
    /// Variance is `E[x²] - E[x]²`; cancellation can push it a hair below
    /// zero, so it is clamped before the square root.
    pub fn from_sums(sum: u128, sum_sq: u128, n: usize) -> Self {
        let n = n as f64;
        let mean = sum as f64 / n;
        let variance = (sum_sq as f64 / n - mean * mean).max(0.0);
        Self { mean, std: variance.sqrt() }
    }

    pub fn lower_bound(&self) -> f64 {
        (self.mean - SIGMA_MULTIPLIER * self.std).max(0.0)
    }

    pub fn upper_bound(&self) -> f64 {
        self.mean + SIGMA_MULTIPLIER * self.std
    }
}

/// Outcome of one full recomputation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub window_size_days: usize,
    pub first_day: Option<NaiveDate>,
    pub last_day: Option<NaiveDate>,
    pub countries: usize,
    pub thresholds_written: usize,
}

/// Derives the threshold table from daily registration counts
#[derive(Debug, Clone, Copy)]
pub struct ThresholdComputer {
    window: WindowSize,
}

impl ThresholdComputer {
    pub fn new(window: WindowSize) -> Self {
        Self { window }
    }

    pub fn window(&self) -> WindowSize {
        self.window
    }

    /// Thresholds for a single country.
    ///
    /// `series` must be sorted by date with no missing days. The row for the
    /// day at index `i` is built from days `i - W ..= i - 1`, so nothing is
    /// emitted for the first `W` days.
    pub fn compute_country(&self, country: &str, series: &[DailyCount]) -> Vec<Threshold> {
        let w = self.window.days();
        if series.len() <= w {
            return Vec::new();
        }

        let mut sum: u128 = 0;
        let mut sum_sq: u128 = 0;
        for day in &series[..w] {
            sum += u128::from(day.count);
            sum_sq += u128::from(day.count) * u128::from(day.count);
        }

        let mut rows = Vec::with_capacity(series.len() - w);
        for i in w..series.len() {
            let stats = WindowStats::from_sums(sum, sum_sq, w);
            let current = &series[i];
            rows.push(Threshold {
                date: current.date,
                country: country.to_string(),
                lower_bound: stats.lower_bound(),
                upper_bound: stats.upper_bound(),
                observed_count: current.count,
            });

            // Slide: today joins the window for tomorrow, day i - W leaves it
            let leaving = u128::from(series[i - w].count);
            let joining = u128::from(current.count);
            sum = sum + joining - leaving;
            sum_sq = sum_sq + joining * joining - leaving * leaving;
        }
        rows
    }

    /// Thresholds for every country in `counts`, sorted by (date, country).
    ///
    /// Each country's series starts at its own first observed day and runs to
    /// the last day present anywhere in `counts`; days without registrations
    /// in between count as zero. A country that goes quiet at the end of the
    /// data therefore still gets rows for its zero days.
    pub fn compute(&self, counts: &[DailyCount]) -> Vec<Threshold> {
        let Some(last_day) = counts.iter().map(|c| c.date).max() else {
            return Vec::new();
        };

        let mut by_country: BTreeMap<&str, BTreeMap<NaiveDate, u64>> = BTreeMap::new();
        for c in counts {
            *by_country
                .entry(c.country.as_str())
                .or_default()
                .entry(c.date)
                .or_insert(0) += c.count;
        }

        let mut rows = Vec::new();
        for (country, days) in &by_country {
            let series = fill_gaps(country, days, last_day);
            let country_rows = self.compute_country(country, &series);
            tracing::debug!(
                country,
                days = series.len(),
                rows = country_rows.len(),
                "Computed country thresholds"
            );
            rows.extend(country_rows);
        }

        rows.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.country.cmp(&b.country)));
        rows
    }

    /// Recompute the whole threshold table from the store and replace it.
    pub async fn run(&self, store: &dyn Store) -> Result<RunSummary, AnomalyError> {
        let started = Instant::now();

        let span = store.observation_span().await?;
        let counts = match span {
            Some((first, last)) => store.daily_counts(first, last).await?,
            None => Vec::new(),
        };

        let rows = self.compute(&counts);
        let countries = rows
            .iter()
            .map(|r| r.country.as_str())
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        let written = rows.len();

        store.replace_thresholds(rows).await?;

        tracing::info!(
            window = self.window.days(),
            countries,
            thresholds = written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Recomputed anomaly thresholds"
        );

        Ok(RunSummary {
            window_size_days: self.window.days(),
            first_day: span.map(|(f, _)| f),
            last_day: span.map(|(_, l)| l),
            countries,
            thresholds_written: written,
        })
    }
}

/// Dense, date-ordered series from the first day in `days` through `last`,
/// with zero counts on missing days
fn fill_gaps(country: &str, days: &BTreeMap<NaiveDate, u64>, last: NaiveDate) -> Vec<DailyCount> {
    let Some(first) = days.keys().next() else {
        return Vec::new();
    };

    first
        .iter_days()
        .take_while(|d| *d <= last)
        .map(|date| DailyCount {
            date,
            country: country.to_string(),
            count: days.get(&date).copied().unwrap_or(0),
        })
        .collect()
}
