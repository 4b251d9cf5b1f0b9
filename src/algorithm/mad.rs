use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};

use super::AnomalyAlgorithm;
use crate::baseline::{WindowSize, SIGMA_MULTIPLIER};
use crate::error::AnomalyError;
use crate::storage::Store;
use crate::types::{AnomalyResult, CheckOutput};

/// Scales MAD to a standard-deviation estimate for normally distributed data
const MAD_SCALE: f64 = 1.4826;

/// Robust variant: median ± 3·1.4826·MAD over the same trailing window.
///
/// Country eligibility and observed counts come from the threshold table, so
/// both algorithms answer for exactly the same set of countries.
pub struct MadAlgorithm {
    store: Arc<dyn Store>,
    window: WindowSize,
}

impl MadAlgorithm {
    pub const ID: &'static str = "mad";

    pub fn new(store: Arc<dyn Store>, window: WindowSize) -> Self {
        Self { store, window }
    }

    /// `(lower, upper)` for one dense window of counts
    pub fn bounds(window: &[u64]) -> (f64, f64) {
        let values: Vec<f64> = window.iter().map(|&c| c as f64).collect();
        let med = median(values.clone());
        let mad = median(values.iter().map(|v| (v - med).abs()).collect());
        let spread = SIGMA_MULTIPLIER * MAD_SCALE * mad;
        ((med - spread).max(0.0), med + spread)
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[async_trait]
impl AnomalyAlgorithm for MadAlgorithm {
    fn id(&self) -> &str { Self::ID }

    async fn check(&self, date: NaiveDate) -> Result<CheckOutput, AnomalyError> {
        let thresholds = self.store.thresholds_for_date(date).await?;
        if thresholds.is_empty() {
            return Ok(CheckOutput::new());
        }

        let w = self.window.days();
        let (from, to) = date
            .checked_sub_days(Days::new(w as u64))
            .zip(date.pred_opt())
            .ok_or_else(|| AnomalyError::InvalidInput(format!("date {} too early for window", date)))?;

        let mut history: BTreeMap<String, BTreeMap<NaiveDate, u64>> = BTreeMap::new();
        for c in self.store.daily_counts(from, to).await? {
            history.entry(c.country).or_default().insert(c.date, c.count);
        }

        let mut result = CheckOutput::new();
        for t in thresholds {
            let days = history.get(&t.country);
            let window: Vec<u64> = from
                .iter_days()
                .take(w)
                .map(|d| days.and_then(|m| m.get(&d)).copied().unwrap_or(0))
                .collect();

            let (lower, upper) = Self::bounds(&window);
            let observed = t.observed_count as f64;
            result.insert(
                t.country,
                AnomalyResult {
                    is_anomaly: !(lower <= observed && observed <= upper),
                    registrations_cnt: t.observed_count,
                },
            );
        }

        tracing::debug!(%date, countries = result.len(), window = w, "mad check");
        Ok(result)
    }
}
