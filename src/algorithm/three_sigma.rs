use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;

use super::AnomalyAlgorithm;
use crate::error::AnomalyError;
use crate::storage::Store;
use crate::types::{AnomalyResult, CheckOutput};

/// Three-sigma rule over the precomputed threshold table.
/// A country is anomalous when its count lies outside `[lower, upper]`.
pub struct ThreeSigmaAlgorithm {
    store: Arc<dyn Store>,
}

impl ThreeSigmaAlgorithm {
    pub const ID: &'static str = "three-sigma";

    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AnomalyAlgorithm for ThreeSigmaAlgorithm {
    fn id(&self) -> &str { Self::ID }

    async fn check(&self, date: NaiveDate) -> Result<CheckOutput, AnomalyError> {
        let thresholds = self.store.thresholds_for_date(date).await?;

        let result: CheckOutput = thresholds
            .into_iter()
            .map(|t| {
                let verdict = AnomalyResult {
                    is_anomaly: !t.contains(t.observed_count),
                    registrations_cnt: t.observed_count,
                };
                (t.country, verdict)
            })
            .collect();

        let anomalies = result.values().filter(|r| r.is_anomaly).count();
        tracing::debug!(%date, countries = result.len(), anomalies, "three-sigma check");
        Ok(result)
    }
}
