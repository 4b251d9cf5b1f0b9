pub mod mad;
pub mod three_sigma;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::AnomalyError;
use crate::types::CheckOutput;

pub use mad::MadAlgorithm;
pub use three_sigma::ThreeSigmaAlgorithm;

/// Trait for anomaly detection strategies.
///
/// Each algorithm classifies every country that has a threshold row for the
/// requested date. An empty mapping means there was nothing to classify; it
/// is not an error at this level.
#[async_trait]
pub trait AnomalyAlgorithm: Send + Sync {
    /// Registry identifier, e.g. "three-sigma"
    fn id(&self) -> &str;

    /// Classify each country's registrations on `date`
    async fn check(&self, date: NaiveDate) -> Result<CheckOutput, AnomalyError>;
}
