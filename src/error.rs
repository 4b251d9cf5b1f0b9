use chrono::NaiveDate;
use thiserror::Error;

/// Failure kinds surfaced by the threshold computer, the algorithms and the registry.
///
/// Arithmetic never fails; only input validation, registry lookup, empty
/// results and storage I/O produce one of these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnomalyError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("Algorithm {0} not available")]
    UnknownAlgorithm(String),

    #[error("No data for given date {0}")]
    NoData(NaiveDate),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl From<sqlx::Error> for AnomalyError {
    fn from(e: sqlx::Error) -> Self {
        AnomalyError::StorageUnavailable(e.to_string())
    }
}
