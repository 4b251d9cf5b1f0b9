pub mod algorithm;
pub mod baseline;
pub mod config;
pub mod error;
pub mod gateway;
pub mod generator;
pub mod registry;
pub mod storage;

pub use error::AnomalyError;

/// Common types used across modules
pub mod types {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};

    use crate::error::AnomalyError;

    /// Wire format for dates everywhere: `YYYY-MM-DD`
    pub const DATE_FORMAT: &str = "%Y-%m-%d";

    /// A single registration event, truncated to its day
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Observation {
        pub date: NaiveDate,
        pub country: String,
    }

    impl Observation {
        pub fn new(date: NaiveDate, country: impl Into<String>) -> Self {
            Self { date, country: country.into() }
        }
    }

    /// Registrations for one country on one day
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DailyCount {
        pub date: NaiveDate,
        pub country: String,
        pub count: u64,
    }

    /// Precomputed normal range for one (date, country) pair, plus what was observed
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Threshold {
        pub date: NaiveDate,
        pub country: String,
        pub lower_bound: f64,
        pub upper_bound: f64,
        pub observed_count: u64,
    }

    impl Threshold {
        /// Inclusive on both ends: a count sitting exactly on a bound is normal.
        pub fn contains(&self, count: u64) -> bool {
            let c = count as f64;
            self.lower_bound <= c && c <= self.upper_bound
        }
    }

    /// Verdict for one country on the queried date
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AnomalyResult {
        pub is_anomaly: bool,
        pub registrations_cnt: u64,
    }

    /// Country -> verdict, ordered by country name
    pub type CheckOutput = BTreeMap<String, AnomalyResult>;

    /// Parse a `YYYY-MM-DD` date, rejecting anything else as invalid input
    pub fn parse_date(value: &str) -> Result<NaiveDate, AnomalyError> {
        NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|e| {
            AnomalyError::InvalidInput(format!(
                "registration_dt '{}' is not a YYYY-MM-DD date: {}",
                value, e
            ))
        })
    }

    pub fn format_date(date: NaiveDate) -> String {
        date.format(DATE_FORMAT).to_string()
    }

}
