//! Synthetic registration traffic: normally distributed daily counts per
//! country with occasional wide-spread outlier days.

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::config::GeneratorConfig;
use crate::types::Observation;

/// Daily counts drawn for one country
#[derive(Debug, Clone, PartialEq)]
pub struct CountrySeries {
    pub country: String,
    pub mean: u32,
    pub counts: Vec<u64>,
}

pub struct Generator {
    config: GeneratorConfig,
    rng: StdRng,
}

impl Generator {
    pub fn new(config: &GeneratorConfig) -> Self {
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config: config.clone(), rng }
    }

    /// Draw the per-day counts for every configured country
    pub fn series(&mut self) -> Vec<CountrySeries> {
        let days = self.config.registrations_period_days as usize;
        let countries = self.config.countries.clone();

        countries
            .into_iter()
            .map(|country| {
                let mean = self.rng.gen_range(self.config.mean_min..=self.config.mean_max);
                let std = f64::from(mean / 6);
                let counts = (0..days).map(|_| self.draw(f64::from(mean), std)).collect();
                CountrySeries { country, mean, counts }
            })
            .collect()
    }

    /// Expand series into individual events, one per registration
    pub fn observations(&mut self) -> Vec<Observation> {
        let first = self.config.first_registration_date;
        let series = self.series();

        let mut events = Vec::with_capacity(
            series.iter().flat_map(|s| s.counts.iter()).sum::<u64>() as usize,
        );
        for s in &series {
            for (date, &n) in first.iter_days().zip(&s.counts) {
                events.extend((0..n).map(|_| Observation::new(date, s.country.clone())));
            }
            tracing::debug!(country = %s.country, mean = s.mean, days = s.counts.len(), "Generated series");
        }
        events
    }

    pub fn first_date(&self) -> NaiveDate {
        self.config.first_registration_date
    }

    /// One rounded draw from N(mean, std), or N(mean, std·factor) on outlier days, clamped at 0
    fn draw(&mut self, mean: f64, std: f64) -> u64 {
        let spread = if self.rng.gen::<f64>() < self.config.outlier_prob {
            std * self.config.outlier_factor
        } else {
            std
        };
        let value = match Normal::new(mean, spread) {
            Ok(normal) => normal.sample(&mut self.rng).round(),
            Err(_) => mean,
        };
        if value <= 0.0 { 0 } else { value as u64 }
    }
}
