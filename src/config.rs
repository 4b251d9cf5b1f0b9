use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_instance")]
    pub instance: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            instance: default_instance(),
            log_level: default_log_level(),
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: default_sqlite_path(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThresholdConfig {
    /// Number of strictly preceding days each bound is derived from
    #[serde(default = "default_window_size")]
    pub window_size_days: u32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self { window_size_days: default_window_size() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { cache_capacity: default_cache_capacity() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneratorConfig {
    #[serde(default = "default_countries")]
    pub countries: Vec<String>,
    #[serde(default = "default_first_date")]
    pub first_registration_date: NaiveDate,
    #[serde(default = "default_period_days")]
    pub registrations_period_days: u32,
    #[serde(default = "default_mean_min")]
    pub mean_min: u32,
    #[serde(default = "default_mean_max")]
    pub mean_max: u32,
    #[serde(default = "default_outlier_prob")]
    pub outlier_prob: f64,
    #[serde(default = "default_outlier_factor")]
    pub outlier_factor: f64,
    pub random_seed: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            countries: default_countries(),
            first_registration_date: default_first_date(),
            registrations_period_days: default_period_days(),
            mean_min: default_mean_min(),
            mean_max: default_mean_max(),
            outlier_prob: default_outlier_prob(),
            outlier_factor: default_outlier_factor(),
            random_seed: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand environment variables
        let expanded = expand_env_vars(content)?;

        let config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.thresholds.window_size_days < 1 {
            bail!("thresholds.window_size_days must be at least 1");
        }
        if self.registry.cache_capacity < 1 {
            bail!("registry.cache_capacity must be at least 1");
        }
        if self.storage.max_connections < 1 {
            bail!("storage.max_connections must be at least 1");
        }
        let g = &self.generator;
        if g.countries.is_empty() {
            bail!("generator.countries must not be empty");
        }
        if g.mean_min > g.mean_max {
            bail!("generator.mean_min ({}) exceeds mean_max ({})", g.mean_min, g.mean_max);
        }
        if !(0.0..=1.0).contains(&g.outlier_prob) {
            bail!("generator.outlier_prob must lie in [0, 1], got {}", g.outlier_prob);
        }
        if g.outlier_factor < 0.0 {
            bail!("generator.outlier_factor must not be negative");
        }
        Ok(())
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")?;
    let expanded = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    });
    Ok(expanded.to_string())
}

// Default value functions
fn default_instance() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_log_level() -> String { "info".to_string() }
fn default_bind() -> String { "0.0.0.0:8000".to_string() }
fn default_backend() -> StorageBackend { StorageBackend::Sqlite }
fn default_sqlite_path() -> String { "registrations.db".to_string() }
fn default_max_connections() -> u32 { 4 }
fn default_window_size() -> u32 { 7 }
fn default_cache_capacity() -> usize { 128 }
fn default_countries() -> Vec<String> {
    ["UK", "Denmark", "Greece", "Netherlands", "France"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}
fn default_first_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 7, 1).unwrap_or_default()
}
fn default_period_days() -> u32 { 30 }
fn default_mean_min() -> u32 { 50 }
fn default_mean_max() -> u32 { 1000 }
fn default_outlier_prob() -> f64 { 0.05 }
fn default_outlier_factor() -> f64 { 3.0 }
