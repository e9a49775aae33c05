//! Configuration module for matching-service.

use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::observability::LogFormat;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub otlp_endpoint: Option<String>,
    pub storage: StorageBackend,
    pub database: DatabaseConfig,
    pub scoring: ScoringPolicy,
    pub workers: WorkerConfig,
}

/// Where matches are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" | "in-memory" => Ok(Self::Memory),
            other => Err(AppError::ConfigError(anyhow::anyhow!(
                "Unknown STORAGE_BACKEND '{}', expected postgres or memory",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Tunable scoring and proposal policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringPolicy {
    /// Differences at or below this earn the full amount score.
    pub amount_exact_tolerance: Decimal,
    /// Lower bound of the zero-score band.
    pub amount_absolute_band: Decimal,
    /// Fraction of the receipt amount; the band is the larger of the two.
    pub amount_relative_band: Decimal,
    pub max_day_window: i64,
    pub auto_propose_threshold: i32,
    pub ambiguity_epsilon: i32,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            amount_exact_tolerance: Decimal::new(1, 2),
            amount_absolute_band: Decimal::new(500, 2),
            amount_relative_band: Decimal::new(10, 2),
            max_day_window: 7,
            auto_propose_threshold: 60,
            ambiguity_epsilon: 5,
        }
    }
}

impl ScoringPolicy {
    pub fn validate(&self) -> Result<(), AppError> {
        let fail = |msg: &str| Err(AppError::ConfigError(anyhow::anyhow!("{}", msg)));

        if self.amount_exact_tolerance.is_sign_negative() {
            return fail("MATCH_AMOUNT_EXACT_TOLERANCE must not be negative");
        }
        if self.amount_absolute_band <= self.amount_exact_tolerance {
            return fail("MATCH_AMOUNT_ABSOLUTE_BAND must exceed the exact tolerance");
        }
        if self.amount_relative_band.is_sign_negative() {
            return fail("MATCH_AMOUNT_RELATIVE_BAND must not be negative");
        }
        if self.max_day_window < 1 {
            return fail("MATCH_MAX_DAY_WINDOW must be at least 1");
        }
        if !(0..=100).contains(&self.auto_propose_threshold) {
            return fail("MATCH_AUTO_PROPOSE_THRESHOLD must be within 0..=100");
        }
        if !(0..=100).contains(&self.ambiguity_epsilon) {
            return fail("MATCH_AMBIGUITY_EPSILON must be within 0..=100");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub auto_match_concurrency: usize,
    pub batch_concurrency: usize,
    pub storage_retry_max_elapsed: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            auto_match_concurrency: 8,
            batch_concurrency: 4,
            storage_retry_max_elapsed: Duration::from_millis(2_000),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl MatchingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let storage = match env::var("STORAGE_BACKEND") {
            Ok(v) => v.parse()?,
            Err(_) => StorageBackend::Postgres,
        };

        let database = DatabaseConfig {
            url: env::var("DATABASE_URL").ok(),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS").unwrap_or(10),
            min_connections: env_parse("DATABASE_MIN_CONNECTIONS").unwrap_or(2),
        };
        if storage == StorageBackend::Postgres && database.url.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_URL is required when STORAGE_BACKEND=postgres"
            )));
        }

        let defaults = ScoringPolicy::default();
        let scoring = ScoringPolicy {
            amount_exact_tolerance: env_parse("MATCH_AMOUNT_EXACT_TOLERANCE")
                .unwrap_or(defaults.amount_exact_tolerance),
            amount_absolute_band: env_parse("MATCH_AMOUNT_ABSOLUTE_BAND")
                .unwrap_or(defaults.amount_absolute_band),
            amount_relative_band: env_parse("MATCH_AMOUNT_RELATIVE_BAND")
                .unwrap_or(defaults.amount_relative_band),
            max_day_window: env_parse("MATCH_MAX_DAY_WINDOW").unwrap_or(defaults.max_day_window),
            auto_propose_threshold: env_parse("MATCH_AUTO_PROPOSE_THRESHOLD")
                .unwrap_or(defaults.auto_propose_threshold),
            ambiguity_epsilon: env_parse("MATCH_AMBIGUITY_EPSILON")
                .unwrap_or(defaults.ambiguity_epsilon),
        };
        scoring.validate()?;

        let worker_defaults = WorkerConfig::default();
        let workers = WorkerConfig {
            auto_match_concurrency: env_parse::<usize>("AUTO_MATCH_CONCURRENCY")
                .unwrap_or(worker_defaults.auto_match_concurrency)
                .max(1),
            batch_concurrency: env_parse::<usize>("BATCH_CONCURRENCY")
                .unwrap_or(worker_defaults.batch_concurrency)
                .max(1),
            storage_retry_max_elapsed: env_parse::<u64>("STORAGE_RETRY_MAX_ELAPSED_MS")
                .map(Duration::from_millis)
                .unwrap_or(worker_defaults.storage_retry_max_elapsed),
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "matching-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: match env::var("LOG_FORMAT") {
                Ok(raw) => raw
                    .parse()
                    .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
                Err(_) => LogFormat::default(),
            },
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            storage,
            database,
            scoring,
            workers,
        })
    }

    /// In-memory configuration with default policy, used by tests.
    pub fn in_memory() -> Self {
        Self {
            common: core_config::Config {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            service_name: "matching-service".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            otlp_endpoint: None,
            storage: StorageBackend::Memory,
            database: DatabaseConfig {
                url: None,
                max_connections: 1,
                min_connections: 1,
            },
            scoring: ScoringPolicy::default(),
            workers: WorkerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        let policy = ScoringPolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.amount_exact_tolerance, Decimal::new(1, 2));
        assert_eq!(policy.auto_propose_threshold, 60);
    }

    #[test]
    fn test_threshold_above_100_is_config_error() {
        let policy = ScoringPolicy {
            auto_propose_threshold: 120,
            ..Default::default()
        };
        assert!(matches!(policy.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_zero_day_window_rejected() {
        let policy = ScoringPolicy {
            max_day_window: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_storage_backend_parse() {
        assert_eq!("memory".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert_eq!("Postgres".parse::<StorageBackend>().unwrap(), StorageBackend::Postgres);
        assert!("mongo".parse::<StorageBackend>().is_err());
    }
}
