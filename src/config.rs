//! Configuration management for the Sightline engine
//!
//! Strongly-typed configuration read from environment variables, with
//! defaults and validation. A `.env` file is honoured when present.
//!
//! # Example
//! ```no_run
//! use sightline::Config;
//! let config = Config::from_env().expect("failed to load config");
//! println!("popular floor: {}", config.engine.popular_min_rate);
//! ```

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Ranking thresholds and limits
    pub engine: EngineConfig,
    /// Collaborative filtering model configuration
    pub ml: MlConfig,
    /// API server configuration
    pub api: ApiConfig,
    /// Where the catalog and feedback snapshots come from
    pub catalog: CatalogConfig,
    /// IP to city mapping for the nearest strategy
    pub geo: GeoConfig,
}

/// Ranking thresholds used by the recommendation strategies
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum overall rate for an item to count as popular
    pub popular_min_rate: f64,
    /// Minimum number of ratings for an item to count as popular
    pub popular_min_votes: u32,
    /// A user rating at or above this marks the item as liked by the user
    pub personalized_min_user_rate: f64,
    /// Limit used when the caller does not pass one
    pub default_limit: usize,
    /// Upper bound for any caller-supplied limit
    pub max_limit: usize,
    /// Half-width of the window around an occasion date
    pub occasion_window_days: i64,
    /// Cap on similarity-filled slots in the personalized feed
    pub similar_fill_cap: usize,
    /// Share of the personalized limit reserved for the user's own high ratings
    pub personalized_base_share: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            popular_min_rate: 4.0,
            popular_min_votes: 5,
            personalized_min_user_rate: 4.0,
            default_limit: 20,
            max_limit: 100,
            occasion_window_days: 45,
            similar_fill_cap: 10,
            personalized_base_share: 0.6,
        }
    }
}

/// Collaborative filtering model configuration
#[derive(Debug, Clone)]
pub struct MlConfig {
    /// Whether the ML models are used at all
    pub enabled: bool,
    /// Number of latent factors
    pub factors: usize,
    /// SGD passes over the rating matrix
    pub epochs: usize,
    /// SGD learning rate
    pub learning_rate: f64,
    /// L2 regularization
    pub regularization: f64,
    /// Lower bound of the rating scale predictions are clamped to
    pub rating_min: f64,
    /// Upper bound of the rating scale predictions are clamped to
    pub rating_max: f64,
    /// Seed for factor initialisation
    pub seed: u64,
    /// Train once when the service boots
    pub train_on_startup: bool,
    /// Periodic retraining interval (None = disabled)
    pub retrain_interval: Option<Duration>,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            factors: 20,
            epochs: 20,
            learning_rate: 0.005,
            regularization: 0.02,
            rating_min: 0.0,
            rating_max: 5.0,
            seed: 42,
            train_on_startup: true,
            retrain_interval: None,
        }
    }
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Port to listen on
    pub port: u16,
    /// Host to bind to
    pub host: String,
    /// Request timeout
    pub request_timeout: Duration,
    /// Enable CORS
    pub cors_enabled: bool,
}

/// Snapshot locations
#[derive(Debug, Clone, Default)]
pub struct CatalogConfig {
    /// JSON catalog snapshot; an empty catalog is served when unset
    pub snapshot_path: Option<PathBuf>,
    /// JSON-lines feedback journal, replayed at startup and appended to
    pub feedback_path: Option<PathBuf>,
}

/// IP prefix to city id table
#[derive(Debug, Clone, Default)]
pub struct GeoConfig {
    pub ip_prefixes: Vec<(String, String)>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenv_outcome(dotenvy::dotenv())?;

        let config = Self {
            engine: EngineConfig::from_env()?,
            ml: MlConfig::from_env()?,
            api: ApiConfig::from_env()?,
            catalog: CatalogConfig::from_env(),
            geo: GeoConfig::from_env()?,
        };

        config.validate()?;
        config.log_summary();

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_limit == 0 {
            return Err(Error::InvalidConfig {
                key: "MAX_LIMIT",
                message: "max limit must be positive".into(),
            });
        }

        if self.engine.default_limit == 0 || self.engine.default_limit > self.engine.max_limit {
            return Err(Error::InvalidConfig {
                key: "DEFAULT_LIMIT",
                message: format!("default limit must be within 1..={}", self.engine.max_limit)
                    .into(),
            });
        }

        let share = self.engine.personalized_base_share;
        if !(share > 0.0 && share <= 1.0) {
            return Err(Error::InvalidConfig {
                key: "PERSONALIZED_BASE_SHARE",
                message: format!("share must be within (0, 1], got {}", share).into(),
            });
        }

        if self.ml.rating_min >= self.ml.rating_max {
            return Err(Error::InvalidConfig {
                key: "ML_RATING_MIN",
                message: "rating scale minimum must be below maximum".into(),
            });
        }

        if self.ml.factors == 0 || self.ml.epochs == 0 {
            return Err(Error::InvalidConfig {
                key: "ML_FACTORS",
                message: "factors and epochs must be positive".into(),
            });
        }

        Ok(())
    }

    /// Log configuration summary
    fn log_summary(&self) {
        info!("Configuration loaded:");
        info!("  Engine:");
        info!(
            "    Popular floor: rate >= {}, votes >= {}",
            self.engine.popular_min_rate, self.engine.popular_min_votes
        );
        info!(
            "    Limits: default {}, max {}",
            self.engine.default_limit, self.engine.max_limit
        );
        info!("  ML:");
        info!("    Enabled: {}", self.ml.enabled);
        info!(
            "    Factors: {}, epochs: {}, retrain: {:?}",
            self.ml.factors, self.ml.epochs, self.ml.retrain_interval
        );
        info!("  API:");
        info!("    Listening on: {}:{}", self.api.host, self.api.port);
        info!("  Catalog:");
        info!("    Snapshot: {:?}", self.catalog.snapshot_path);
    }
}

impl EngineConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            popular_min_rate: get_env_parsed_or("POPULAR_MIN_RATE", defaults.popular_min_rate)?,
            popular_min_votes: get_env_parsed_or("POPULAR_MIN_VOTES", defaults.popular_min_votes)?,
            personalized_min_user_rate: get_env_parsed_or(
                "PERSONALIZED_MIN_USER_RATE",
                defaults.personalized_min_user_rate,
            )?,
            default_limit: get_env_parsed_or("DEFAULT_LIMIT", defaults.default_limit)?,
            max_limit: get_env_parsed_or("MAX_LIMIT", defaults.max_limit)?,
            occasion_window_days: get_env_parsed_or(
                "OCCASION_WINDOW_DAYS",
                defaults.occasion_window_days,
            )?,
            similar_fill_cap: get_env_parsed_or("SIMILAR_FILL_CAP", defaults.similar_fill_cap)?,
            personalized_base_share: get_env_parsed_or(
                "PERSONALIZED_BASE_SHARE",
                defaults.personalized_base_share,
            )?,
        })
    }
}

impl MlConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let retrain_secs: u64 = get_env_parsed_or("ML_RETRAIN_INTERVAL_SECS", 0)?;
        Ok(Self {
            enabled: get_env_parsed_or("ML_ENABLED", defaults.enabled)?,
            factors: get_env_parsed_or("ML_FACTORS", defaults.factors)?,
            epochs: get_env_parsed_or("ML_EPOCHS", defaults.epochs)?,
            learning_rate: get_env_parsed_or("ML_LEARNING_RATE", defaults.learning_rate)?,
            regularization: get_env_parsed_or("ML_REGULARIZATION", defaults.regularization)?,
            rating_min: get_env_parsed_or("ML_RATING_MIN", defaults.rating_min)?,
            rating_max: get_env_parsed_or("ML_RATING_MAX", defaults.rating_max)?,
            seed: get_env_parsed_or("ML_SEED", defaults.seed)?,
            train_on_startup: get_env_parsed_or("ML_TRAIN_ON_STARTUP", defaults.train_on_startup)?,
            retrain_interval: (retrain_secs > 0).then(|| Duration::from_secs(retrain_secs)),
        })
    }
}

impl ApiConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            port: get_env_parsed_or("API_PORT", 8080)?,
            host: get_env_or("API_HOST", "0.0.0.0"),
            request_timeout: Duration::from_secs(get_env_parsed_or(
                "API_REQUEST_TIMEOUT_SECS",
                30,
            )?),
            cors_enabled: get_env_parsed_or("API_CORS_ENABLED", true)?,
        })
    }
}

impl CatalogConfig {
    fn from_env() -> Self {
        Self {
            snapshot_path: get_env_path("CATALOG_SNAPSHOT_PATH"),
            feedback_path: get_env_path("FEEDBACK_SNAPSHOT_PATH"),
        }
    }
}

impl GeoConfig {
    fn from_env() -> Result<Self> {
        let raw = get_env_or("CITY_IP_PREFIXES", "");
        Ok(Self {
            ip_prefixes: parse_ip_prefixes(&raw)?,
        })
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// A missing `.env` is fine, a malformed one is not
fn dotenv_outcome<T>(result: dotenvy::Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(Error::Config {
            message: "failed to load .env".into(),
            source: Some(Box::new(e)),
        }),
    }
}

/// Get environment variable with default
fn get_env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Parse an environment variable, falling back to `default` when unset.
/// A set but unparsable value is a configuration error.
fn get_env_parsed_or<T>(key: &'static str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            value.trim().parse().map_err(|e: T::Err| Error::InvalidConfig {
                key,
                message: format!("Invalid value '{}': {}", value, e).into(),
            })
        }
        _ => Ok(default),
    }
}

/// Parse `"5.160.=tehran,2.176.=shiraz"` into prefix/city pairs
fn parse_ip_prefixes(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (prefix, city) = entry.split_once('=').ok_or_else(|| Error::InvalidConfig {
                key: "CITY_IP_PREFIXES",
                message: format!("expected prefix=city, got '{}'", entry).into(),
            })?;
            Ok((prefix.trim().to_string(), city.trim().to_lowercase()))
        })
        .collect()
}
