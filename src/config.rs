//! # Configuration Management Module
//!
//! ## Purpose
//! Centralized configuration management for the mirror, supporting multiple
//! sources (files, environment variables, command line arguments) with
//! validation and type-safe access to all system settings.
//!
//! ## Input/Output Specification
//! - **Input**: Configuration files (TOML), environment variables, CLI args
//! - **Output**: Validated configuration structs with defaults and overrides
//! - **Validation**: Type checking, range validation
//!
//! ## Configuration Sources (in order of precedence)
//! 1. Command line arguments (highest priority)
//! 2. Environment variables
//! 3. Configuration files
//! 4. Default values (lowest priority)
//!
//! ## Usage
//! ```rust,no_run
//! use anidb_mirror::config::Config;
//!
//! let config = Config::from_file("config.toml").unwrap();
//! println!("Daily limit: {}", config.fetcher.daily_limit);
//! ```

use crate::errors::{MirrorError, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure containing all system settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// AniDB HTTP API client settings
    pub upstream: UpstreamConfig,
    /// Fetch pacing, quota, retry, and staleness settings
    pub fetcher: FetcherConfig,
    /// Storage and database settings
    pub storage: StorageConfig,
    /// Tag search behavior
    pub search: SearchConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// AniDB HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// API base URL
    pub base_url: String,
    /// Registered AniDB client name
    pub client: String,
    /// Registered client version
    pub clientver: String,
    /// HTTP API protocol version
    pub protover: String,
    /// AniDB account for mature-content access (optional)
    pub username: Option<String>,
    /// AniDB password for mature-content access (optional)
    pub password: Option<String>,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

/// Fetch worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Maximum upstream calls per UTC day
    pub daily_limit: u32,
    /// Minimum spacing between consecutive upstream calls in seconds
    pub throttle_seconds: u64,
    /// Maximum fetch attempts per identifier before negative-caching
    pub max_attempts: u32,
    /// Base delay for exponential backoff in seconds
    pub backoff_base_seconds: u64,
    /// Upper bound on a single backoff delay in seconds
    pub backoff_cap_seconds: u64,
    /// Age beyond which a cached record is considered stale, in days
    pub staleness_threshold_days: i64,
    /// Negative-cache lifetime for confirmed-missing identifiers, in days
    pub not_found_ttl_days: i64,
    /// Negative-cache lifetime after exhausted retries, in hours
    pub retry_exhausted_ttl_hours: i64,
    /// Interval between periodic reconciliation passes, in hours
    pub reconcile_interval_hours: u64,
}

impl FetcherConfig {
    /// Staleness threshold as a chrono duration.
    pub fn staleness_threshold(&self) -> Duration {
        Duration::days(self.staleness_threshold_days)
    }

    /// Negative-cache lifetime for a confirmed-missing identifier.
    pub fn not_found_ttl(&self) -> Duration {
        Duration::days(self.not_found_ttl_days)
    }

    /// Negative-cache lifetime after the attempt budget is exhausted.
    pub fn retry_exhausted_ttl(&self) -> Duration {
        Duration::hours(self.retry_exhausted_ttl_hours)
    }
}

/// Storage and database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database directory path
    pub db_path: PathBuf,
    /// Gzip-compress raw documents on write
    pub enable_compression: bool,
}

/// Tag search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Minimum tag weight for a tag to count as a match
    pub min_tag_weight: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable structured JSON logging
    pub json_format: bool,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }

    /// Load configuration from a specific file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| MirrorError::Config {
                message: format!("Failed to read config file {:?}: {}", path, e),
            })?;
            toml::from_str(&content).map_err(|e| MirrorError::Config {
                message: format!("Failed to parse config file {:?}: {}", path, e),
            })?
        } else {
            tracing::warn!("Configuration file not found: {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Variable names follow the original service's deployment contract.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(db_path) = std::env::var("DB_PATH") {
            self.storage.db_path = PathBuf::from(db_path);
        }
        if let Ok(client) = std::env::var("ANIDB_CLIENT") {
            self.upstream.client = client;
        }
        if let Ok(clientver) = std::env::var("ANIDB_VERSION") {
            self.upstream.clientver = clientver;
        }
        if let Ok(protover) = std::env::var("ANIDB_PROTO_VER") {
            self.upstream.protover = protover;
        }
        if let Ok(username) = std::env::var("ANIDB_USERNAME") {
            if !username.is_empty() {
                self.upstream.username = Some(username);
            }
        }
        if let Ok(password) = std::env::var("ANIDB_PASSWORD") {
            if !password.is_empty() {
                self.upstream.password = Some(password);
            }
        }
        if let Ok(limit) = std::env::var("DAILY_LIMIT") {
            self.fetcher.daily_limit = limit.parse().map_err(|_| MirrorError::Config {
                message: "Invalid integer in DAILY_LIMIT".to_string(),
            })?;
        }
        if let Ok(throttle) = std::env::var("THROTTLE_SECONDS") {
            self.fetcher.throttle_seconds = throttle.parse().map_err(|_| MirrorError::Config {
                message: "Invalid integer in THROTTLE_SECONDS".to_string(),
            })?;
        }
        if let Ok(days) = std::env::var("UPDATE_THRESHOLD_DAYS") {
            self.fetcher.staleness_threshold_days =
                days.parse().map_err(|_| MirrorError::Config {
                    message: "Invalid integer in UPDATE_THRESHOLD_DAYS".to_string(),
                })?;
        }

        Ok(())
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.upstream.base_url.is_empty() {
            return Err(MirrorError::ValidationFailed {
                field: "upstream.base_url".to_string(),
                reason: "Base URL cannot be empty".to_string(),
            });
        }

        if self.upstream.client.is_empty() {
            return Err(MirrorError::ValidationFailed {
                field: "upstream.client".to_string(),
                reason: "AniDB client name cannot be empty".to_string(),
            });
        }

        if self.fetcher.daily_limit == 0 {
            return Err(MirrorError::ValidationFailed {
                field: "fetcher.daily_limit".to_string(),
                reason: "Daily limit must be greater than zero".to_string(),
            });
        }

        if self.fetcher.max_attempts == 0 {
            return Err(MirrorError::ValidationFailed {
                field: "fetcher.max_attempts".to_string(),
                reason: "Max attempts must be greater than zero".to_string(),
            });
        }

        if self.fetcher.staleness_threshold_days <= 0 {
            return Err(MirrorError::ValidationFailed {
                field: "fetcher.staleness_threshold_days".to_string(),
                reason: "Staleness threshold must be at least one day".to_string(),
            });
        }

        if self.fetcher.backoff_cap_seconds < self.fetcher.backoff_base_seconds {
            return Err(MirrorError::ValidationFailed {
                field: "fetcher.backoff_cap_seconds".to_string(),
                reason: "Backoff cap cannot be below the base delay".to_string(),
            });
        }

        Ok(())
    }

    /// Get configuration as TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| MirrorError::Config {
            message: format!("Failed to serialize config to TOML: {}", e),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig {
                base_url: "http://api.anidb.net:9001/httpapi".to_string(),
                client: "kometa".to_string(),
                clientver: "1".to_string(),
                protover: "1".to_string(),
                username: None,
                password: None,
                timeout_seconds: 30,
            },
            fetcher: FetcherConfig {
                daily_limit: 200,
                throttle_seconds: 4,
                max_attempts: 3,
                backoff_base_seconds: 60,
                backoff_cap_seconds: 3600,
                staleness_threshold_days: 14,
                not_found_ttl_days: 30,
                retry_exhausted_ttl_hours: 24,
                reconcile_interval_hours: 6,
            },
            storage: StorageConfig {
                db_path: PathBuf::from("./data/anidb_mirror.db"),
                enable_compression: true,
            },
            search: SearchConfig { min_tag_weight: 200 },
            logging: LoggingConfig {
                level: "info".to_string(),
                json_format: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fetcher.daily_limit, 200);
        assert_eq!(config.fetcher.throttle_seconds, 4);
    }

    #[test]
    fn test_rejects_zero_daily_limit() {
        let mut config = Config::default();
        config.fetcher.daily_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_backoff_cap_below_base() {
        let mut config = Config::default();
        config.fetcher.backoff_base_seconds = 120;
        config.fetcher.backoff_cap_seconds = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_toml_round_trip() {
        let config = Config::default();
        let toml_text = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&toml_text).unwrap();
        assert_eq!(parsed.fetcher.daily_limit, config.fetcher.daily_limit);
        assert_eq!(parsed.upstream.base_url, config.upstream.base_url);
    }
}
