//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

/// Ten years; keeps the edit window well inside `chrono::Duration` range
const MAX_RATING_EDIT_WINDOW_DAYS: i64 = 3650;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL; the in-memory store is used when absent
    pub database_url: Option<String>,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    /// HS256 secret for bearer tokens
    pub jwt_secret: String,

    /// Shared secret for payment signatures
    pub payment_key_secret: String,

    /// Attempts per optimistic read-modify-write
    pub cas_max_retries: u32,

    /// Transactions kept per wallet
    pub wallet_log_cap: usize,

    /// Days a client may edit a rating
    pub rating_edit_window_days: i64,

    /// Require stage N-1 approved before stage N
    pub enforce_stage_order: bool,

    /// Availability outbox drain interval
    pub availability_sync_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let database_max_connections = parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?;

        let host = lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string());

        let port = parse_or(&lookup, "PORT", 3000)?;

        let environment = lookup("ENVIRONMENT").unwrap_or_else(|| "development".to_string());

        let jwt_secret = lookup("JWT_SECRET").ok_or(ConfigError::MissingEnv("JWT_SECRET"))?;

        let payment_key_secret =
            lookup("PAYMENT_KEY_SECRET").ok_or(ConfigError::MissingEnv("PAYMENT_KEY_SECRET"))?;

        let cas_max_retries: u32 = parse_or(&lookup, "CAS_MAX_RETRIES", 5)?;
        if cas_max_retries == 0 {
            return Err(ConfigError::InvalidValue("CAS_MAX_RETRIES"));
        }

        let wallet_log_cap: usize = parse_or(&lookup, "WALLET_LOG_CAP", 100)?;
        if wallet_log_cap == 0 {
            return Err(ConfigError::InvalidValue("WALLET_LOG_CAP"));
        }

        let rating_edit_window_days: i64 = parse_or(&lookup, "RATING_EDIT_WINDOW_DAYS", 7)?;
        if !(0..=MAX_RATING_EDIT_WINDOW_DAYS).contains(&rating_edit_window_days) {
            return Err(ConfigError::InvalidValue("RATING_EDIT_WINDOW_DAYS"));
        }

        let enforce_stage_order = parse_or(&lookup, "ENFORCE_STAGE_ORDER", false)?;

        let availability_sync_interval_secs =
            parse_or(&lookup, "AVAILABILITY_SYNC_INTERVAL_SECS", 30)?;

        Ok(Self {
            database_url,
            database_max_connections,
            host,
            port,
            environment,
            jwt_secret,
            payment_key_secret,
            cas_max_retries,
            wallet_log_cap,
            rating_edit_window_days,
            enforce_stage_order,
            availability_sync_interval_secs,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Tunables the engine itself needs
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_retries: self.cas_max_retries,
            wallet_log_cap: self.wallet_log_cap,
            rating_edit_window: chrono::Duration::days(self.rating_edit_window_days),
            enforce_stage_order: self.enforce_stage_order,
            availability_sync_interval: Duration::from_secs(self.availability_sync_interval_secs),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue(key)),
        None => Ok(default),
    }
}

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_retries: u32,
    pub wallet_log_cap: usize,
    pub rating_edit_window: chrono::Duration,
    pub enforce_stage_order: bool,
    pub availability_sync_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            wallet_log_cap: 100,
            rating_edit_window: chrono::Duration::days(7),
            enforce_stage_order: false,
            availability_sync_interval: Duration::from_secs(30),
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const SECRETS: [(&str, &str); 2] = [("JWT_SECRET", "jwt"), ("PAYMENT_KEY_SECRET", "pay")];

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&SECRETS)).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.port, 3000);

        let settings = config.engine_settings();
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.wallet_log_cap, 100);
        assert_eq!(settings.rating_edit_window, chrono::Duration::days(7));
        assert!(!settings.enforce_stage_order);
    }

    #[test]
    fn test_missing_secret() {
        let err = Config::from_lookup(lookup(&[("JWT_SECRET", "jwt")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("PAYMENT_KEY_SECRET")));
    }

    #[test]
    fn test_invalid_values() {
        let mut pairs = SECRETS.to_vec();
        pairs.push(("CAS_MAX_RETRIES", "0"));
        assert!(matches!(
            Config::from_lookup(lookup(&pairs)),
            Err(ConfigError::InvalidValue("CAS_MAX_RETRIES"))
        ));

        for days in ["-1", "3651", "9223372036854775807"] {
            let mut pairs = SECRETS.to_vec();
            pairs.push(("RATING_EDIT_WINDOW_DAYS", days));
            assert!(matches!(
                Config::from_lookup(lookup(&pairs)),
                Err(ConfigError::InvalidValue("RATING_EDIT_WINDOW_DAYS"))
            ));
        }

        let mut pairs = SECRETS.to_vec();
        pairs.push(("ENFORCE_STAGE_ORDER", "maybe"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn test_overrides() {
        let mut pairs = SECRETS.to_vec();
        pairs.extend([
            ("DATABASE_URL", "postgres://localhost/care"),
            ("ENFORCE_STAGE_ORDER", "true"),
            ("WALLET_LOG_CAP", "20"),
        ]);
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/care"));
        assert!(config.enforce_stage_order);
        assert_eq!(config.wallet_log_cap, 20);
    }
}
