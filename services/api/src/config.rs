//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bedtales_core::rate_limiter::DailyLimits;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub usage_cache_path: PathBuf,
    pub log_level: Level,
    pub openai_api_key: String,
    pub story_model: String,
    pub image_model: String,
    pub sst_model: String,
    pub tts_model: String,
    pub daily_limits: DailyLimits,
    pub illustration_delay: Duration,
    pub history_sweep_interval: Duration,
    pub cors_origin: String,
}

/// Reads a variable, falling back to `default` when it is unset.
fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Reads and parses a variable, falling back to `default` when it is unset.
fn parse_var<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var_or(name, default);
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("'{}': {}", raw, e)))
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Server and Storage ---
        let bind_address: SocketAddr = parse_var("BIND_ADDRESS", "0.0.0.0:3000")?;
        let database_url = var_or("DATABASE_URL", "sqlite://bedtales.db");
        let usage_cache_path = PathBuf::from(var_or("USAGE_CACHE_PATH", "./bedtales_cache.json"));

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Provider ---
        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;
        let story_model = var_or("STORY_MODEL", "gpt-4o-mini");
        let image_model = var_or("IMAGE_MODEL", "dall-e-3");
        let sst_model = var_or("SST_MODEL", "whisper-1");
        let tts_model = var_or("TTS_MODEL", "tts-1");

        // --- Quotas and Timing ---
        let daily_limits = DailyLimits {
            create_story: parse_var("DAILY_STORY_LIMIT", "2")?,
            create_character: parse_var("DAILY_CHARACTER_LIMIT", "2")?,
        };
        let illustration_delay =
            Duration::from_millis(parse_var("ILLUSTRATION_DELAY_MS", "5000")?);
        let sweep_secs: u64 = parse_var("HISTORY_SWEEP_INTERVAL_SECS", "3600")?;
        if sweep_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "HISTORY_SWEEP_INTERVAL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        let cors_origin = var_or("CORS_ORIGIN", "http://localhost:5173");

        Ok(Self {
            bind_address,
            database_url,
            usage_cache_path,
            log_level,
            openai_api_key,
            story_model,
            image_model,
            sst_model,
            tts_model,
            daily_limits,
            illustration_delay,
            history_sweep_interval: Duration::from_secs(sweep_secs),
            cors_origin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The environment is process-wide; tests touching it take turns.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: [&str; 9] = [
        "OPENAI_API_KEY",
        "DAILY_STORY_LIMIT",
        "DAILY_CHARACTER_LIMIT",
        "BIND_ADDRESS",
        "HISTORY_SWEEP_INTERVAL_SECS",
        "ILLUSTRATION_DELAY_MS",
        "DATABASE_URL",
        "RUST_LOG",
        "CORS_ORIGIN",
    ];

    fn reset_env() {
        for name in VARS {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_defaults_apply_with_only_the_key_set() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        reset_env();
        std::env::set_var("OPENAI_API_KEY", "sk-test");

        let config = Config::from_env().unwrap();

        assert_eq!(config.bind_address.port(), 3000);
        assert_eq!(config.database_url, "sqlite://bedtales.db");
        assert_eq!(config.daily_limits, DailyLimits::default());
        assert_eq!(config.illustration_delay, Duration::from_secs(5));
        assert_eq!(config.history_sweep_interval, Duration::from_secs(3600));
        reset_env();
    }

    #[test]
    fn test_missing_key_is_reported() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        reset_env();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(name) if name == "OPENAI_API_KEY"));
    }

    #[test]
    fn test_limits_are_parsed_and_validated() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        reset_env();
        std::env::set_var("OPENAI_API_KEY", "sk-test");
        std::env::set_var("DAILY_STORY_LIMIT", "5");

        assert_eq!(Config::from_env().unwrap().daily_limits.create_story, 5);

        std::env::set_var("DAILY_CHARACTER_LIMIT", "lots");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(name, _) if name == "DAILY_CHARACTER_LIMIT"));
        reset_env();
    }
}
