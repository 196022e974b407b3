use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub auth_api_url: String,
    pub price_api_url: String,
    pub price_timeout_secs: u64,
    /// 0 disables the scheduler at startup; it can still be started over HTTP.
    pub auto_close_interval_minutes: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = env_map
            .get("PORT")
            .map(|s| s.as_str())
            .unwrap_or("8080")
            .parse::<u16>()
            .map_err(|_| {
                ConfigError::InvalidValue("PORT".to_string(), "must be a valid u16".to_string())
            })?;

        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let auth_api_url = env_map
            .get("AUTH_API_URL")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("AUTH_API_URL".to_string()))?;

        let price_api_url = env_map
            .get("PRICE_API_URL")
            .cloned()
            .unwrap_or_else(|| "https://api.binance.com".to_string());

        let price_timeout_secs = env_map
            .get("PRICE_TIMEOUT_SECS")
            .map(|s| s.as_str())
            .unwrap_or("3")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::InvalidValue(
                    "PRICE_TIMEOUT_SECS".to_string(),
                    "must be a valid u64".to_string(),
                )
            })?;
        if price_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "PRICE_TIMEOUT_SECS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let auto_close_interval_minutes = env_map
            .get("AUTO_CLOSE_INTERVAL_MINUTES")
            .map(|s| s.as_str())
            .unwrap_or("0")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::InvalidValue(
                    "AUTO_CLOSE_INTERVAL_MINUTES".to_string(),
                    "must be a valid u64".to_string(),
                )
            })?;

        Ok(Config {
            port,
            database_path,
            auth_api_url,
            price_api_url,
            price_timeout_secs,
            auto_close_interval_minutes,
        })
    }
}
