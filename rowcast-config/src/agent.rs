use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

const DATABASE_URL: &str = "DATABASE_URL";
const BATCH_SIZE: &str = "BATCH_SIZE";
const FETCH_INTERVAL_MS: &str = "FETCH_INTERVAL_MS";
const DEFAULT_SCHEMA_NAME: &str = "DEFAULT_SCHEMA_NAME";
const INTERNAL_SCHEMA_NAME: &str = "INTERNAL_SCHEMA_NAME";
const EVENT_LOG_TABLE_NAME: &str = "EVENT_LOG_TABLE_NAME";
const EVENTS_CONFIG_PATH: &str = "EVENTS_CONFIG_PATH";

const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_FETCH_INTERVAL_MS: u64 = 5000;
const DEFAULT_SCHEMA: &str = "public";
const DEFAULT_INTERNAL_SCHEMA: &str = "schema_pg_track_events";
const DEFAULT_EVENT_LOG_TABLE: &str = "event_log";
const DEFAULT_CONFIG_PATH: &str = "rowcast.config.yaml";

/// Process-level configuration, read from environment variables at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Connection string of the source database.
    pub database_url: String,
    /// Maximum rows claimed per tick.
    pub batch_size: usize,
    /// Delay between ticks when the log is drained.
    pub fetch_interval: Duration,
    /// Schema holding the user tables whose mutations are logged.
    pub default_schema: String,
    /// Schema holding the event-log table.
    pub internal_schema: String,
    /// Name of the event-log table.
    pub event_log_table: String,
    /// Path of the tracking document.
    pub events_config_path: PathBuf,
}

impl AgentConfig {
    pub fn from_env() -> Result<AgentConfig, ConfigError> {
        let database_url = non_empty_env(DATABASE_URL).ok_or(ConfigError::MissingRequiredEnv {
            name: DATABASE_URL.to_string(),
        })?;

        let batch_size = parsed_env(BATCH_SIZE, DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(ConfigError::InvalidEnvValue {
                name: BATCH_SIZE.to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        let fetch_interval_ms: u64 = parsed_env(FETCH_INTERVAL_MS, DEFAULT_FETCH_INTERVAL_MS)?;
        if fetch_interval_ms == 0 {
            return Err(ConfigError::InvalidEnvValue {
                name: FETCH_INTERVAL_MS.to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        Ok(AgentConfig {
            database_url,
            batch_size,
            fetch_interval: Duration::from_millis(fetch_interval_ms),
            default_schema: string_env(DEFAULT_SCHEMA_NAME, DEFAULT_SCHEMA),
            internal_schema: string_env(INTERNAL_SCHEMA_NAME, DEFAULT_INTERNAL_SCHEMA),
            event_log_table: string_env(EVENT_LOG_TABLE_NAME, DEFAULT_EVENT_LOG_TABLE),
            events_config_path: PathBuf::from(string_env(EVENTS_CONFIG_PATH, DEFAULT_CONFIG_PATH)),
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn string_env(name: &str, default: &str) -> String {
    non_empty_env(name).unwrap_or_else(|| default.to_string())
}

fn parsed_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match non_empty_env(name) {
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::InvalidEnvValue {
            name: name.to_string(),
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    /// Serializes tests that mutate process environment variables.
    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_agent_env() {
        for name in [
            DATABASE_URL,
            BATCH_SIZE,
            FETCH_INTERVAL_MS,
            DEFAULT_SCHEMA_NAME,
            INTERNAL_SCHEMA_NAME,
            EVENT_LOG_TABLE_NAME,
            EVENTS_CONFIG_PATH,
        ] {
            unsafe {
                std::env::remove_var(name);
            }
        }
    }

    #[test]
    fn defaults_apply_when_only_the_url_is_set() {
        let _guard = env_lock().lock().unwrap();
        clear_agent_env();
        unsafe {
            std::env::set_var(DATABASE_URL, "postgres://localhost/app");
        }

        let config = AgentConfig::from_env().unwrap();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.fetch_interval, Duration::from_secs(5));
        assert_eq!(config.default_schema, "public");
        assert_eq!(config.internal_schema, "schema_pg_track_events");
        assert_eq!(config.event_log_table, "event_log");
        assert_eq!(
            config.events_config_path,
            PathBuf::from("rowcast.config.yaml")
        );
    }

    #[test]
    fn missing_database_url_is_fatal() {
        let _guard = env_lock().lock().unwrap();
        clear_agent_env();

        assert!(matches!(
            AgentConfig::from_env().unwrap_err(),
            ConfigError::MissingRequiredEnv { name } if name == DATABASE_URL
        ));
    }

    #[test]
    fn invalid_numbers_are_fatal() {
        let _guard = env_lock().lock().unwrap();
        clear_agent_env();
        unsafe {
            std::env::set_var(DATABASE_URL, "postgres://localhost/app");
            std::env::set_var(BATCH_SIZE, "lots");
        }

        assert!(matches!(
            AgentConfig::from_env().unwrap_err(),
            ConfigError::InvalidEnvValue { name, .. } if name == BATCH_SIZE
        ));

        unsafe {
            std::env::set_var(BATCH_SIZE, "0");
        }
        assert!(AgentConfig::from_env().is_err());
    }

    #[test]
    fn overrides_take_effect() {
        let _guard = env_lock().lock().unwrap();
        clear_agent_env();
        unsafe {
            std::env::set_var(DATABASE_URL, "postgres://localhost/app");
            std::env::set_var(BATCH_SIZE, "250");
            std::env::set_var(FETCH_INTERVAL_MS, "750");
            std::env::set_var(INTERNAL_SCHEMA_NAME, "cdc_internal");
        }

        let config = AgentConfig::from_env().unwrap();
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.fetch_interval, Duration::from_millis(750));
        assert_eq!(config.internal_schema, "cdc_internal");
    }
}
