//! Environment-backed configuration.
//!
//! Each section is loaded from its own environment prefix
//! (`POSTGRES_HOST`, `KAFKA_ADDRESSES`, `RELAY_BATCH_SIZE`, ...). Binaries
//! load a `.env` file first, so local development needs no exported
//! variables.

use figment::providers::Env;
use figment::Figment;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db: String,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    #[serde(default = "default_max_conns")]
    pub max_conns: u32,
    #[serde(default = "default_min_conns")]
    pub min_conns: u32,
    #[serde(default = "default_max_conn_lifetime_secs")]
    pub max_conn_lifetime_secs: u64,
    #[serde(default = "default_max_conn_idle_time_secs")]
    pub max_conn_idle_time_secs: u64,
}

fn default_ssl_mode() -> String {
    "disable".to_owned()
}

fn default_max_conns() -> u32 {
    10
}

fn default_min_conns() -> u32 {
    2
}

fn default_max_conn_lifetime_secs() -> u64 {
    1800
}

fn default_max_conn_idle_time_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated broker addresses, passed to the client verbatim.
    pub addresses: String,
    #[serde(default = "default_group")]
    pub group: String,
}

fn default_group() -> String {
    "courier".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            interval_ms: default_interval_ms(),
            grace_secs: default_grace_secs(),
        }
    }
}

fn default_batch_size() -> u32 {
    100
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_grace_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_owned()
}

/// Log output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// The whole application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log: LogConfig,
    pub http: HttpConfig,
    pub postgres: PostgresConfig,
    pub kafka: KafkaConfig,
    pub relay: RelayConfig,
}

impl AppConfig {
    /// Loads every section from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            log: section("LOG_")?,
            http: section("HTTP_")?,
            postgres: section("POSTGRES_")?,
            kafka: section("KAFKA_")?,
            relay: section("RELAY_")?,
        })
    }
}

fn section<T: serde::de::DeserializeOwned>(prefix: &str) -> Result<T, ConfigError> {
    Figment::from(Env::prefixed(prefix))
        .extract()
        .map_err(|err| ConfigError::Load(Box::new(err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_section_defaults_match_the_documented_values() {
        let relay: RelayConfig = section("COURIER_TEST_EMPTY_RELAY_").unwrap();
        assert_eq!(relay.batch_size, 100);
        assert_eq!(relay.interval_ms, 1000);
        assert_eq!(relay.grace_secs, 5);
    }

    #[test]
    fn postgres_section_reads_prefixed_variables() {
        std::env::set_var("COURIER_TEST_PG_HOST", "db.internal");
        std::env::set_var("COURIER_TEST_PG_PORT", "5433");
        std::env::set_var("COURIER_TEST_PG_USER", "courier");
        std::env::set_var("COURIER_TEST_PG_PASSWORD", "secret");
        std::env::set_var("COURIER_TEST_PG_DB", "courier");
        std::env::set_var("COURIER_TEST_PG_MAX_CONNS", "32");

        let pg: PostgresConfig = section("COURIER_TEST_PG_").unwrap();
        assert_eq!(pg.host, "db.internal");
        assert_eq!(pg.port, 5433);
        assert_eq!(pg.max_conns, 32);
        assert_eq!(pg.min_conns, 2);
        assert_eq!(pg.ssl_mode, "disable");
    }

    #[test]
    fn missing_required_variables_fail_the_load() {
        let result: Result<PostgresConfig, _> = section("COURIER_TEST_MISSING_PG_");
        assert!(result.is_err());
    }

    #[test]
    fn log_section_reads_format_and_level() {
        std::env::set_var("COURIER_TEST_LOG_FORMAT", "text");
        std::env::set_var("COURIER_TEST_LOG_LEVEL", "debug");

        let log: LogConfig = section("COURIER_TEST_LOG_").unwrap();
        assert_eq!(log.format, LogFormat::Text);
        assert_eq!(log.level, "debug");
    }
}
