use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cache::keys;

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub redis_url: Option<String>,
    pub topics: String,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub lease: LeaseConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let redis_url = std::env::var("REDIS_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        let topics = std::env::var("ROSTER_TOPICS").unwrap_or_default();

        let sync = SyncConfig::from_env();
        let lease = LeaseConfig::from_env(sync.operation_timeout);

        Ok(Self {
            logging: LoggingConfig::from_env(),
            redis_url,
            topics,
            store: StoreConfig::from_env()?,
            sync,
            lease,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file_logs: bool,
    pub log_dir: PathBuf,
}

impl LoggingConfig {
    fn from_env() -> Self {
        let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let file_logs = env_bool("ENABLE_FILE_LOGS", false);
        let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());

        Self {
            level,
            file_logs,
            log_dir: PathBuf::from(log_dir),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    File,
    Sqlite,
}

impl StoreBackend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "file" => Some(Self::File),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl StoreConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("ROSTER_STORE") {
            Ok(raw) => StoreBackend::parse(raw.trim()).ok_or(ConfigError::Invalid {
                key: "ROSTER_STORE",
                value: raw,
            })?,
            Err(_) => StoreBackend::File,
        };
        let path = std::env::var("ROSTER_STORE_PATH").unwrap_or_else(|_| "./data".to_string());

        Ok(Self {
            backend,
            path: PathBuf::from(path),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub cache_key: String,
    pub snapshot_name: String,
    pub operation_timeout: Duration,
    pub max_convergence_attempts: u32,
    pub refresh_on_recovery: bool,
}

impl SyncConfig {
    fn from_env() -> Self {
        let cache_key =
            std::env::var("ROSTER_CACHE_KEY").unwrap_or_else(|_| keys::SNAPSHOT_KEY.to_string());
        let snapshot_name = std::env::var("ROSTER_SNAPSHOT_NAME")
            .unwrap_or_else(|_| keys::durable_snapshot_name().to_string());
        let operation_timeout_ms = env_u64("ROSTER_OPERATION_TIMEOUT_MS", 10_000);
        let max_convergence_attempts = env_u32("ROSTER_CONVERGENCE_MAX_ATTEMPTS", 5).max(1);
        let refresh_on_recovery = env_bool("ROSTER_REFRESH_ON_RECOVERY", true);

        Self {
            cache_key,
            snapshot_name,
            operation_timeout: Duration::from_millis(operation_timeout_ms.max(1)),
            max_convergence_attempts,
            refresh_on_recovery,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_key: keys::SNAPSHOT_KEY.to_string(),
            snapshot_name: keys::durable_snapshot_name().to_string(),
            operation_timeout: Duration::from_secs(10),
            max_convergence_attempts: 5,
            refresh_on_recovery: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub key: String,
    pub ttl: Duration,
    pub poll_interval: Duration,
}

impl LeaseConfig {
    /// The TTL is raised to twice the operation timeout so a holder still
    /// inside its deadline cannot see the key expire under it.
    fn from_env(operation_timeout: Duration) -> Self {
        let key = std::env::var("ROSTER_LOCK_KEY").unwrap_or_else(|_| keys::LOCK_KEY.to_string());
        let ttl_ms = env_u64("ROSTER_LOCK_TTL_MS", 30_000);
        let poll_ms = env_u64("ROSTER_LOCK_POLL_MS", 25);

        Self {
            key,
            ttl: Duration::from_millis(ttl_ms).max(operation_timeout * 2),
            poll_interval: Duration::from_millis(poll_ms.max(1)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}
