//! Service configuration.
//!
//! Loaded from a TOML file when `KINLINK_CONFIG` names one, otherwise from
//! environment variables (a `.env` file is honoured). Every field has a default.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub pairing: PairingConfig,

    #[serde(default)]
    pub calls: CallConfig,

    #[serde(default)]
    pub presence: PresenceConfig,

    #[serde(default)]
    pub push: PushConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite://kinlink.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    16
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Number of digits in a pairing code, 4 to 6.
    #[serde(default = "default_code_digits")]
    pub code_digits: u32,

    #[serde(default = "default_code_ttl")]
    pub code_ttl_seconds: u64,

    /// How often expired codes are dropped from memory and the store.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_code_digits() -> u32 {
    6
}

fn default_code_ttl() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            code_digits: default_code_digits(),
            code_ttl_seconds: default_code_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

impl PairingConfig {
    pub fn digits(&self) -> u32 {
        self.code_digits.clamp(4, 6)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    #[serde(default = "default_ring_timeout")]
    pub ring_timeout_seconds: u64,
}

fn default_ring_timeout() -> u64 {
    45
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_seconds: default_ring_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// A user seen within this window is reported online.
    #[serde(default = "default_online_window")]
    pub online_window_seconds: u64,
}

fn default_online_window() -> u64 {
    300
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            online_window_seconds: default_online_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Push gateway URL. Push is disabled when unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub server_key: Option<String>,

    #[serde(default = "default_push_timeout")]
    pub timeout_seconds: u64,
}

fn default_push_timeout() -> u64 {
    10
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            server_key: None,
            timeout_seconds: default_push_timeout(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = dotenv::var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable setting"),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(host) = dotenv::var("KINLINK_HOST") {
            config.server.host = host;
        }
        env_parse("KINLINK_PORT", &mut config.server.port);

        if let Ok(url) = dotenv::var("DATABASE_URL") {
            config.database.url = url;
        }
        env_parse("KINLINK_DB_MAX_CONNECTIONS", &mut config.database.max_connections);

        env_parse("KINLINK_CODE_DIGITS", &mut config.pairing.code_digits);
        env_parse("KINLINK_CODE_TTL", &mut config.pairing.code_ttl_seconds);
        env_parse("KINLINK_SWEEP_INTERVAL", &mut config.pairing.sweep_interval_seconds);

        env_parse("KINLINK_RING_TIMEOUT", &mut config.calls.ring_timeout_seconds);
        env_parse("KINLINK_ONLINE_WINDOW", &mut config.presence.online_window_seconds);

        config.push.endpoint = dotenv::var("KINLINK_PUSH_ENDPOINT").ok();
        config.push.server_key = dotenv::var("KINLINK_PUSH_KEY").ok();
        env_parse("KINLINK_PUSH_TIMEOUT", &mut config.push.timeout_seconds);

        config
    }

    /// File if `path` exists, environment otherwise.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
        }
        Ok(Self::from_env())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
