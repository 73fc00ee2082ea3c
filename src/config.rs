//! Server configuration.
//!
//! Options come from an optional TOML file merged over built-in defaults,
//! then from `PATCHSSH_`-prefixed environment variables. The schema is
//! strict: unknown keys are an error.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::Error;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "PATCHSSH";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Working directory; created if missing, the process changes into it.
    pub workdir: String,
    pub server: ServerConfig,
    pub db: DbConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workdir: "work".to_string(),
            server: ServerConfig::default(),
            db: DbConfig::default(),
        }
    }
}

/// Listener and SSH transport options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address
    pub address: String,
    /// Bind port
    pub port: u16,
    /// Worker pool size
    pub workers: usize,
    /// Keepalive base; the transport keepalive is timeout - timeout/10
    #[serde(deserialize_with = "de_duration")]
    pub timeout: Duration,
    /// SSH max auth retries
    pub max_auth_tries: usize,
    /// SSH server ID string
    pub server_version: String,
    /// PEM-encoded host private key; overrides the stored key when set
    pub host_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 2222,
            workers: 3,
            timeout: Duration::from_secs(5),
            max_auth_tries: 3,
            server_version: "SSH-2.0-patchssh".to_string(),
            host_key: None,
        }
    }
}

impl ServerConfig {
    /// Transport keepalive interval derived from the configured timeout.
    pub fn keepalive_interval(&self) -> Duration {
        self.timeout - self.timeout / 10
    }
}

/// Key store location.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DbConfig {
    /// Path to the sqlite database
    pub path: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: "patchssh.db".to_string(),
        }
    }
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("config not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|err| Error::Config(err.to_string()))?;

        tracing::info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `PATCHSSH_*` environment overrides on top of the loaded values.
    pub fn apply_env(&mut self) -> Result<(), Error> {
        if let Some(workdir) = env_var("WORKDIR") {
            self.workdir = workdir;
        }
        if let Some(address) = env_var("SERVER_ADDRESS") {
            self.server.address = address;
        }
        if let Some(port) = env_var("SERVER_PORT") {
            self.server.port = parse_env("SERVER_PORT", &port)?;
        }
        if let Some(workers) = env_var("SERVER_WORKERS") {
            self.server.workers = parse_env("SERVER_WORKERS", &workers)?;
        }
        if let Some(timeout) = env_var("SERVER_TIMEOUT") {
            self.server.timeout = humantime::parse_duration(&timeout)
                .map_err(|err| Error::Config(format!("SERVER_TIMEOUT: {err}")))?;
        }
        if let Some(tries) = env_var("SERVER_MAXAUTHTRIES") {
            self.server.max_auth_tries = parse_env("SERVER_MAXAUTHTRIES", &tries)?;
        }
        if let Some(version) = env_var("SERVER_SERVERVERSION") {
            self.server.server_version = version;
        }
        if let Some(host_key) = env_var("SERVER_HOSTKEY") {
            self.server.host_key = Some(host_key);
        }
        if let Some(path) = env_var("DB_PATH") {
            self.db.path = path;
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}_{key}")).ok()
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, Error>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|err| Error::Config(format!("{key}: {err}")))
}
