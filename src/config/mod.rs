//! Configuration management
//!
//! This module handles loading and parsing configuration for the Tandem session service.
//! Configuration can be loaded from:
//! - config.yml file
//! - Environment variables (override file settings)
//!
//! Missing optional values are filled with sensible defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration (persistent session store)
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Cache configuration (ephemeral session store)
    #[serde(default)]
    pub cache: CacheConfig,
    /// Session lifecycle configuration
    #[serde(default)]
    pub session: SessionConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS allowed origin (for cookie-based auth)
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    /// Take the client address from X-Forwarded-For / X-Real-IP.
    /// Only enable behind a reverse proxy that overwrites these headers.
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origin: default_cors_origin(),
            trust_proxy_headers: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cors_origin() -> String {
    "http://localhost:3000".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database driver (sqlite or mysql)
    #[serde(default)]
    pub driver: DatabaseDriver,
    /// Database connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: DatabaseDriver::default(),
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "data/tandem.db".to_string()
}

/// Database driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// SQLite (default)
    #[default]
    Sqlite,
    /// MySQL
    Mysql,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache driver (memory or redis)
    #[serde(default)]
    pub driver: CacheDriver,
    /// Redis connection URL (optional)
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Upper bound for entry lifetime in seconds
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
    /// Maximum number of entries held by the in-memory driver
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            driver: CacheDriver::default(),
            redis_url: None,
            ttl_seconds: default_cache_ttl(),
            max_capacity: default_max_capacity(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_max_capacity() -> u64 {
    100_000
}

/// Cache driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheDriver {
    /// In-memory cache (default)
    #[default]
    Memory,
    /// Redis cache
    Redis,
}

/// Session lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Name of the session cookie
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Add the `Secure` attribute to the session cookie
    #[serde(default)]
    pub cookie_secure: bool,
    /// Lifetime of an ephemeral session entry, refreshed on every write
    #[serde(default = "default_session_ttl")]
    pub ttl_seconds: u64,
    /// Absolute lifetime of a session measured from sign-in
    #[serde(default = "default_max_lifetime_days")]
    pub max_lifetime_days: i64,
    /// Lifetime of a session lock if its holder never releases it
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_seconds: u64,
    /// How long `resume` waits for a held lock
    #[serde(default = "default_lock_wait")]
    pub lock_wait_ms: u64,
    /// Poll interval while waiting for a held lock
    #[serde(default = "default_lock_poll")]
    pub lock_poll_ms: u64,
    /// Keep the anonymous CSRF token when the session authenticates
    #[serde(default)]
    pub carry_csrf_on_login: bool,
    /// Interval of the background purge of sessions past their max lifetime
    #[serde(default = "default_purge_interval")]
    pub purge_interval_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            cookie_secure: false,
            ttl_seconds: default_session_ttl(),
            max_lifetime_days: default_max_lifetime_days(),
            lock_ttl_seconds: default_lock_ttl(),
            lock_wait_ms: default_lock_wait(),
            lock_poll_ms: default_lock_poll(),
            carry_csrf_on_login: false,
            purge_interval_seconds: default_purge_interval(),
        }
    }
}

fn default_cookie_name() -> String {
    "TANDEMSESSID".to_string()
}

fn default_session_ttl() -> u64 {
    1440
}

fn default_max_lifetime_days() -> i64 {
    30
}

fn default_lock_ttl() -> u64 {
    30
}

fn default_lock_wait() -> u64 {
    10_000
}

fn default_lock_poll() -> u64 {
    25
}

fn default_purge_interval() -> u64 {
    3600
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms.max(1))
    }

    pub fn max_lifetime(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_lifetime_days.clamp(1, MAX_LIFETIME_DAYS))
    }

    /// Validate values that would make the session lifecycle unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cookie_name.is_empty()
            || self
                .cookie_name
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        {
            return Err(ConfigError::ValidationError(format!(
                "session.cookie_name '{}' must be non-empty and contain only [A-Za-z0-9_-]",
                self.cookie_name
            )));
        }
        if self.ttl_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "session.ttl_seconds must be greater than zero".to_string(),
            ));
        }
        if self.lock_ttl_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "session.lock_ttl_seconds must be greater than zero".to_string(),
            ));
        }
        if self.max_lifetime_days <= 0 || self.max_lifetime_days > MAX_LIFETIME_DAYS {
            return Err(ConfigError::ValidationError(format!(
                "session.max_lifetime_days must be between 1 and {}",
                MAX_LIFETIME_DAYS
            )));
        }
        Ok(())
    }
}

/// Upper bound for `session.max_lifetime_days` (about a century)
pub const MAX_LIFETIME_DAYS: i64 = 36_500;

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {message}")]
    ParseError {
        path: String,
        message: String,
    },
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl Config {
    /// Load configuration from file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// If the file exists but is invalid YAML, returns an error with details.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::ParseError {
                path: path.display().to_string(),
                message: format_yaml_error(&e),
            }
        })?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the session settings and their fit inside the cache
    ///
    /// Cache entries never outlive `cache.ttl_seconds`, so a session entry
    /// plus the lock that may still be writing it back must fit under it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;

        let needed = self
            .session
            .ttl_seconds
            .saturating_add(self.session.lock_ttl_seconds);
        if needed > self.cache.ttl_seconds {
            return Err(ConfigError::ValidationError(format!(
                "cache.ttl_seconds ({}) must be at least session.ttl_seconds + session.lock_ttl_seconds ({})",
                self.cache.ttl_seconds, needed
            )));
        }
        Ok(())
    }

    /// Load configuration from file with environment variable overrides
    ///
    /// Environment variables follow the pattern:
    /// - TANDEM_SERVER_HOST / TANDEM_SERVER_PORT / TANDEM_SERVER_CORS_ORIGIN
    /// - TANDEM_SERVER_TRUST_PROXY_HEADERS
    /// - TANDEM_DATABASE_DRIVER / TANDEM_DATABASE_URL
    /// - TANDEM_CACHE_DRIVER / TANDEM_CACHE_REDIS_URL / TANDEM_CACHE_TTL_SECONDS
    /// - TANDEM_SESSION_COOKIE_NAME / TANDEM_SESSION_COOKIE_SECURE
    /// - TANDEM_SESSION_TTL_SECONDS / TANDEM_SESSION_MAX_LIFETIME_DAYS
    /// - TANDEM_SESSION_LOCK_TTL_SECONDS / TANDEM_SESSION_LOCK_WAIT_MS
    pub fn load_with_env(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    fn apply_env_overrides(&mut self) {
        // Server configuration
        if let Ok(host) = std::env::var("TANDEM_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse::<u16>("TANDEM_SERVER_PORT") {
            self.server.port = port;
        }
        if let Ok(cors_origin) = std::env::var("TANDEM_SERVER_CORS_ORIGIN") {
            self.server.cors_origin = cors_origin;
        }
        if let Some(trust) = env_parse::<bool>("TANDEM_SERVER_TRUST_PROXY_HEADERS") {
            self.server.trust_proxy_headers = trust;
        }

        // Database configuration
        if let Ok(driver) = std::env::var("TANDEM_DATABASE_DRIVER") {
            match driver.to_lowercase().as_str() {
                "sqlite" => self.database.driver = DatabaseDriver::Sqlite,
                "mysql" => self.database.driver = DatabaseDriver::Mysql,
                _ => {} // Ignore invalid values
            }
        }
        if let Ok(url) = std::env::var("TANDEM_DATABASE_URL") {
            self.database.url = url;
        }

        // Cache configuration
        if let Ok(driver) = std::env::var("TANDEM_CACHE_DRIVER") {
            match driver.to_lowercase().as_str() {
                "memory" => self.cache.driver = CacheDriver::Memory,
                "redis" => self.cache.driver = CacheDriver::Redis,
                _ => {} // Ignore invalid values
            }
        }
        if let Ok(redis_url) = std::env::var("TANDEM_CACHE_REDIS_URL") {
            self.cache.redis_url = Some(redis_url);
        }
        if let Some(ttl) = env_parse::<u64>("TANDEM_CACHE_TTL_SECONDS") {
            self.cache.ttl_seconds = ttl;
        }

        // Session configuration
        if let Ok(name) = std::env::var("TANDEM_SESSION_COOKIE_NAME") {
            self.session.cookie_name = name;
        }
        if let Some(secure) = env_parse::<bool>("TANDEM_SESSION_COOKIE_SECURE") {
            self.session.cookie_secure = secure;
        }
        if let Some(ttl) = env_parse::<u64>("TANDEM_SESSION_TTL_SECONDS") {
            self.session.ttl_seconds = ttl;
        }
        if let Some(days) = env_parse::<i64>("TANDEM_SESSION_MAX_LIFETIME_DAYS") {
            self.session.max_lifetime_days = days;
        }
        if let Some(ttl) = env_parse::<u64>("TANDEM_SESSION_LOCK_TTL_SECONDS") {
            self.session.lock_ttl_seconds = ttl;
        }
        if let Some(wait) = env_parse::<u64>("TANDEM_SESSION_LOCK_WAIT_MS") {
            self.session.lock_wait_ms = wait;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

/// Format YAML parsing error with location and context
fn format_yaml_error(e: &serde_yaml::Error) -> String {
    if let Some(location) = e.location() {
        format!(
            "at line {}, column {}: {}",
            location.line(),
            location.column(),
            e
        )
    } else {
        e.to_string()
    }
}

// Shared mutex for all config tests that modify environment variables.
#[cfg(test)]
static CONFIG_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
const ENV_KEYS: &[&str] = &[
    "TANDEM_SERVER_HOST",
    "TANDEM_SERVER_PORT",
    "TANDEM_SERVER_CORS_ORIGIN",
    "TANDEM_SERVER_TRUST_PROXY_HEADERS",
    "TANDEM_DATABASE_DRIVER",
    "TANDEM_DATABASE_URL",
    "TANDEM_CACHE_DRIVER",
    "TANDEM_CACHE_REDIS_URL",
    "TANDEM_CACHE_TTL_SECONDS",
    "TANDEM_SESSION_COOKIE_NAME",
    "TANDEM_SESSION_COOKIE_SECURE",
    "TANDEM_SESSION_TTL_SECONDS",
    "TANDEM_SESSION_MAX_LIFETIME_DAYS",
    "TANDEM_SESSION_LOCK_TTL_SECONDS",
    "TANDEM_SESSION_LOCK_WAIT_MS",
];
