//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// ActivityStreams namespace every federated document must declare
pub const ACTIVITYSTREAMS_NAMESPACE: &str = "https://www.w3.org/ns/activitystreams";

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Outbound federation settings
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// User-Agent sent on every resolve fetch
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Optional egress proxy for resolve fetches
    pub proxy: Option<String>,
    /// Timeout for a single resolve fetch (default: 10)
    #[serde(default = "default_resolve_timeout_seconds")]
    pub resolve_timeout_seconds: u64,
    /// Namespace required in the `@context` of fetched documents
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Permit resolve fetches to loopback and private addresses
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            proxy: None,
            resolve_timeout_seconds: default_resolve_timeout_seconds(),
            namespace: default_namespace(),
            allow_private_hosts: false,
        }
    }
}

impl FederationConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_seconds)
    }
}

fn default_user_agent() -> String {
    format!("Fedicore/{}", env!("CARGO_PKG_VERSION"))
}

fn default_resolve_timeout_seconds() -> u64 {
    10
}

fn default_namespace() -> String {
    ACTIVITYSTREAMS_NAMESPACE.to_string()
}

/// Inbox job queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Number of concurrent inbox workers
    pub workers: usize,
    /// Channel capacity before the edge starts waiting
    pub capacity: usize,
    /// Attempts per delivery before it is given up
    pub max_attempts: u32,
    /// First retry delay in milliseconds, doubled per attempt
    pub base_backoff_ms: u64,
    /// Upper bound for the retry delay
    pub max_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: 1024,
            max_attempts: 8,
            base_backoff_ms: 1000,
            max_backoff_ms: 300_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDICORE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("federation.resolve_timeout_seconds", 10)?
            .set_default("federation.namespace", ACTIVITYSTREAMS_NAMESPACE)?
            .set_default("federation.user_agent", default_user_agent())?
            .set_default("federation.allow_private_hosts", false)?
            .set_default("queue.workers", 4)?
            .set_default("queue.capacity", 1024)?
            .set_default("queue.max_attempts", 8)?
            .set_default("queue.base_backoff_ms", 1000)?
            .set_default("queue.max_backoff_ms", 300_000)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDICORE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.queue.workers == 0 {
            return Err(crate::error::AppError::Config(
                "queue.workers must be greater than 0".to_string(),
            ));
        }

        if self.queue.max_attempts == 0 {
            return Err(crate::error::AppError::Config(
                "queue.max_attempts must be greater than 0".to_string(),
            ));
        }

        if let Some(proxy) = self.federation.proxy.as_deref() {
            url::Url::parse(proxy).map_err(|e| {
                crate::error::AppError::Config(format!("federation.proxy is not a URL: {}", e))
            })?;
        }

        if is_local_server_domain(&self.server.domain) {
            tracing::warn!(
                domain = %self.server.domain,
                protocol = %self.server.protocol,
                "Serving federation endpoints from a local domain"
            );
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/fedicore-test.db"),
            },
            federation: FederationConfig::default(),
            queue: QueueConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_http_on_localhost() {
        let config = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_http_for_non_local_domain() {
        let mut config = valid_config();
        config.server.domain = "social.example.com".to_string();

        let error = config
            .validate()
            .expect_err("public domains must require https");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("server.protocol must be https")
        ));
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = valid_config();
        config.queue.workers = 0;

        assert!(matches!(
            config.validate(),
            Err(crate::error::AppError::Config(message)) if message.contains("queue.workers")
        ));
    }

    #[test]
    fn validate_rejects_unparseable_proxy() {
        let mut config = valid_config();
        config.federation.proxy = Some("not a url".to_string());

        assert!(matches!(
            config.validate(),
            Err(crate::error::AppError::Config(message)) if message.contains("federation.proxy")
        ));
    }

    #[test]
    fn federation_defaults_match_protocol_expectations() {
        let federation = FederationConfig::default();
        assert_eq!(federation.namespace, ACTIVITYSTREAMS_NAMESPACE);
        assert_eq!(federation.resolve_timeout(), Duration::from_secs(10));
        assert!(federation.user_agent.starts_with("Fedicore/"));
    }
}
