//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "stream.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://stream.example.com"
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

/// Federation configuration
///
/// Supplies the local actor's account name, the broadcast texts,
/// and the hashtag set advertised on go-live notes.
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Master switch; when false the federation endpoints return 404
    /// and broadcasts are refused.
    pub enabled: bool,
    /// Local actor account name (single actor per deployment)
    #[serde(default = "default_account")]
    pub account: String,
    /// Message posted to followers when a stream starts
    #[serde(default = "default_go_live_message")]
    pub go_live_message: String,
    /// Stream title included in the go-live note (set by the caller at
    /// runtime in a full deployment; configurable here)
    #[serde(default)]
    pub stream_title: String,
    /// Instance tags turned into hashtags on go-live notes
    #[serde(default)]
    pub tags: Vec<String>,
    /// Directory where preview assets (preview.gif / thumbnail.jpg) live
    pub web_root: PathBuf,
}

fn default_account() -> String {
    "streamer".to_string()
}

fn default_go_live_message() -> String {
    "I've gone live!".to_string()
}

impl FederationConfig {
    /// Canonical IRI of the local actor under a base URL.
    pub fn actor_iri(&self, base_url: &str) -> String {
        format!("{}/federation/user/{}", base_url, self.account)
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
    /// 4. Environment variables (CASTFED_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("federation.enabled", true)?
            .set_default("federation.account", "streamer")?
            .set_default("federation.go_live_message", "I've gone live!")?
            .set_default("federation.stream_title", "")?
            .set_default("federation.tags", Vec::<String>::new())?
            .set_default("federation.web_root", "webroot")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (CASTFED_*)
            .add_source(
                Environment::with_prefix("CASTFED")
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

    /// Configuration pointing at throwaway storage, for tests and local
    /// smoke runs. The listener binds an ephemeral port.
    pub fn test_defaults(data_dir: &std::path::Path) -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            database: DatabaseConfig {
                path: data_dir.join("castfed.db"),
            },
            federation: FederationConfig {
                enabled: true,
                account: default_account(),
                go_live_message: default_go_live_message(),
                stream_title: String::new(),
                tags: Vec::new(),
                web_root: data_dir.join("webroot"),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        match self.server.protocol.as_str() {
            "http" | "https" => {}
            other => {
                return Err(crate::error::AppError::Config(format!(
                    "server.protocol must be http or https, got {}",
                    other
                )));
            }
        }

        if self.federation.account.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "federation.account must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
