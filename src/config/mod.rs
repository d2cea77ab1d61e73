use crate::platform::Platform;
use crate::secret::Secret;
use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Longest background task interval accepted (one day)
const MAX_INTERVAL_SECONDS: u64 = 86_400;

/// Longest state lifetime or refresh buffer accepted (30 days)
const MAX_WINDOW_SECONDS: i64 = 30 * 86_400;

/// Complete postpilot configuration.
///
/// Loaded from `postpilot.toml` (every section optional), then overlaid with
/// `POSTPILOT_*` environment variables. The encryption key is only ever read
/// from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub providers: BTreeMap<Platform, ProviderSettings>,
    /// Base64-encoded 32-byte master key (`POSTPILOT_ENCRYPTION_KEY`)
    #[serde(skip)]
    pub encryption_key: Option<Secret>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Public base URL providers redirect back to
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    /// Dashboard connections view the callback redirects to
    #[serde(default = "default_connections_url")]
    pub connections_url: String,
    /// Require `Authorization: Bearer <user>`; otherwise everything runs as "default"
    #[serde(default)]
    pub auth_enabled: bool,
    /// Allowed CORS origins (empty = permissive)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_callback_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_connections_url() -> String {
    "http://localhost:3001/dashboard/connections".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            callback_base_url: default_callback_base_url(),
            connections_url: default_connections_url(),
            auth_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}

/// Credential database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "postpilot.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Where pending OAuth states live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Single process only
    Memory,
    /// Shared credential database (safe behind a load balancer)
    Sqlite,
}

/// OAuth state (CSRF correlation) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_lifetime")]
    pub lifetime_seconds: i64,
    #[serde(default = "default_state_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_state_backend")]
    pub backend: StateBackend,
}

fn default_state_lifetime() -> i64 {
    600
}

fn default_state_cleanup_interval() -> u64 {
    60
}

fn default_state_backend() -> StateBackend {
    StateBackend::Sqlite
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            lifetime_seconds: default_state_lifetime(),
            cleanup_interval_seconds: default_state_cleanup_interval(),
            backend: default_state_backend(),
        }
    }
}

/// Token endpoint client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

/// Background refresh scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_refresh_enabled")]
    pub enabled: bool,
    #[serde(default = "default_refresh_interval")]
    pub interval_seconds: u64,
    /// Refresh when less than this much lifetime remains
    #[serde(default = "default_refresh_buffer")]
    pub buffer_seconds: i64,
}

fn default_refresh_enabled() -> bool {
    true
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_refresh_buffer() -> i64 {
    300
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: default_refresh_enabled(),
            interval_seconds: default_refresh_interval(),
            buffer_seconds: default_refresh_buffer(),
        }
    }
}

/// Per-platform OAuth client settings.
///
/// Endpoint and scope fields override the built-in defaults for the platform.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderSettings {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<Secret>,
    #[serde(default)]
    pub authorization_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub profile_url: Option<String>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            state: StateConfig::default(),
            exchange: ExchangeConfig::default(),
            refresh: RefreshConfig::default(),
            providers: BTreeMap::new(),
            encryption_key: None,
        }
    }
}

impl AppConfig {
    /// Overlay `POSTPILOT_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay variables from an arbitrary lookup (the environment in production).
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("POSTPILOT_ENCRYPTION_KEY") {
            self.encryption_key = Some(Secret::new(v));
        }
        if let Some(v) = lookup("POSTPILOT_DB_PATH") {
            self.storage.db_path = v;
        }
        if let Some(v) = lookup("POSTPILOT_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = lookup("POSTPILOT_CALLBACK_BASE_URL") {
            self.server.callback_base_url = v;
        }
        if let Some(v) = lookup("POSTPILOT_CONNECTIONS_URL") {
            self.server.connections_url = v;
        }
        if let Some(v) = lookup("POSTPILOT_AUTH_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                self.server.auth_enabled = b;
            }
        }
        if let Some(v) = lookup("POSTPILOT_REFRESH_INTERVAL_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.refresh.interval_seconds = n;
            }
        }

        for platform in Platform::ALL {
            let prefix = platform.env_prefix();
            let client_id = lookup(&format!("POSTPILOT_OAUTH_{}_CLIENT_ID", prefix));
            let client_secret = lookup(&format!("POSTPILOT_OAUTH_{}_CLIENT_SECRET", prefix));

            if client_id.is_none() && client_secret.is_none() {
                continue;
            }

            let settings = self.providers.entry(platform).or_default();
            if let Some(id) = client_id {
                settings.client_id = Some(id);
            }
            if let Some(secret) = client_secret {
                settings.client_secret = Some(Secret::new(secret));
            }
        }
    }

    /// Rejects timing values the background tasks and clocks cannot use.
    pub fn validate(&self) -> Result<()> {
        check_interval("state.cleanup_interval_seconds", self.state.cleanup_interval_seconds)?;
        check_interval("refresh.interval_seconds", self.refresh.interval_seconds)?;
        check_interval(
            "exchange.request_timeout_seconds",
            self.exchange.request_timeout_seconds,
        )?;

        ensure!(
            (1..=MAX_WINDOW_SECONDS).contains(&self.state.lifetime_seconds),
            "state.lifetime_seconds must be between 1 and {}, got {}",
            MAX_WINDOW_SECONDS,
            self.state.lifetime_seconds
        );
        ensure!(
            (0..=MAX_WINDOW_SECONDS).contains(&self.refresh.buffer_seconds),
            "refresh.buffer_seconds must be between 0 and {}, got {}",
            MAX_WINDOW_SECONDS,
            self.refresh.buffer_seconds
        );
        Ok(())
    }

    /// Returns the encryption key or fails with a startup-friendly message.
    pub fn require_encryption_key(&self) -> Result<&Secret> {
        self.encryption_key
            .as_ref()
            .context("POSTPILOT_ENCRYPTION_KEY must be set to a base64-encoded 32-byte key")
    }
}

/// Load configuration from a TOML file, then apply the environment overlay.
///
/// A missing file is not an error; defaults are used.
pub fn load_config(path: &str) -> Result<AppConfig> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => parse_config(&contents)
            .with_context(|| format!("Failed to parse config file {}", path))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read config file {}", path));
        }
    };

    config.apply_env();
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {} or environment", path))?;
    Ok(config)
}

/// Parse configuration from TOML text (no environment overlay).
pub fn parse_config(contents: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

fn check_interval(name: &str, seconds: u64) -> Result<()> {
    ensure!(
        (1..=MAX_INTERVAL_SECONDS).contains(&seconds),
        "{} must be between 1 and {}, got {}",
        name,
        MAX_INTERVAL_SECONDS,
        seconds
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.state.lifetime_seconds, 600);
        assert_eq!(config.state.backend, StateBackend::Sqlite);
        assert_eq!(config.exchange.request_timeout_seconds, 10);
        assert_eq!(config.refresh.buffer_seconds, 300);
        assert!(config.providers.is_empty());
        assert!(config.encryption_key.is_none());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:8080"
            callback_base_url = "https://app.example.com"
            auth_enabled = true

            [storage]
            db_path = "/var/lib/postpilot/credentials.db"

            [state]
            lifetime_seconds = 300
            backend = "memory"

            [refresh]
            interval_seconds = 30
            buffer_seconds = 120

            [providers.facebook]
            client_id = "fb-client"
            client_secret = "fb-secret"
            scopes = ["pages_manage_posts"]

            [providers.linkedin]
            client_id = "li-client"
            client_secret = "li-secret"
            token_url = "https://staging.example.com/token"
        "#;

        let config = parse_config(toml).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:8080");
        assert!(config.server.auth_enabled);
        assert_eq!(config.storage.db_path, "/var/lib/postpilot/credentials.db");
        assert_eq!(config.state.backend, StateBackend::Memory);
        assert_eq!(config.refresh.interval_seconds, 30);

        let facebook = &config.providers[&Platform::Facebook];
        assert_eq!(facebook.client_id.as_deref(), Some("fb-client"));
        assert_eq!(facebook.client_secret.as_ref().unwrap().expose(), "fb-secret");
        assert_eq!(facebook.scopes.as_ref().unwrap().len(), 1);

        let linkedin = &config.providers[&Platform::Linkedin];
        assert_eq!(
            linkedin.token_url.as_deref(),
            Some("https://staging.example.com/token")
        );
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [refresh]
            buffer_seconds = 600
        "#;

        let config = parse_config(toml).unwrap();
        assert_eq!(config.refresh.buffer_seconds, 600);
        assert_eq!(config.refresh.interval_seconds, 60); // Default
        assert_eq!(config.state.lifetime_seconds, 600); // Default
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let toml = r#"
            [providers.myspace]
            client_id = "x"
        "#;

        assert!(parse_config(toml).is_err());
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("POSTPILOT_ENCRYPTION_KEY", "a2V5"),
            ("POSTPILOT_DB_PATH", "/tmp/creds.db"),
            ("POSTPILOT_AUTH_ENABLED", "true"),
            ("POSTPILOT_OAUTH_TWITTER_CLIENT_ID", "tw-id"),
            ("POSTPILOT_OAUTH_TWITTER_CLIENT_SECRET", "tw-secret"),
        ]);

        let mut config = AppConfig::default();
        config.apply_env_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.require_encryption_key().unwrap().expose(), "a2V5");
        assert_eq!(config.storage.db_path, "/tmp/creds.db");
        assert!(config.server.auth_enabled);

        let twitter = &config.providers[&Platform::Twitter];
        assert_eq!(twitter.client_id.as_deref(), Some("tw-id"));
        assert!(!config.providers.contains_key(&Platform::Facebook));
    }

    #[test]
    fn test_secrets_not_in_debug_output() {
        let mut config = AppConfig::default();
        config.encryption_key = Some(Secret::new("master-key-material"));
        config.providers.insert(
            Platform::Facebook,
            ProviderSettings {
                client_secret: Some(Secret::new("fb-client-secret")),
                ..Default::default()
            },
        );

        let debug = format!("{:?}", config);
        assert!(!debug.contains("master-key-material"));
        assert!(!debug.contains("fb-client-secret"));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for toml in [
            "[refresh]\ninterval_seconds = 0",
            "[state]\ncleanup_interval_seconds = 0",
            "[exchange]\nrequest_timeout_seconds = 0",
        ] {
            let err = parse_config(toml).unwrap_err();
            assert!(err.to_string().contains("must be between 1"), "{}", err);
        }
    }

    #[test]
    fn test_out_of_range_windows_rejected() {
        assert!(parse_config("[state]\nlifetime_seconds = 0").is_err());
        assert!(parse_config("[state]\nlifetime_seconds = 9223372036854775807").is_err());
        assert!(parse_config("[refresh]\nbuffer_seconds = -5").is_err());
        assert!(parse_config("[refresh]\nbuffer_seconds = 9223372036854775807").is_err());
        assert!(parse_config("[refresh]\nbuffer_seconds = 0").is_ok());
    }

    #[test]
    fn test_env_interval_is_validated() {
        let mut config = AppConfig::default();
        config.apply_env_from(|key| {
            (key == "POSTPILOT_REFRESH_INTERVAL_SECONDS").then(|| "0".to_string())
        });

        assert_eq!(config.refresh.interval_seconds, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_encryption_key() {
        let config = AppConfig::default();
        assert!(config.require_encryption_key().is_err());
    }
}
