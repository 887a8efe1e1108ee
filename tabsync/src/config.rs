use crate::storage::{FileArea, RetryPolicy};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tabsync_auth::OAuthSettings;
use thiserror::Error;

const CONFIG_PATH_VAR: &str = "TABSYNC_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "tabsync.toml";
const ENV_PREFIX: &str = "TABSYNC";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub oauth: OAuthSettings,

    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            safety_margin_secs: default_safety_margin_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Defaults to the platform data directory
    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            dir: None,
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_base_url() -> String {
    ynab_api::BASE_URL.to_string()
}

fn default_safety_margin_secs() -> u64 {
    60
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

impl Config {
    /// Load `tabsync.toml` (or `$TABSYNC_CONFIG`) with `TABSYNC__*`
    /// environment variables layered on top.
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        tracing::debug!(%path, "Loading configuration");

        let config: Config = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.oauth.validate()?;
        if !self.api.base_url.starts_with("http") {
            return Err("api.base_url must be a valid HTTP(S) URL".to_string());
        }
        if self.storage.retry_attempts == 0 {
            return Err("storage.retry_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.auth.safety_margin_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.storage.retry_attempts,
            backoff: Duration::from_millis(self.storage.retry_backoff_ms),
        }
    }

    pub fn store_dir(&self) -> Result<PathBuf, ConfigError> {
        self.storage
            .dir
            .clone()
            .or_else(FileArea::default_dir)
            .ok_or_else(|| ConfigError::Invalid("could not find a data directory".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    fn parse(toml: &str) -> Config {
        config::Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = parse(
            r#"
            [oauth]
            client_id = "id"
            client_secret = "secret"
            redirect_uri = "https://ext.example/callback"
            "#,
        );

        assert!(config.validate().is_ok());
        assert_eq!(config.api.base_url, ynab_api::BASE_URL);
        assert_eq!(config.safety_margin(), Duration::from_secs(60));
        assert_eq!(config.retry_policy().attempts, 3);
        assert_eq!(config.retry_policy().backoff, Duration::from_millis(50));
        assert_eq!(config.oauth.token_url, "https://app.ynab.com/oauth/token");
    }

    #[test]
    fn overrides_are_applied() {
        let config = parse(
            r#"
            [oauth]
            client_id = "id"
            client_secret = "secret"
            redirect_uri = "https://ext.example/callback"

            [auth]
            safety_margin_secs = 120

            [storage]
            dir = "/tmp/tabsync"
            retry_attempts = 5
            "#,
        );

        assert_eq!(config.safety_margin(), Duration::from_secs(120));
        assert_eq!(config.retry_policy().attempts, 5);
        assert_eq!(config.store_dir().unwrap(), PathBuf::from("/tmp/tabsync"));
    }

    #[test]
    fn missing_credentials_are_invalid() {
        let config = parse("");
        let err = config.validate().unwrap_err();
        assert!(err.contains("client_id"), "{err}");

        let config = parse(
            r#"
            [oauth]
            client_id = "id"
            client_secret = "secret"
            redirect_uri = "https://ext.example/callback"

            [api]
            base_url = "ftp://example"
            "#,
        );
        assert!(config.validate().unwrap_err().contains("api.base_url"));
    }
}
