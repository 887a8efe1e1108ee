use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// OAuth application registration used against the token endpoint.
#[derive(Debug, Deserialize)]
pub struct OAuthSettings {
    #[serde(default)]
    pub client_id: String,

    #[serde(default = "default_client_secret")]
    pub client_secret: SecretString,

    #[serde(default)]
    pub redirect_uri: String,

    #[serde(default = "default_token_url")]
    pub token_url: String,

    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_client_secret() -> SecretString {
    SecretString::from(String::new())
}

fn default_token_url() -> String {
    "https://app.ynab.com/oauth/token".to_string()
}

fn default_authorize_url() -> String {
    "https://app.ynab.com/oauth/authorize".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self::new("", "")
    }
}

impl OAuthSettings {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            redirect_uri: String::new(),
            token_url: default_token_url(),
            authorize_url: default_authorize_url(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = redirect_uri.into();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.client_id.is_empty() {
            return Err("oauth.client_id is required".to_string());
        }
        if self.client_secret.expose_secret().is_empty() {
            return Err("oauth.client_secret is required".to_string());
        }
        if self.redirect_uri.is_empty() {
            return Err("oauth.redirect_uri is required".to_string());
        }
        for (name, url) in [
            ("oauth.token_url", &self.token_url),
            ("oauth.authorize_url", &self.authorize_url),
        ] {
            if !url.starts_with("http") {
                return Err(format!("{} must be a valid HTTP(S) URL", name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_credentials() {
        let settings = OAuthSettings::new("", "secret").with_redirect_uri("https://x/cb");
        assert!(settings.validate().is_err());

        let settings = OAuthSettings::new("id", "").with_redirect_uri("https://x/cb");
        assert!(settings.validate().is_err());

        let settings = OAuthSettings::new("id", "secret");
        assert!(settings.validate().is_err());

        let settings = OAuthSettings::new("id", "secret").with_redirect_uri("https://x/cb");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn rejects_non_http_token_url() {
        let mut settings = OAuthSettings::new("id", "secret").with_redirect_uri("https://x/cb");
        settings.token_url = "ftp://tokens".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let settings: OAuthSettings =
            serde_json::from_str(r#"{"client_id":"id","client_secret":"s"}"#).unwrap();
        assert_eq!(settings.token_url, "https://app.ynab.com/oauth/token");
        assert_eq!(settings.timeout_secs, 10);
        assert_eq!(settings.client_secret.expose_secret(), "s");
    }
}
