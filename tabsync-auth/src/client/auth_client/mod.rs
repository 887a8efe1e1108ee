mod models;

use super::config::OAuthSettings;
use super::TokenEndpoint;
use crate::common::{OAuthErrorBody, TokenResponse};
use crate::error::TokenEndpointError;
use futures::future::{BoxFuture, FutureExt};
use models::{GrantType, TokenRequest};
use reqwest::{Client, Url};
use secrecy::ExposeSecret;
use std::time::Duration;

/// Talks to the OAuth token endpoint directly with the application's
/// client credentials.
pub struct OAuthTokenClient {
    http_client: Client,
    settings: OAuthSettings,
}

impl OAuthTokenClient {
    pub fn new(settings: OAuthSettings) -> Result<Self, TokenEndpointError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            http_client,
            settings,
        })
    }

    /// Login page the user has to visit to obtain an authorization code.
    pub fn authorize_url(&self, state: &str) -> Result<String, TokenEndpointError> {
        let url = Url::parse_with_params(
            &self.settings.authorize_url,
            &[
                ("client_id", self.settings.client_id.as_str()),
                ("redirect_uri", self.settings.redirect_uri.as_str()),
                ("response_type", "code"),
                ("state", state),
            ],
        )
        .map_err(|e| TokenEndpointError::Configuration(format!("Invalid authorize URL: {}", e)))?;

        Ok(url.to_string())
    }

    async fn request_token(
        &self,
        request: TokenRequest<'_>,
    ) -> Result<TokenResponse, TokenEndpointError> {
        let grant_type = request.grant_type;
        let response = self
            .http_client
            .post(&self.settings.token_url)
            .form(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = serde_json::from_str::<OAuthErrorBody>(&body).ok();
            tracing::warn!(
                status = status.as_u16(),
                %grant_type,
                body = %body,
                "Token endpoint rejected request"
            );
            return Err(TokenEndpointError::Rejected {
                status: status.as_u16(),
                error,
            });
        }

        let tokens = response.json::<TokenResponse>().await?;
        tracing::debug!(
            %grant_type,
            expires_in = tokens.expires_in,
            "Token endpoint issued tokens"
        );
        Ok(tokens)
    }
}

impl TokenEndpoint for OAuthTokenClient {
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: &'a str,
    ) -> BoxFuture<'a, Result<TokenResponse, TokenEndpointError>> {
        async move {
            let client_secret = self.settings.client_secret.expose_secret();
            self.request_token(TokenRequest {
                grant_type: GrantType::AuthorizationCode,
                client_id: &self.settings.client_id,
                client_secret,
                code: Some(code),
                redirect_uri: Some(redirect_uri),
                refresh_token: None,
            })
            .await
        }
        .boxed()
    }

    fn exchange_refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenResponse, TokenEndpointError>> {
        async move {
            let client_secret = self.settings.client_secret.expose_secret();
            self.request_token(TokenRequest {
                grant_type: GrantType::RefreshToken,
                client_id: &self.settings.client_id,
                client_secret,
                code: None,
                redirect_uri: None,
                refresh_token: Some(refresh_token),
            })
            .await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_url_carries_client_and_state() {
        let settings =
            OAuthSettings::new("client-1", "secret").with_redirect_uri("https://ext.example/cb");
        let client = OAuthTokenClient::new(settings).unwrap();

        let url = Url::parse(&client.authorize_url("xyz").unwrap()).unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert_eq!(url.host_str(), Some("app.ynab.com"));
        assert!(pairs.contains(&("client_id".to_string(), "client-1".to_string())));
        assert!(pairs.contains(&(
            "redirect_uri".to_string(),
            "https://ext.example/cb".to_string()
        )));
        assert!(pairs.contains(&("response_type".to_string(), "code".to_string())));
        assert!(pairs.contains(&("state".to_string(), "xyz".to_string())));
    }

    #[test]
    fn refresh_form_omits_code_fields() {
        let request = TokenRequest {
            grant_type: GrantType::RefreshToken,
            client_id: "id",
            client_secret: "secret",
            code: None,
            redirect_uri: None,
            refresh_token: Some("r1"),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["grant_type"], "refresh_token");
        assert_eq!(json["refresh_token"], "r1");
        assert!(json.get("code").is_none());
        assert!(json.get("redirect_uri").is_none());
    }
}
