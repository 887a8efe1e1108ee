pub mod auth_client;
mod config;

pub use auth_client::OAuthTokenClient;
pub use config::OAuthSettings;

use crate::common::TokenResponse;
use crate::error::TokenEndpointError;
use futures::future::BoxFuture;

/// Grants that can be traded at the OAuth token endpoint.
///
/// Implemented by [`OAuthTokenClient`] for the real endpoint; tests plug in
/// scripted implementations.
pub trait TokenEndpoint: Send + Sync {
    /// Trade a one-time authorization code for a token pair.
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: &'a str,
    ) -> BoxFuture<'a, Result<TokenResponse, TokenEndpointError>>;

    /// Trade a refresh token for a new token pair.
    fn exchange_refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenResponse, TokenEndpointError>>;
}
