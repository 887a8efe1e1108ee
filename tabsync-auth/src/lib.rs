// Wire models shared by the endpoint client and its callers
pub mod common;

mod client;
mod error;

pub use client::{OAuthSettings, OAuthTokenClient, TokenEndpoint};
pub use common::{OAuthErrorBody, TokenData, TokenResponse};
pub use error::TokenEndpointError;
