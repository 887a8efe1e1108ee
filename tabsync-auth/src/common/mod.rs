mod models;

pub use models::{OAuthErrorBody, TokenData, TokenResponse};
