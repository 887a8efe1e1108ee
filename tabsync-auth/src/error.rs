use crate::common::OAuthErrorBody;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenEndpointError {
    /// The endpoint answered with a non-2xx status
    #[error("token endpoint rejected the request ({status}): {}", describe(.error))]
    Rejected {
        status: u16,
        error: Option<OAuthErrorBody>,
    },

    /// The endpoint could not be reached or answered with an unreadable body
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for TokenEndpointError {
    fn from(error: reqwest::Error) -> Self {
        TokenEndpointError::Http(error.to_string())
    }
}

fn describe(error: &Option<OAuthErrorBody>) -> String {
    error
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "no error body".to_string())
}
