mod manager;

pub use manager::{RefreshScheduler, TokenManager, SAFETY_MARGIN};

use crate::storage::StorageError;
use tabsync_auth::TokenEndpointError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("authorization code exchange failed: {0}")]
    ExchangeFailed(String),

    /// The refresh token was rejected. Terminal: the user is logged out.
    #[error("token refresh was rejected: {0}")]
    RefreshFailed(String),

    #[error("not logged in")]
    Unauthenticated,

    /// The token endpoint could not be reached; the stored token is kept.
    #[error("token endpoint unreachable: {0}")]
    Network(String),

    #[error("token storage failed: {0}")]
    Storage(String),
}

impl AuthError {
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::ExchangeFailed(_) => "exchange_failed",
            AuthError::RefreshFailed(_) => "refresh_failed",
            AuthError::Unauthenticated => "unauthenticated",
            AuthError::Network(_) => "network",
            AuthError::Storage(_) => "storage",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthError::RefreshFailed(_))
    }
}

impl From<StorageError> for AuthError {
    fn from(error: StorageError) -> Self {
        AuthError::Storage(error.to_string())
    }
}

impl AuthError {
    fn from_exchange(error: TokenEndpointError) -> Self {
        match error {
            TokenEndpointError::Http(e) => AuthError::Network(e),
            e => AuthError::ExchangeFailed(e.to_string()),
        }
    }

    fn from_refresh(error: TokenEndpointError) -> Self {
        match error {
            TokenEndpointError::Http(e) => AuthError::Network(e),
            e => AuthError::RefreshFailed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// The user logged out
    Requested,
    /// The token endpoint rejected the refresh token
    RefreshRejected,
    /// The data API answered 401
    Unauthorized,
    /// Another context removed the stored token
    ClearedElsewhere,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    LoggedIn,
    /// `reason` is `None` when there never was a token
    LoggedOut { reason: Option<LogoutReason> },
}

impl AuthStatus {
    pub fn is_logged_in(&self) -> bool {
        matches!(self, AuthStatus::LoggedIn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_auth::OAuthErrorBody;

    #[test]
    fn endpoint_rejections_map_to_reasons() {
        let rejected = || TokenEndpointError::Rejected {
            status: 400,
            error: Some(OAuthErrorBody {
                error: "invalid_grant".to_string(),
                error_description: None,
            }),
        };

        let exchange = AuthError::from_exchange(rejected());
        assert_eq!(exchange.reason(), "exchange_failed");
        assert!(!exchange.is_terminal());

        let refresh = AuthError::from_refresh(rejected());
        assert_eq!(refresh.reason(), "refresh_failed");
        assert!(refresh.is_terminal());
        assert!(refresh.to_string().contains("invalid_grant"));
    }

    #[test]
    fn transport_failures_are_recoverable() {
        let error = AuthError::from_refresh(TokenEndpointError::Http("timed out".into()));
        assert_eq!(error, AuthError::Network("timed out".into()));
        assert!(!error.is_terminal());
    }
}
