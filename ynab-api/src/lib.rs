pub mod endpoints;
mod error;
mod macros;
pub mod repositories;

pub use crate::error::{ErrorDetail, YnabApiError};
pub use tower_api_client::StatusCode;
use repositories::*;
use tower_api_client::{Client as ApiClient, Request as ApiRequest};

pub const BASE_URL: &str = "https://api.ynab.com/v1";

/// Authenticated client for the budget data API.
///
/// A client is bound to one access token; build a new one whenever the
/// token is refreshed.
pub struct Client {
    inner: ApiClient,
}

impl Client {
    pub fn new(access_token: &str) -> Self {
        Self::with_base_url(BASE_URL, access_token)
    }

    pub fn with_base_url(base_url: &str, access_token: &str) -> Self {
        Self {
            inner: ApiClient::new(base_url).bearer_auth(access_token),
        }
    }

    pub async fn send<R>(&self, request: R) -> Result<R::Response, YnabApiError>
    where
        R: ApiRequest,
    {
        self.inner.send(request).await.map_err(From::from)
    }
}

/// Entry point for building requests, grouped by resource.
pub struct Request;

impl Request {
    pub fn accounts() -> AccountRepository {
        AccountRepository::new()
    }

    pub fn budgets() -> BudgetRepository {
        BudgetRepository
    }

    pub fn categories() -> CategoryRepository {
        CategoryRepository::new()
    }

    pub fn payees() -> PayeeRepository {
        PayeeRepository::new()
    }

    pub fn transactions() -> TransactionRepository {
        TransactionRepository::new()
    }
}
