use crate::cache::{
    entities::{
        accounts_from_records, categories_from_groups, payees_from_records,
        transactions_from_records,
    },
    CachedAccount, CachedBudget, CachedCategory, CachedPayee, CachedTransaction, EntityMap,
};
use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use uuid::Uuid;
use ynab_api::endpoints::transactions::{NewTransaction, TransactionType};
use ynab_api::{Client, Request, YnabApiError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The access token was rejected (401)
    #[error("unauthorized")]
    Unauthorized,

    #[error("API answered {status}: {detail}")]
    Status { status: u16, detail: String },

    /// No answer: connection failure, timeout or unreadable body
    #[error("network error: {0}")]
    Network(String),
}

impl From<YnabApiError> for ApiError {
    fn from(error: YnabApiError) -> Self {
        match error {
            e if e.is_unauthorized() => ApiError::Unauthorized,
            YnabApiError::Ynab(status, detail) => ApiError::Status {
                status: status.as_u16(),
                detail: format!("{}: {}", detail.name, detail.detail),
            },
            YnabApiError::Internal(e) => ApiError::Network(e.to_string()),
        }
    }
}

/// Budget data API as seen by the cache and the draft machine.
///
/// Every call takes the access token to use; implementations convert the
/// remote payloads into the cached entity types.
pub trait BudgetApi: Send + Sync {
    fn list_budgets<'a>(&'a self, token: &'a str)
        -> BoxFuture<'a, Result<Vec<CachedBudget>, ApiError>>;

    fn list_categories<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<EntityMap<CachedCategory>, ApiError>>;

    fn list_accounts<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<EntityMap<CachedAccount>, ApiError>>;

    fn list_payees<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<EntityMap<CachedPayee>, ApiError>>;

    /// Transactions still waiting for approval.
    fn list_unapproved<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<Vec<CachedTransaction>, ApiError>>;

    fn create_transaction<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
        transaction: NewTransaction,
    ) -> BoxFuture<'a, Result<CachedTransaction, ApiError>>;
}

/// [`BudgetApi`] over the REST client.
pub struct YnabBudgetApi {
    base_url: String,
}

impl YnabBudgetApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn client(&self, token: &str) -> Client {
        Client::with_base_url(&self.base_url, token)
    }
}

impl Default for YnabBudgetApi {
    fn default() -> Self {
        Self::new(ynab_api::BASE_URL)
    }
}

impl BudgetApi for YnabBudgetApi {
    fn list_budgets<'a>(
        &'a self,
        token: &'a str,
    ) -> BoxFuture<'a, Result<Vec<CachedBudget>, ApiError>> {
        async move {
            let response = self.client(token).send(Request::budgets().list()).await?;
            Ok(response
                .data
                .budgets
                .into_iter()
                .map(CachedBudget::from)
                .collect())
        }
        .boxed()
    }

    fn list_categories<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<EntityMap<CachedCategory>, ApiError>> {
        async move {
            let request = Request::categories().with_budget(budget_id).list();
            let response = self.client(token).send(request).await?;
            Ok(categories_from_groups(response.data.category_groups))
        }
        .boxed()
    }

    fn list_accounts<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<EntityMap<CachedAccount>, ApiError>> {
        async move {
            let request = Request::accounts().with_budget(budget_id).list();
            let response = self.client(token).send(request).await?;
            Ok(accounts_from_records(response.data.accounts))
        }
        .boxed()
    }

    fn list_payees<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<EntityMap<CachedPayee>, ApiError>> {
        async move {
            let request = Request::payees().with_budget(budget_id).list();
            let response = self.client(token).send(request).await?;
            Ok(payees_from_records(response.data.payees))
        }
        .boxed()
    }

    fn list_unapproved<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<Vec<CachedTransaction>, ApiError>> {
        async move {
            let request = Request::transactions()
                .with_budget(budget_id)
                .list()
                .only(TransactionType::Unapproved);
            let response = self.client(token).send(request).await?;
            Ok(transactions_from_records(response.data.transactions))
        }
        .boxed()
    }

    fn create_transaction<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
        transaction: NewTransaction,
    ) -> BoxFuture<'a, Result<CachedTransaction, ApiError>> {
        async move {
            let request = Request::transactions()
                .with_budget(budget_id)
                .create_from(transaction);
            let response = self.client(token).send(request).await?;
            Ok(CachedTransaction::from(response.data.transaction))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ynab_api::{ErrorDetail, StatusCode};

    #[test]
    fn api_errors_are_classified() {
        let unauthorized = YnabApiError::Ynab(
            StatusCode::UNAUTHORIZED,
            ErrorDetail {
                id: "401".into(),
                name: "unauthorized".into(),
                detail: "Unauthorized".into(),
            },
        );
        assert_eq!(ApiError::from(unauthorized), ApiError::Unauthorized);

        let server = YnabApiError::Ynab(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetail {
                id: "503".into(),
                name: "service_unavailable".into(),
                detail: "down".into(),
            },
        );
        assert_eq!(
            ApiError::from(server),
            ApiError::Status {
                status: 503,
                detail: "service_unavailable: down".into()
            }
        );
    }
}
