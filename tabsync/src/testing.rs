//! Test doubles for the network seams and a budget fixture to run them on.

use crate::api::{ApiError, BudgetApi};
use crate::auth::{AuthError, TokenManager, SAFETY_MARGIN};
use crate::cache::{
    CachedAccount, CachedBudget, CachedCategory, CachedPayee, CachedTransaction, EntityCache,
    EntityMap,
};
use crate::storage::{keys, MemoryArea, Store};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tabsync_auth::{OAuthErrorBody, TokenData, TokenEndpoint, TokenEndpointError, TokenResponse};
use uuid::Uuid;
use ynab_api::endpoints::accounts::AccountType;
use ynab_api::endpoints::categories::CREDIT_CARD_PAYMENTS_GROUP;
use ynab_api::endpoints::transactions::NewTransaction;
use ynab_api::endpoints::{Milliunits, TransactionId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn delay(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

/// Stored credentials whose access token expires `secs` from now.
pub fn token_expiring_in(secs: i64) -> TokenData {
    TokenData {
        access_token: "access-initial".to_string(),
        refresh_token: "refresh-initial".to_string(),
        expires: (Utc::now() + ChronoDuration::seconds(secs)).timestamp_millis(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Non-2xx answer with this status
    Rejected(u16),
    /// No answer at all
    Network,
}

impl MockFailure {
    fn to_error(self) -> TokenEndpointError {
        match self {
            MockFailure::Rejected(status) => TokenEndpointError::Rejected {
                status,
                error: Some(OAuthErrorBody {
                    error: "invalid_grant".to_string(),
                    error_description: None,
                }),
            },
            MockFailure::Network => TokenEndpointError::Http("connection refused".to_string()),
        }
    }
}

/// Token endpoint issuing `access-N`/`refresh-N` pairs.
pub struct MockTokenEndpoint {
    latency: Duration,
    lifetime_secs: i64,
    issued: AtomicUsize,
    exchange_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    failure: Mutex<Option<MockFailure>>,
}

impl MockTokenEndpoint {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            lifetime_secs: 7200,
            issued: AtomicUsize::new(0),
            exchange_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_lifetime(mut self, secs: i64) -> Self {
        self.lifetime_secs = secs;
        self
    }

    /// Make every following call fail, or succeed again with `None`.
    pub fn fail_with(&self, failure: Option<MockFailure>) {
        *lock(&self.failure) = failure;
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    async fn answer(&self) -> Result<TokenResponse, TokenEndpointError> {
        delay(self.latency).await;
        if let Some(failure) = *lock(&self.failure) {
            return Err(failure.to_error());
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenResponse {
            access_token: format!("access-{n}"),
            refresh_token: format!("refresh-{n}"),
            created_at: Utc::now().timestamp(),
            expires_in: self.lifetime_secs,
        })
    }
}

impl Default for MockTokenEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEndpoint for MockTokenEndpoint {
    fn exchange_code<'a>(
        &'a self,
        _code: &'a str,
        _redirect_uri: &'a str,
    ) -> BoxFuture<'a, Result<TokenResponse, TokenEndpointError>> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        self.answer().boxed()
    }

    fn exchange_refresh_token<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenResponse, TokenEndpointError>> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.answer().boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiCall {
    ListBudgets,
    ListCategories,
    ListAccounts,
    ListPayees,
    ListUnapproved,
    CreateTransaction,
}

#[derive(Default)]
struct MockServer {
    budgets: Vec<CachedBudget>,
    categories: HashMap<Uuid, EntityMap<CachedCategory>>,
    accounts: HashMap<Uuid, EntityMap<CachedAccount>>,
    payees: HashMap<Uuid, EntityMap<CachedPayee>>,
    unapproved: HashMap<Uuid, Vec<CachedTransaction>>,
}

impl MockServer {
    fn create(
        &mut self,
        budget_id: Uuid,
        transaction: &NewTransaction,
    ) -> Result<CachedTransaction, ApiError> {
        let transfer_account_id = transaction
            .payee_id
            .and_then(|id| self.payees.get(&budget_id)?.get(&id))
            .and_then(|payee| payee.transfer_account_id);
        let accounts = self.accounts.get_mut(&budget_id).ok_or_else(not_found)?;
        let account = accounts
            .get_mut(&transaction.account_id)
            .ok_or_else(not_found)?;
        account.balance += transaction.amount;
        if let Some(counter) = transfer_account_id.and_then(|id| accounts.get_mut(&id)) {
            counter.balance -= transaction.amount;
        }
        if let Some(category) = transaction
            .category_id
            .and_then(|id| self.categories.get_mut(&budget_id)?.get_mut(&id))
        {
            category.balance += transaction.amount;
        }

        let created = CachedTransaction {
            id: TransactionId::from(Uuid::new_v4()),
            date: transaction.date,
            amount: transaction.amount,
            account_id: transaction.account_id,
            category_id: transaction.category_id,
            payee_id: transaction.payee_id,
            transfer_account_id,
            approved: transaction.approved.unwrap_or(false),
        };
        if !created.approved {
            self.unapproved
                .entry(budget_id)
                .or_default()
                .push(created.clone());
        }
        Ok(created)
    }
}

fn not_found() -> ApiError {
    ApiError::Status {
        status: 404,
        detail: "not_found: resource not found".to_string(),
    }
}

/// In-memory budget API that keeps server-side balances up to date.
pub struct MockBudgetApi {
    server: Mutex<MockServer>,
    latency: Duration,
    calls: Mutex<HashMap<ApiCall, usize>>,
    failure: Mutex<Option<ApiError>>,
    create_failure: Mutex<Option<ApiError>>,
    created: Mutex<Vec<NewTransaction>>,
    tokens: Mutex<Vec<String>>,
}

impl MockBudgetApi {
    pub fn new() -> Self {
        Self {
            server: Mutex::new(MockServer::default()),
            latency: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            create_failure: Mutex::new(None),
            created: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fixture(fixture: &Fixture) -> Self {
        let api = Self::new();
        api.insert_fixture(fixture);
        api
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn insert_fixture(&self, fixture: &Fixture) {
        let mut server = lock(&self.server);
        let id = fixture.budget.id;
        server.budgets.push(fixture.budget.clone());
        server.categories.insert(id, fixture.categories.clone());
        server.accounts.insert(id, fixture.accounts.clone());
        server.payees.insert(id, fixture.payees.clone());
        server.unapproved.insert(id, fixture.unapproved.clone());
    }

    pub fn calls(&self, call: ApiCall) -> usize {
        lock(&self.calls).get(&call).copied().unwrap_or(0)
    }

    /// Make every following call fail, or succeed again with `None`.
    pub fn fail_with(&self, error: Option<ApiError>) {
        *lock(&self.failure) = error;
    }

    /// Like [`Self::fail_with`], for transaction creation only.
    pub fn fail_creates_with(&self, error: Option<ApiError>) {
        *lock(&self.create_failure) = error;
    }

    /// Transactions accepted by the server, in order.
    pub fn created(&self) -> Vec<NewTransaction> {
        lock(&self.created).clone()
    }

    /// Access tokens presented by callers, in order.
    pub fn tokens_seen(&self) -> Vec<String> {
        lock(&self.tokens).clone()
    }

    /// Change a balance behind the cache's back.
    pub fn set_account_balance(&self, budget_id: Uuid, account_id: Uuid, balance: Milliunits) {
        if let Some(account) = lock(&self.server)
            .accounts
            .get_mut(&budget_id)
            .and_then(|accounts| accounts.get_mut(&account_id))
        {
            account.balance = balance;
        }
    }

    pub fn account_balance(&self, budget_id: Uuid, account_id: Uuid) -> Option<Milliunits> {
        lock(&self.server)
            .accounts
            .get(&budget_id)?
            .get(&account_id)
            .map(|account| account.balance)
    }

    fn respond<'a, T, F>(&'a self, token: &'a str, call: ApiCall, read: F) -> BoxFuture<'a, Result<T, ApiError>>
    where
        T: Send + 'a,
        F: FnOnce(&mut MockServer) -> Result<T, ApiError> + Send + 'a,
    {
        async move {
            *lock(&self.calls).entry(call).or_default() += 1;
            lock(&self.tokens).push(token.to_string());
            delay(self.latency).await;
            if let Some(error) = lock(&self.failure).clone() {
                return Err(error);
            }
            if call == ApiCall::CreateTransaction {
                if let Some(error) = lock(&self.create_failure).clone() {
                    return Err(error);
                }
            }
            let mut server = lock(&self.server);
            read(&mut server)
        }
        .boxed()
    }
}

impl Default for MockBudgetApi {
    fn default() -> Self {
        Self::new()
    }
}

impl BudgetApi for MockBudgetApi {
    fn list_budgets<'a>(
        &'a self,
        token: &'a str,
    ) -> BoxFuture<'a, Result<Vec<CachedBudget>, ApiError>> {
        self.respond(token, ApiCall::ListBudgets, |server| {
            Ok(server.budgets.clone())
        })
    }

    fn list_categories<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<EntityMap<CachedCategory>, ApiError>> {
        self.respond(token, ApiCall::ListCategories, move |server| {
            server.categories.get(&budget_id).cloned().ok_or_else(not_found)
        })
    }

    fn list_accounts<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<EntityMap<CachedAccount>, ApiError>> {
        self.respond(token, ApiCall::ListAccounts, move |server| {
            server.accounts.get(&budget_id).cloned().ok_or_else(not_found)
        })
    }

    fn list_payees<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<EntityMap<CachedPayee>, ApiError>> {
        self.respond(token, ApiCall::ListPayees, move |server| {
            server.payees.get(&budget_id).cloned().ok_or_else(not_found)
        })
    }

    fn list_unapproved<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<Vec<CachedTransaction>, ApiError>> {
        self.respond(token, ApiCall::ListUnapproved, move |server| {
            server.unapproved.get(&budget_id).cloned().ok_or_else(not_found)
        })
    }

    fn create_transaction<'a>(
        &'a self,
        token: &'a str,
        budget_id: Uuid,
        transaction: NewTransaction,
    ) -> BoxFuture<'a, Result<CachedTransaction, ApiError>> {
        self.respond(token, ApiCall::CreateTransaction, move |server| {
            let created = server.create(budget_id, &transaction)?;
            lock(&self.created).push(transaction);
            Ok(created)
        })
    }
}

/// One budget with a checking, a savings and a credit card account.
///
/// Rent is overspent, the Visa payment category is negative (never an
/// alert), and four transactions wait for approval: two in Groceries, one in
/// Rent and one without category.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub budget: CachedBudget,
    pub checking: Uuid,
    pub savings: Uuid,
    pub visa: Uuid,
    pub old_cash: Uuid,
    pub groceries: Uuid,
    pub rent: Uuid,
    pub visa_payment: Uuid,
    pub grocer: Uuid,
    pub to_checking: Uuid,
    pub to_savings: Uuid,
    pub to_visa: Uuid,
    pub categories: EntityMap<CachedCategory>,
    pub accounts: EntityMap<CachedAccount>,
    pub payees: EntityMap<CachedPayee>,
    pub unapproved: Vec<CachedTransaction>,
}

impl Fixture {
    pub fn new() -> Self {
        let now = Utc::now();
        let budget = CachedBudget {
            id: Uuid::new_v4(),
            name: "Household".to_string(),
        };
        let [checking, savings, visa, old_cash] = [(); 4].map(|_| Uuid::new_v4());
        let [groceries, rent, visa_payment] = [(); 3].map(|_| Uuid::new_v4());
        let [grocer, to_checking, to_savings, to_visa] = [(); 4].map(|_| Uuid::new_v4());

        let account = |name: &str, balance: i64, account_type, transfer_payee_id, reconciled_days_ago: Option<i64>| {
            CachedAccount {
                name: name.to_string(),
                balance: Milliunits::new(balance),
                closed: false,
                account_type,
                transfer_payee_id: Some(transfer_payee_id),
                last_reconciled_at: reconciled_days_ago.map(|days| now - ChronoDuration::days(days)),
            }
        };
        let accounts = EntityMap::from([
            (checking, account("Checking", 1_000_000, AccountType::Checking, to_checking, Some(2))),
            (savings, account("Savings", 500_000, AccountType::Savings, to_savings, None)),
            (visa, account("Visa", -200_000, AccountType::CreditCard, to_visa, Some(30))),
            (
                old_cash,
                CachedAccount {
                    closed: true,
                    transfer_payee_id: None,
                    ..account("Old cash", 0, AccountType::Cash, Uuid::nil(), None)
                },
            ),
        ]);

        let category = |name: &str, group: &str, balance: i64| CachedCategory {
            name: name.to_string(),
            group: group.to_string(),
            balance: Milliunits::new(balance),
            hidden: false,
            is_credit_card_payment: group == CREDIT_CARD_PAYMENTS_GROUP,
        };
        let categories = EntityMap::from([
            (groceries, category("Groceries", "Everyday", 50_000)),
            (rent, category("Rent", "Bills", -20_000)),
            (visa_payment, category("Visa", CREDIT_CARD_PAYMENTS_GROUP, -5_000)),
        ]);

        let payee = |name: &str, transfer_account_id| CachedPayee {
            name: name.to_string(),
            transfer_account_id,
        };
        let payees = EntityMap::from([
            (grocer, payee("Grocer", None)),
            (to_checking, payee("Transfer : Checking", Some(checking))),
            (to_savings, payee("Transfer : Savings", Some(savings))),
            (to_visa, payee("Transfer : Visa", Some(visa))),
        ]);

        let date = now.date_naive();
        let unapproved_in = |account_id, category_id, amount: i64| CachedTransaction {
            id: TransactionId::from(Uuid::new_v4()),
            date,
            amount: Milliunits::new(amount),
            account_id,
            category_id,
            payee_id: Some(grocer),
            transfer_account_id: None,
            approved: false,
        };
        let unapproved = vec![
            unapproved_in(checking, Some(groceries), -12_500),
            unapproved_in(checking, Some(groceries), -3_000),
            unapproved_in(visa, Some(rent), -90_000),
            unapproved_in(checking, None, -1_000),
        ];

        Self {
            budget,
            checking,
            savings,
            visa,
            old_cash,
            groceries,
            rent,
            visa_payment,
            grocer,
            to_checking,
            to_savings,
            to_visa,
            categories,
            accounts,
            payees,
            unapproved,
        }
    }

    pub fn budget_id(&self) -> Uuid {
        self.budget.id
    }

    pub fn balance(&self, account_id: Uuid) -> Milliunits {
        self.accounts
            .get(&account_id)
            .map_or(Milliunits::ZERO, |account| account.balance)
    }

    pub fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Token manager and entity cache over an in-memory store and the mocks.
pub struct Harness {
    pub area: MemoryArea,
    pub store: Store,
    pub endpoint: Arc<MockTokenEndpoint>,
    pub api: Arc<MockBudgetApi>,
    pub auth: Arc<TokenManager>,
    pub cache: Arc<EntityCache>,
    pub fixture: Fixture,
}

impl Harness {
    /// Logged in with a token valid for an hour.
    pub async fn logged_in() -> Result<Self, AuthError> {
        Self::build(Duration::ZERO, Some(token_expiring_in(3600))).await
    }

    pub async fn logged_out() -> Result<Self, AuthError> {
        Self::build(Duration::ZERO, None).await
    }

    /// Logged in, with every budget API call taking `latency`.
    pub async fn with_latency(latency: Duration) -> Result<Self, AuthError> {
        Self::build(latency, Some(token_expiring_in(3600))).await
    }

    async fn build(latency: Duration, token: Option<TokenData>) -> Result<Self, AuthError> {
        let area = MemoryArea::new();
        let store = Store::new(Arc::new(area.clone()));
        if let Some(token) = token {
            store.set(keys::TOKEN_DATA, &token).await?;
        }
        let fixture = Fixture::new();
        let endpoint = Arc::new(MockTokenEndpoint::new());
        let api = Arc::new(MockBudgetApi::with_fixture(&fixture).with_latency(latency));
        let auth = TokenManager::open(store.clone(), endpoint.clone(), SAFETY_MARGIN).await?;
        let cache = Arc::new(EntityCache::new(api.clone(), auth.clone(), store.clone()));

        Ok(Self {
            area,
            store,
            endpoint,
            api,
            auth,
            cache,
            fixture,
        })
    }

    /// A second context over the same storage area and the same mocks.
    pub async fn other_context(&self) -> Result<(Store, Arc<TokenManager>, Arc<EntityCache>), AuthError> {
        let store = self.store.new_context();
        let auth =
            TokenManager::open(store.clone(), self.endpoint.clone(), SAFETY_MARGIN).await?;
        let cache = Arc::new(EntityCache::new(self.api.clone(), auth.clone(), store.clone()));
        Ok((store, auth, cache))
    }

    pub fn budget_id(&self) -> Uuid {
        self.fixture.budget.id
    }
}
