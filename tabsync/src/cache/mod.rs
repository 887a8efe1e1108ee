pub mod entities;
mod optimistic;

pub use entities::{
    CachedAccount, CachedBudget, CachedCategory, CachedPayee, CachedTransaction, EntityMap,
};
pub use optimistic::{BalanceDelta, MutationId};

use crate::api::{ApiError, BudgetApi};
use crate::auth::{AuthError, TokenManager};
use crate::settings::SettingsStore;
use crate::storage::{keys, StorageChange, Store, WatchHandle};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use optimistic::{overlay_accounts, overlay_categories, PendingMutation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Independently fetched part of a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Scope {
    Categories,
    Accounts,
    Payees,
    /// Unapproved transactions
    Transactions,
}

impl Scope {
    pub const ALL: [Scope; 4] = [
        Scope::Categories,
        Scope::Accounts,
        Scope::Payees,
        Scope::Transactions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Categories => "categories",
            Scope::Accounts => "accounts",
            Scope::Payees => "payees",
            Scope::Transactions => "transactions",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Scope::ALL.into_iter().find(|scope| scope.as_str() == s)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fetch that did not produce data. The cache entry is left as it was.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API answered {status}: {detail}")]
    Rejected { status: u16, detail: String },
}

impl From<ApiError> for FetchError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Network(e) => FetchError::Network(e),
            ApiError::Status { status, detail } => FetchError::Rejected { status, detail },
            ApiError::Unauthorized => FetchError::Rejected {
                status: 401,
                detail: "unauthorized".to_string(),
            },
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Only returned when there is no last-known data to fall back on
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    BudgetsUpdated,
    BudgetsFetchFailed(FetchError),
    Updated { budget_id: Uuid, scope: Scope },
    Invalidated { budget_id: Uuid, scope: Scope },
    FetchFailed {
        budget_id: Uuid,
        scope: Scope,
        error: FetchError,
    },
    PendingChanged { budget_id: Uuid },
}

/// Identity of a snapshot's content, for memoizing derived data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotVersion {
    pub budget_id: Uuid,
    revision: u64,
}

/// Point-in-time view of one budget with pending mutations applied.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetSnapshot {
    pub budget_id: Uuid,
    pub version: SnapshotVersion,
    pub categories: EntityMap<CachedCategory>,
    pub accounts: EntityMap<CachedAccount>,
    pub payees: EntityMap<CachedPayee>,
    /// Unapproved transactions
    pub transactions: Vec<CachedTransaction>,
    /// Last successful fetch per loaded scope
    pub fetched_at: BTreeMap<Scope, DateTime<Utc>>,
    pub stale: Vec<Scope>,
    pub errors: Vec<(Scope, FetchError)>,
}

impl BudgetSnapshot {
    pub fn is_stale(&self) -> bool {
        !self.stale.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedSlot<T> {
    fetched_at: DateTime<Utc>,
    data: T,
}

#[derive(Debug)]
struct Slot<T> {
    data: Option<T>,
    fetched_at: Option<DateTime<Utc>>,
    stale: bool,
    /// Bumped whenever a fetch completes, successful or not
    generation: u64,
    /// Cache sequence at which the fetch that produced `data` started
    fetch_seq: u64,
    error: Option<FetchError>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            data: None,
            fetched_at: None,
            stale: false,
            generation: 0,
            fetch_seq: 0,
            error: None,
        }
    }
}

impl<T> Slot<T> {
    fn store(&mut self, data: T, fetched_at: DateTime<Utc>, fetch_seq: u64) {
        self.data = Some(data);
        self.fetched_at = Some(fetched_at);
        self.stale = false;
        self.error = None;
        self.generation += 1;
        self.fetch_seq = fetch_seq;
    }

    fn fail(&mut self, error: FetchError) {
        self.stale = true;
        self.error = Some(error);
        self.generation += 1;
    }

    fn is_fresh(&self) -> bool {
        self.data.is_some() && !self.stale
    }
}

#[derive(Debug, Default)]
struct BudgetEntry {
    categories: Slot<EntityMap<CachedCategory>>,
    accounts: Slot<EntityMap<CachedAccount>>,
    payees: Slot<EntityMap<CachedPayee>>,
    transactions: Slot<Vec<CachedTransaction>>,
    revision: u64,
}

impl BudgetEntry {
    fn mark_stale(&mut self, scope: Scope) {
        match scope {
            Scope::Categories => self.categories.stale = true,
            Scope::Accounts => self.accounts.stale = true,
            Scope::Payees => self.payees.stale = true,
            Scope::Transactions => self.transactions.stale = true,
        }
        self.revision += 1;
    }

    fn status(&self, scope: Scope) -> (Option<DateTime<Utc>>, bool, Option<&FetchError>) {
        match scope {
            Scope::Categories => slot_status(&self.categories),
            Scope::Accounts => slot_status(&self.accounts),
            Scope::Payees => slot_status(&self.payees),
            Scope::Transactions => slot_status(&self.transactions),
        }
    }
}

fn slot_status<T>(slot: &Slot<T>) -> (Option<DateTime<Utc>>, bool, Option<&FetchError>) {
    (slot.fetched_at, slot.stale, slot.error.as_ref())
}

/// Per-scope plumbing shared by the generic read path.
trait ScopeData: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const SCOPE: Scope;

    fn slot(entry: &BudgetEntry) -> &Slot<Self>;

    fn slot_mut(entry: &mut BudgetEntry) -> &mut Slot<Self>;

    fn fetch<'a>(
        api: &'a dyn BudgetApi,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<Self, ApiError>>;

    fn overlay(&mut self, _pending: &[&PendingMutation], _fetch_seq: u64) {}
}

impl ScopeData for EntityMap<CachedCategory> {
    const SCOPE: Scope = Scope::Categories;

    fn slot(entry: &BudgetEntry) -> &Slot<Self> {
        &entry.categories
    }

    fn slot_mut(entry: &mut BudgetEntry) -> &mut Slot<Self> {
        &mut entry.categories
    }

    fn fetch<'a>(
        api: &'a dyn BudgetApi,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<Self, ApiError>> {
        api.list_categories(token, budget_id)
    }

    fn overlay(&mut self, pending: &[&PendingMutation], fetch_seq: u64) {
        overlay_categories(self, pending.iter().copied(), fetch_seq);
    }
}

impl ScopeData for EntityMap<CachedAccount> {
    const SCOPE: Scope = Scope::Accounts;

    fn slot(entry: &BudgetEntry) -> &Slot<Self> {
        &entry.accounts
    }

    fn slot_mut(entry: &mut BudgetEntry) -> &mut Slot<Self> {
        &mut entry.accounts
    }

    fn fetch<'a>(
        api: &'a dyn BudgetApi,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<Self, ApiError>> {
        api.list_accounts(token, budget_id)
    }

    fn overlay(&mut self, pending: &[&PendingMutation], fetch_seq: u64) {
        overlay_accounts(self, pending.iter().copied(), fetch_seq);
    }
}

impl ScopeData for EntityMap<CachedPayee> {
    const SCOPE: Scope = Scope::Payees;

    fn slot(entry: &BudgetEntry) -> &Slot<Self> {
        &entry.payees
    }

    fn slot_mut(entry: &mut BudgetEntry) -> &mut Slot<Self> {
        &mut entry.payees
    }

    fn fetch<'a>(
        api: &'a dyn BudgetApi,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<Self, ApiError>> {
        api.list_payees(token, budget_id)
    }
}

impl ScopeData for Vec<CachedTransaction> {
    const SCOPE: Scope = Scope::Transactions;

    fn slot(entry: &BudgetEntry) -> &Slot<Self> {
        &entry.transactions
    }

    fn slot_mut(entry: &mut BudgetEntry) -> &mut Slot<Self> {
        &mut entry.transactions
    }

    fn fetch<'a>(
        api: &'a dyn BudgetApi,
        token: &'a str,
        budget_id: Uuid,
    ) -> BoxFuture<'a, Result<Self, ApiError>> {
        api.list_unapproved(token, budget_id)
    }
}

#[derive(Default)]
struct CacheState {
    budgets: Slot<Vec<CachedBudget>>,
    entries: HashMap<Uuid, BudgetEntry>,
    pending: Vec<PendingMutation>,
    seq: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn entry_mut(&mut self, budget_id: Uuid) -> &mut BudgetEntry {
        self.entries.entry(budget_id).or_default()
    }

    fn generation<T: ScopeData>(&self, budget_id: Uuid) -> u64 {
        self.entries
            .get(&budget_id)
            .map_or(0, |entry| T::slot(entry).generation)
    }

    fn pending_for(&self, budget_id: Uuid) -> Vec<&PendingMutation> {
        self.pending
            .iter()
            .filter(|m| m.budget_id == budget_id)
            .collect()
    }

    /// Data of a scope with pending mutations laid over it.
    fn view<T: ScopeData>(&self, budget_id: Uuid) -> Option<T> {
        let slot = T::slot(self.entries.get(&budget_id)?);
        let mut data = slot.data.clone()?;
        data.overlay(&self.pending_for(budget_id), slot.fetch_seq);
        Some(data)
    }

    /// View of a fresh slot whose data was fetched at `since` or later.
    fn fresh_view<T: ScopeData>(&self, budget_id: Uuid, since: u64) -> Option<T> {
        let slot = T::slot(self.entries.get(&budget_id)?);
        if slot.is_fresh() && slot.fetch_seq >= since {
            self.view(budget_id)
        } else {
            None
        }
    }

    fn fetch_seq<T: ScopeData>(&self, budget_id: Uuid) -> u64 {
        self.entries
            .get(&budget_id)
            .map_or(0, |entry| T::slot(entry).fetch_seq)
    }

    fn touch(&mut self, budget_id: Uuid) {
        self.entry_mut(budget_id).revision += 1;
    }

    /// Drop confirmed mutations once both balance scopes were refetched.
    fn prune_settled(&mut self, budget_id: Uuid) {
        let Some(entry) = self.entries.get(&budget_id) else {
            return;
        };
        let (accounts_seq, categories_seq) = (entry.accounts.fetch_seq, entry.categories.fetch_seq);
        let before = self.pending.len();
        self.pending
            .retain(|m| m.budget_id != budget_id || !m.is_settled(accounts_seq, categories_seq));
        if self.pending.len() != before {
            tracing::debug!(
                %budget_id,
                settled = before - self.pending.len(),
                "Dropped settled optimistic mutations"
            );
        }
    }
}

/// Budgets and their sub-caches, fetched through the budget API with
/// credentials from the [`TokenManager`].
///
/// Reads serve cached data while it is fresh. Concurrent reads of the same
/// `(budget, scope)` share one fetch. Every successful fetch is written to
/// the store so that other contexts can pick it up.
pub struct EntityCache {
    api: Arc<dyn BudgetApi>,
    auth: Arc<TokenManager>,
    store: Store,
    state: RwLock<CacheState>,
    fetch_locks: Mutex<HashMap<(Uuid, Scope), Arc<Mutex<()>>>>,
    budgets_lock: Mutex<()>,
    events: broadcast::Sender<CacheEvent>,
}

impl EntityCache {
    pub fn new(api: Arc<dyn BudgetApi>, auth: Arc<TokenManager>, store: Store) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            api,
            auth,
            store,
            state: RwLock::new(CacheState::default()),
            fetch_locks: Mutex::new(HashMap::new()),
            budgets_lock: Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Budgets of the user, fetched once per session unless invalidated.
    pub async fn list_budgets(&self) -> Result<Vec<CachedBudget>, CacheError> {
        let observed = {
            let state = self.state.read().await;
            if let (Some(budgets), false) = (&state.budgets.data, state.budgets.stale) {
                tracing::debug!("Budgets served from cache");
                return Ok(budgets.clone());
            }
            state.budgets.generation
        };

        let _guard = self.budgets_lock.lock().await;

        {
            let state = self.state.read().await;
            if state.budgets.generation != observed {
                if let Some(budgets) = &state.budgets.data {
                    tracing::debug!("Budgets fetched by a concurrent caller");
                    return Ok(budgets.clone());
                }
                if let Some(error) = &state.budgets.error {
                    return Err(error.clone().into());
                }
            }
        }

        self.hydrate_budgets().await;

        let token = self.auth.get_valid_access_token().await?;
        tracing::info!("Fetching budgets");
        match self.api.list_budgets(&token).await {
            Ok(budgets) => {
                let fetched_at = Utc::now();
                {
                    let mut state = self.state.write().await;
                    let seq = state.next_seq();
                    state.budgets.store(budgets.clone(), fetched_at, seq);
                }
                self.persist(
                    keys::BUDGETS,
                    &PersistedSlot {
                        fetched_at,
                        data: &budgets,
                    },
                )
                .await;
                self.emit(CacheEvent::BudgetsUpdated);
                Ok(budgets)
            }
            Err(ApiError::Unauthorized) => Err(self.unauthorized().await),
            Err(e) => {
                let error = FetchError::from(e);
                let last_known = {
                    let mut state = self.state.write().await;
                    state.budgets.fail(error.clone());
                    state.budgets.data.clone()
                };
                self.emit(CacheEvent::BudgetsFetchFailed(error.clone()));
                match last_known {
                    Some(budgets) => {
                        tracing::warn!(error = %error, "Budget fetch failed, serving last-known list");
                        Ok(budgets)
                    }
                    None => {
                        tracing::warn!(error = %error, "Budget fetch failed");
                        Err(error.into())
                    }
                }
            }
        }
    }

    pub async fn invalidate_budgets(&self) {
        self.state.write().await.budgets.stale = true;
        tracing::debug!("Budgets invalidated");
    }

    /// Budget chosen in the settings, else the first one.
    pub async fn selected_budget(&self) -> Result<Option<CachedBudget>, CacheError> {
        let budgets = self.list_budgets().await?;
        let selected = match SettingsStore::new(self.store.clone()).load().await {
            Ok(settings) => settings.budget_id,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read settings, using first budget");
                None
            }
        };

        Ok(selected
            .and_then(|id| budgets.iter().find(|b| b.id == id).cloned())
            .or_else(|| budgets.into_iter().next()))
    }

    pub async fn get_categories(
        &self,
        budget_id: Uuid,
        force_refresh: bool,
    ) -> Result<EntityMap<CachedCategory>, CacheError> {
        self.read_scope(budget_id, force_refresh).await
    }

    pub async fn get_accounts(
        &self,
        budget_id: Uuid,
        force_refresh: bool,
    ) -> Result<EntityMap<CachedAccount>, CacheError> {
        self.read_scope(budget_id, force_refresh).await
    }

    pub async fn get_payees(
        &self,
        budget_id: Uuid,
        force_refresh: bool,
    ) -> Result<EntityMap<CachedPayee>, CacheError> {
        self.read_scope(budget_id, force_refresh).await
    }

    pub async fn get_unapproved_transactions(
        &self,
        budget_id: Uuid,
        force_refresh: bool,
    ) -> Result<Vec<CachedTransaction>, CacheError> {
        self.read_scope(budget_id, force_refresh).await
    }

    /// Load every scope of a budget and return the resulting snapshot.
    pub async fn load_budget(
        &self,
        budget_id: Uuid,
        force_refresh: bool,
    ) -> Result<BudgetSnapshot, CacheError> {
        futures::try_join!(
            self.get_categories(budget_id, force_refresh),
            self.get_accounts(budget_id, force_refresh),
            self.get_payees(budget_id, force_refresh),
            self.get_unapproved_transactions(budget_id, force_refresh),
        )?;
        Ok(self.snapshot(budget_id).await)
    }

    /// Mark a scope stale. Its data stays visible until a fetch replaces it.
    pub async fn invalidate(&self, budget_id: Uuid, scope: Scope) {
        self.state.write().await.entry_mut(budget_id).mark_stale(scope);
        tracing::debug!(%budget_id, %scope, "Invalidated");
        self.emit(CacheEvent::Invalidated { budget_id, scope });
    }

    pub async fn is_stale(&self, budget_id: Uuid, scope: Scope) -> bool {
        let state = self.state.read().await;
        state
            .entries
            .get(&budget_id)
            .is_some_and(|entry| entry.status(scope).1)
    }

    pub async fn last_error(&self, budget_id: Uuid, scope: Scope) -> Option<FetchError> {
        let state = self.state.read().await;
        state
            .entries
            .get(&budget_id)
            .and_then(|entry| entry.status(scope).2.cloned())
    }

    /// What is cached for a budget right now, without fetching.
    pub async fn snapshot(&self, budget_id: Uuid) -> BudgetSnapshot {
        let state = self.state.read().await;
        let mut fetched_at = BTreeMap::new();
        let mut stale = Vec::new();
        let mut errors = Vec::new();
        let revision = match state.entries.get(&budget_id) {
            Some(entry) => {
                for scope in Scope::ALL {
                    let (at, is_stale, error) = entry.status(scope);
                    if let Some(at) = at {
                        fetched_at.insert(scope, at);
                    }
                    if is_stale {
                        stale.push(scope);
                    }
                    if let Some(error) = error {
                        errors.push((scope, error.clone()));
                    }
                }
                entry.revision
            }
            None => 0,
        };

        BudgetSnapshot {
            budget_id,
            version: SnapshotVersion {
                budget_id,
                revision,
            },
            categories: state.view(budget_id).unwrap_or_default(),
            accounts: state.view(budget_id).unwrap_or_default(),
            payees: state.view(budget_id).unwrap_or_default(),
            transactions: state.view(budget_id).unwrap_or_default(),
            fetched_at,
            stale,
            errors,
        }
    }

    /// Lay a tentative balance change over the cached data.
    pub async fn apply_pending(&self, budget_id: Uuid, delta: BalanceDelta) -> MutationId {
        let mutation = PendingMutation::tentative(budget_id, delta);
        let id = mutation.id;
        {
            let mut state = self.state.write().await;
            state.pending.push(mutation);
            state.touch(budget_id);
        }
        tracing::debug!(%budget_id, ?id, "Applied optimistic mutation");
        self.emit(CacheEvent::PendingChanged { budget_id });
        id
    }

    /// Replace a tentative change with the server's record. It stops
    /// applying once the affected scopes are refetched.
    pub async fn confirm_pending(&self, id: MutationId, transaction: &CachedTransaction) {
        let budget_id = {
            let mut state = self.state.write().await;
            let seq = state.next_seq();
            let Some(mutation) = state.pending.iter_mut().find(|m| m.id == id) else {
                return;
            };
            mutation.confirm(transaction, seq);
            let budget_id = mutation.budget_id;
            state.touch(budget_id);
            budget_id
        };
        tracing::debug!(%budget_id, ?id, transaction_id = %transaction.id, "Confirmed optimistic mutation");
        self.emit(CacheEvent::PendingChanged { budget_id });
    }

    /// Remove a tentative change, restoring the previous view exactly.
    pub async fn rollback_pending(&self, id: MutationId) -> bool {
        let budget_id = {
            let mut state = self.state.write().await;
            let Some(index) = state.pending.iter().position(|m| m.id == id) else {
                return false;
            };
            let mutation = state.pending.remove(index);
            state.touch(mutation.budget_id);
            mutation.budget_id
        };
        tracing::warn!(%budget_id, ?id, "Rolled back optimistic mutation");
        self.emit(CacheEvent::PendingChanged { budget_id });
        true
    }

    /// Mutations of a budget not yet acknowledged by the server.
    pub async fn tentative_count(&self, budget_id: Uuid) -> usize {
        let state = self.state.read().await;
        state
            .pending_for(budget_id)
            .iter()
            .filter(|m| m.is_tentative())
            .count()
    }

    /// The single refetch that follows a successful mutation.
    ///
    /// Fetches already in flight may predate the mutation, so only data
    /// from a fetch started after this call is accepted.
    pub async fn refresh_after_mutation(&self, budget_id: Uuid) {
        for scope in [Scope::Accounts, Scope::Categories, Scope::Transactions] {
            self.invalidate(budget_id, scope).await;
        }
        let since = self.state.read().await.seq + 1;

        let (accounts, categories, transactions) = tokio::join!(
            self.read_scope_since::<EntityMap<CachedAccount>>(budget_id, since),
            self.read_scope_since::<EntityMap<CachedCategory>>(budget_id, since),
            self.read_scope_since::<Vec<CachedTransaction>>(budget_id, since),
        );
        for (scope, result) in [
            (Scope::Accounts, accounts.map(|_| ())),
            (Scope::Categories, categories.map(|_| ())),
            (Scope::Transactions, transactions.map(|_| ())),
        ] {
            if let Err(e) = result {
                tracing::warn!(%budget_id, %scope, error = %e, "Refetch after mutation failed");
            }
        }
    }

    /// Re-derive slots from cache writes made by other contexts.
    pub fn spawn_store_listener(self: &Arc<Self>) -> WatchHandle {
        let cache = Arc::downgrade(self);
        let own_context = self.store.context();
        let mut scope_changes = self.store.subscribe_prefix(keys::CACHE_PREFIX);
        let mut budget_changes = self.store.subscribe(keys::BUDGETS);

        WatchHandle::new(tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    Some(change) = scope_changes.recv() => change,
                    Some(change) = budget_changes.recv() => change,
                    else => break,
                };
                if change.origin == own_context {
                    continue;
                }
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.apply_remote(change).await;
            }
        }))
    }

    async fn read_scope<T: ScopeData>(
        &self,
        budget_id: Uuid,
        force_refresh: bool,
    ) -> Result<T, CacheError> {
        self.read_scope_inner(budget_id, force_refresh, 0).await
    }

    /// Read a scope, accepting only data from a fetch started at `since` or
    /// later. Never served from the store.
    async fn read_scope_since<T: ScopeData>(
        &self,
        budget_id: Uuid,
        since: u64,
    ) -> Result<T, CacheError> {
        self.read_scope_inner(budget_id, false, since).await
    }

    async fn read_scope_inner<T: ScopeData>(
        &self,
        budget_id: Uuid,
        force_refresh: bool,
        since: u64,
    ) -> Result<T, CacheError> {
        let scope = T::SCOPE;
        let observed = {
            let state = self.state.read().await;
            if !force_refresh {
                if let Some(data) = state.fresh_view::<T>(budget_id, since) {
                    tracing::debug!(%budget_id, %scope, "Cache hit");
                    return Ok(data);
                }
            }
            state.generation::<T>(budget_id)
        };

        let lock = self.fetch_lock(budget_id, scope).await;
        let _guard = lock.lock().await;

        {
            let state = self.state.read().await;
            // A fetch that started too early cannot be joined
            if state.generation::<T>(budget_id) != observed
                && state.fetch_seq::<T>(budget_id) >= since
            {
                if let Some(data) = state.view::<T>(budget_id) {
                    tracing::debug!(%budget_id, %scope, "Joined concurrent fetch");
                    return Ok(data);
                }
                let error = state
                    .entries
                    .get(&budget_id)
                    .and_then(|entry| T::slot(entry).error.clone());
                if let Some(error) = error {
                    return Err(error.into());
                }
            }
        }

        if !force_refresh && since == 0 && self.hydrate::<T>(budget_id).await {
            if let Some(data) = self.state.read().await.fresh_view::<T>(budget_id, 0) {
                return Ok(data);
            }
        }

        self.fetch_scope(budget_id).await
    }

    async fn fetch_scope<T: ScopeData>(&self, budget_id: Uuid) -> Result<T, CacheError> {
        let scope = T::SCOPE;
        let token = self.auth.get_valid_access_token().await?;
        let started = self.state.write().await.next_seq();

        tracing::info!(%budget_id, %scope, "Fetching");
        match T::fetch(self.api.as_ref(), &token, budget_id).await {
            Ok(data) => {
                let fetched_at = Utc::now();
                let view = {
                    let mut state = self.state.write().await;
                    let entry = state.entry_mut(budget_id);
                    T::slot_mut(entry).store(data.clone(), fetched_at, started);
                    entry.revision += 1;
                    state.prune_settled(budget_id);
                    state.view::<T>(budget_id)
                };
                self.persist(
                    &keys::cache(budget_id, scope.as_str()),
                    &PersistedSlot {
                        fetched_at,
                        data: &data,
                    },
                )
                .await;
                self.emit(CacheEvent::Updated { budget_id, scope });
                Ok(view.unwrap_or(data))
            }
            Err(ApiError::Unauthorized) => Err(self.unauthorized().await),
            Err(e) => {
                let error = FetchError::from(e);
                let last_known = {
                    let mut state = self.state.write().await;
                    let entry = state.entry_mut(budget_id);
                    T::slot_mut(entry).fail(error.clone());
                    entry.revision += 1;
                    state.view::<T>(budget_id)
                };
                self.emit(CacheEvent::FetchFailed {
                    budget_id,
                    scope,
                    error: error.clone(),
                });
                match last_known {
                    Some(data) => {
                        tracing::warn!(%budget_id, %scope, error = %error, "Fetch failed, serving last-known data");
                        Ok(data)
                    }
                    None => {
                        tracing::warn!(%budget_id, %scope, error = %error, "Fetch failed");
                        Err(error.into())
                    }
                }
            }
        }
    }

    /// Fill an empty slot from the store. True if data was installed.
    async fn hydrate<T: ScopeData>(&self, budget_id: Uuid) -> bool {
        let scope = T::SCOPE;
        let key = keys::cache(budget_id, scope.as_str());
        let persisted = match self.store.get::<PersistedSlot<T>>(&key).await {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(%key, error = %e, "Ignoring unreadable cache entry");
                return false;
            }
        };

        let mut state = self.state.write().await;
        let entry = state.entry_mut(budget_id);
        let slot = T::slot_mut(entry);
        if slot.data.is_some() {
            return false;
        }
        slot.store(persisted.data, persisted.fetched_at, 0);
        entry.revision += 1;
        tracing::debug!(%budget_id, %scope, "Hydrated from store");
        true
    }

    async fn hydrate_budgets(&self) {
        if self.state.read().await.budgets.data.is_some() {
            return;
        }
        match self
            .store
            .get::<PersistedSlot<Vec<CachedBudget>>>(keys::BUDGETS)
            .await
        {
            Ok(Some(persisted)) => {
                let mut state = self.state.write().await;
                if state.budgets.data.is_none() {
                    // Fallback only: the list is still fetched once per session
                    state.budgets.data = Some(persisted.data);
                    state.budgets.fetched_at = Some(persisted.fetched_at);
                    state.budgets.stale = true;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Ignoring unreadable budget list"),
        }
    }

    async fn apply_remote(&self, change: StorageChange) {
        if change.key == keys::BUDGETS {
            match change.decode::<PersistedSlot<Vec<CachedBudget>>>() {
                Ok(Some(persisted)) => {
                    {
                        let mut state = self.state.write().await;
                        let seq = state.next_seq();
                        state
                            .budgets
                            .store(persisted.data, persisted.fetched_at, seq);
                    }
                    self.emit(CacheEvent::BudgetsUpdated);
                }
                Ok(None) => self.invalidate_budgets().await,
                Err(e) => tracing::warn!(error = %e, "Ignoring undecodable budget list"),
            }
            return;
        }

        let Some((budget_id, scope)) = keys::parse_cache(&change.key)
            .and_then(|(budget_id, scope)| Some((budget_id, Scope::parse(scope)?)))
        else {
            return;
        };
        match scope {
            Scope::Categories => {
                self.apply_remote_scope::<EntityMap<CachedCategory>>(budget_id, &change)
                    .await
            }
            Scope::Accounts => {
                self.apply_remote_scope::<EntityMap<CachedAccount>>(budget_id, &change)
                    .await
            }
            Scope::Payees => {
                self.apply_remote_scope::<EntityMap<CachedPayee>>(budget_id, &change)
                    .await
            }
            Scope::Transactions => {
                self.apply_remote_scope::<Vec<CachedTransaction>>(budget_id, &change)
                    .await
            }
        }
    }

    async fn apply_remote_scope<T: ScopeData>(&self, budget_id: Uuid, change: &StorageChange) {
        let scope = T::SCOPE;
        match change.decode::<PersistedSlot<T>>() {
            Ok(Some(persisted)) => {
                {
                    let mut state = self.state.write().await;
                    let seq = state.next_seq();
                    let entry = state.entry_mut(budget_id);
                    T::slot_mut(entry).store(persisted.data, persisted.fetched_at, seq);
                    entry.revision += 1;
                    state.prune_settled(budget_id);
                }
                tracing::debug!(%budget_id, %scope, origin = %change.origin, "Applied remote cache write");
                self.emit(CacheEvent::Updated { budget_id, scope });
            }
            Ok(None) => self.invalidate(budget_id, scope).await,
            Err(e) => tracing::warn!(%budget_id, %scope, error = %e, "Ignoring undecodable cache write"),
        }
    }

    async fn fetch_lock(&self, budget_id: Uuid, scope: Scope) -> Arc<Mutex<()>> {
        let mut locks = self.fetch_locks.lock().await;
        Arc::clone(locks.entry((budget_id, scope)).or_default())
    }

    async fn persist<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(e) = self.store.set(key, value).await {
            tracing::warn!(key, error = %e, "Could not persist cache entry");
        }
    }

    async fn unauthorized(&self) -> CacheError {
        self.auth.handle_unauthorized().await;
        CacheError::Auth(AuthError::Unauthenticated)
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.events.send(event);
    }
}
