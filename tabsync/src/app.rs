use crate::alerts::{AlertsMemo, BudgetAlerts};
use crate::api::BudgetApi;
use crate::auth::{AuthError, RefreshScheduler, TokenManager};
use crate::cache::{CacheError, EntityCache};
use crate::draft::TxDraftMachine;
use crate::navigation::Navigator;
use crate::settings::SettingsStore;
use crate::storage::{Store, WatchHandle};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tabsync_auth::TokenEndpoint;
use uuid::Uuid;

/// The core components of one execution context, wired together.
///
/// Background listeners and the refresh scheduler run for as long as the
/// `App` is alive.
pub struct App {
    pub store: Store,
    pub auth: Arc<TokenManager>,
    pub cache: Arc<EntityCache>,
    pub settings: SettingsStore,
    pub navigator: Navigator,
    api: Arc<dyn BudgetApi>,
    alerts: AlertsMemo,
    _listeners: [WatchHandle; 2],
    _scheduler: RefreshScheduler,
}

impl App {
    pub async fn open(
        store: Store,
        endpoint: Arc<dyn TokenEndpoint>,
        api: Arc<dyn BudgetApi>,
        safety_margin: Duration,
    ) -> Result<Self, AuthError> {
        let auth = TokenManager::open(store.clone(), endpoint, safety_margin).await?;
        let cache = Arc::new(EntityCache::new(api.clone(), auth.clone(), store.clone()));
        let navigator = Navigator::open(store.clone()).await;

        let listeners = [auth.spawn_store_listener(), cache.spawn_store_listener()];
        let scheduler = auth.spawn_refresh_scheduler();
        tracing::info!(context = %store.context(), logged_in = auth.is_logged_in(), "Context opened");

        Ok(Self {
            settings: SettingsStore::new(store.clone()),
            store,
            auth,
            cache,
            navigator,
            api,
            alerts: AlertsMemo::new(),
            _listeners: listeners,
            _scheduler: scheduler,
        })
    }

    /// Draft machine for `budget_id`, resumed from the persisted draft.
    pub async fn drafts(&self, budget_id: Uuid) -> Arc<TxDraftMachine> {
        TxDraftMachine::open(
            self.store.clone(),
            self.cache.clone(),
            self.auth.clone(),
            self.api.clone(),
            budget_id,
        )
        .await
    }

    /// Load a budget and derive its alerts with the current settings.
    pub async fn alerts(&self, budget_id: Uuid) -> Result<Arc<BudgetAlerts>, CacheError> {
        let snapshot = self.cache.load_budget(budget_id, false).await?;
        let settings = self.settings.load().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not read settings, using defaults");
            Default::default()
        });
        Ok(self.alerts.get(&snapshot, &settings, Utc::now()))
    }
}
