use super::{AuthError, AuthStatus, LogoutReason};
use crate::storage::{keys, StorageError, Store, WatchHandle};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabsync_auth::{TokenData, TokenEndpoint};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Refresh this long before the access token expires.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Back-off after the scheduler failed to reach the token endpoint.
const RETRY_DELAY: Duration = Duration::from_secs(30);
const MIN_RESCHEDULE: Duration = Duration::from_millis(100);

/// Owns the OAuth token lifecycle.
///
/// The persisted `tokenData` is the only copy of the credentials: every
/// operation reads it from the store so that all contexts agree on it.
pub struct TokenManager {
    store: Store,
    endpoint: Arc<dyn TokenEndpoint>,
    safety_margin: chrono::Duration,
    refresh_lock: Mutex<RefreshOutcome>,
    /// Refresh attempts finished so far, readable without the lock
    refresh_attempts: AtomicU64,
    status: watch::Sender<AuthStatus>,
}

/// Result of the last finished refresh attempt.
#[derive(Default)]
struct RefreshOutcome {
    error: Option<AuthError>,
}

impl TokenManager {
    pub async fn open(
        store: Store,
        endpoint: Arc<dyn TokenEndpoint>,
        safety_margin: Duration,
    ) -> Result<Arc<Self>, AuthError> {
        let (status, _) = watch::channel(AuthStatus::LoggedOut { reason: None });
        let manager = Arc::new(Self {
            store,
            endpoint,
            safety_margin: chrono::Duration::from_std(safety_margin)
                .unwrap_or(chrono::Duration::MAX),
            refresh_lock: Mutex::new(RefreshOutcome::default()),
            refresh_attempts: AtomicU64::new(0),
            status,
        });

        if manager.load_token().await?.is_some() {
            manager.status.send_replace(AuthStatus::LoggedIn);
        }
        Ok(manager)
    }

    pub fn status(&self) -> AuthStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthStatus> {
        self.status.subscribe()
    }

    pub fn is_logged_in(&self) -> bool {
        self.status().is_logged_in()
    }

    pub async fn current_token(&self) -> Result<Option<TokenData>, AuthError> {
        self.load_token().await
    }

    /// Exchange an authorization code for a token pair and persist it.
    pub async fn acquire(&self, code: &str, redirect_uri: &str) -> Result<TokenData, AuthError> {
        let _guard = self.refresh_lock.lock().await;

        let response = self
            .endpoint
            .exchange_code(code, redirect_uri)
            .await
            .map_err(|e| {
                let error = AuthError::from_exchange(e);
                tracing::warn!(error = %error, "Authorization code exchange failed");
                error
            })?;

        let token = TokenData::from_response(response, Utc::now());
        self.store.set(keys::TOKEN_DATA, &token).await?;
        self.status.send_replace(AuthStatus::LoggedIn);
        tracing::info!(expires_at = %token.expires_at(), "Logged in");
        Ok(token)
    }

    /// Exchange `refresh_token` for a new token pair.
    ///
    /// If another caller already rotated `refresh_token` while this one
    /// waited, the token it stored is returned instead of spending the old
    /// refresh token again.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenData, AuthError> {
        let mut outcome = self.refresh_lock.lock().await;

        if let Some(current) = self.load_token().await? {
            if current.refresh_token != refresh_token && self.is_fresh(&current) {
                tracing::debug!("Refresh token already rotated, reusing stored token");
                return Ok(current);
            }
        }
        self.refresh_locked(&mut outcome, refresh_token).await
    }

    /// An access token valid for at least the safety margin.
    ///
    /// At most one refresh is in flight: callers that arrive while it runs
    /// wait for it and share its outcome, the token it stored or its error.
    pub async fn get_valid_access_token(&self) -> Result<String, AuthError> {
        let token = self.load_token().await?.ok_or(AuthError::Unauthenticated)?;
        if self.is_fresh(&token) {
            return Ok(token.access_token);
        }

        let attempts_seen = self.refresh_attempts.load(Ordering::SeqCst);
        let mut outcome = self.refresh_lock.lock().await;

        if self.refresh_attempts.load(Ordering::SeqCst) != attempts_seen {
            if let Some(error) = &outcome.error {
                tracing::debug!(error = %error, "Concurrent refresh failed, sharing its error");
                return Err(error.clone());
            }
        }

        let token = self.load_token().await?.ok_or(AuthError::Unauthenticated)?;
        if self.is_fresh(&token) {
            tracing::debug!("Token refreshed by a concurrent caller");
            return Ok(token.access_token);
        }

        tracing::debug!(expires_at = %token.expires_at(), "Access token due, refreshing");
        let refreshed = self.refresh_locked(&mut outcome, &token.refresh_token).await?;
        Ok(refreshed.access_token)
    }

    /// The data API rejected the access token.
    pub async fn handle_unauthorized(&self) {
        tracing::warn!("API rejected the access token, logging out");
        if let Err(e) = self.clear(LogoutReason::Unauthorized).await {
            tracing::warn!(error = %e, "Failed to clear token after 401");
        }
    }

    pub async fn logout(&self) -> Result<(), AuthError> {
        tracing::info!("Logging out");
        self.clear(LogoutReason::Requested).await
    }

    /// Keep the status in step with token writes made by other contexts.
    pub fn spawn_store_listener(self: &Arc<Self>) -> WatchHandle {
        let manager = Arc::downgrade(self);
        let own_context = self.store.context();

        self.store.watch(keys::TOKEN_DATA, move |change| {
            if change.origin == own_context {
                return;
            }
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let status = match change.new_value {
                Some(_) => AuthStatus::LoggedIn,
                None => AuthStatus::LoggedOut {
                    reason: Some(LogoutReason::ClearedElsewhere),
                },
            };
            tracing::debug!(?status, origin = %change.origin, "Token changed in another context");
            manager.status.send_replace(status);
        })
    }

    /// Refresh ahead of expiry in the background.
    ///
    /// The scheduler goes through [`get_valid_access_token`](Self::get_valid_access_token),
    /// so it shares the refresh lock with API callers.
    pub fn spawn_refresh_scheduler(self: &Arc<Self>) -> RefreshScheduler {
        let manager = Arc::downgrade(self);
        let mut status = self.status.subscribe();

        let task = tokio::spawn(async move {
            loop {
                let Some(this) = manager.upgrade() else {
                    break;
                };
                let wait = match this.load_token().await {
                    Ok(Some(token)) => Some(until(token.refresh_due_at(this.safety_margin))),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!(error = %e, "Refresh scheduler could not read token");
                        Some(RETRY_DELAY)
                    }
                };
                drop(this);

                let Some(wait) = wait else {
                    // Logged out: wait for a login
                    if status.changed().await.is_err() {
                        break;
                    }
                    continue;
                };

                tokio::select! {
                    _ = tokio::time::sleep(wait.max(MIN_RESCHEDULE)) => {
                        let Some(this) = manager.upgrade() else {
                            break;
                        };
                        let result = this.get_valid_access_token().await;
                        drop(this);
                        match result {
                            Ok(_) | Err(AuthError::Unauthenticated) => {}
                            Err(e) if e.is_terminal() => {}
                            Err(e) => {
                                tracing::warn!(error = %e, "Scheduled refresh failed, retrying later");
                                tokio::time::sleep(RETRY_DELAY).await;
                            }
                        }
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        RefreshScheduler { task }
    }

    fn is_fresh(&self, token: &TokenData) -> bool {
        token.is_fresh(Utc::now(), self.safety_margin)
    }

    /// Must be called with the refresh lock held; `outcome` is its guard.
    async fn refresh_locked(
        &self,
        outcome: &mut RefreshOutcome,
        refresh_token: &str,
    ) -> Result<TokenData, AuthError> {
        let result = self.request_refresh(refresh_token).await;
        outcome.error = result.as_ref().err().cloned();
        self.refresh_attempts.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenData, AuthError> {
        match self.endpoint.exchange_refresh_token(refresh_token).await {
            Ok(response) => {
                let token = TokenData::from_response(response, Utc::now());
                self.store.set(keys::TOKEN_DATA, &token).await?;
                self.status.send_replace(AuthStatus::LoggedIn);
                tracing::info!(expires_at = %token.expires_at(), "Access token refreshed");
                Ok(token)
            }
            Err(e) => {
                let error = AuthError::from_refresh(e);
                if error.is_terminal() {
                    tracing::error!(error = %error, "Refresh token rejected, logging out");
                    if let Err(e) = self.clear(LogoutReason::RefreshRejected).await {
                        tracing::warn!(error = %e, "Failed to clear rejected token");
                    }
                } else {
                    tracing::warn!(error = %error, "Token refresh failed, keeping token");
                }
                Err(error)
            }
        }
    }

    async fn load_token(&self) -> Result<Option<TokenData>, AuthError> {
        match self.store.get::<TokenData>(keys::TOKEN_DATA).await {
            Ok(token) => Ok(token),
            Err(StorageError::Corrupt { source, .. }) => {
                tracing::warn!(error = %source, "Stored token is corrupt, discarding it");
                self.store.remove(keys::TOKEN_DATA).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self, reason: LogoutReason) -> Result<(), AuthError> {
        self.status.send_replace(AuthStatus::LoggedOut {
            reason: Some(reason),
        });
        self.store.remove(keys::TOKEN_DATA).await?;
        Ok(())
    }
}

fn until(instant: DateTime<Utc>) -> Duration {
    (instant - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Handle on the background refresh task; dropping it stops the task.
pub struct RefreshScheduler {
    task: JoinHandle<()>,
}

impl RefreshScheduler {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryArea;
    use crate::testing::{token_expiring_in, MockFailure, MockTokenEndpoint};

    async fn manager_with(
        token: Option<TokenData>,
        endpoint: Arc<MockTokenEndpoint>,
    ) -> (Store, Arc<TokenManager>) {
        let store = Store::new(Arc::new(MemoryArea::new()));
        if let Some(token) = token {
            store.set(keys::TOKEN_DATA, &token).await.unwrap();
        }
        let manager = TokenManager::open(store.clone(), endpoint, SAFETY_MARGIN)
            .await
            .unwrap();
        (store, manager)
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let endpoint = Arc::new(MockTokenEndpoint::new());
        let token = token_expiring_in(3600);
        let (_, manager) = manager_with(Some(token.clone()), endpoint.clone()).await;

        assert!(manager.is_logged_in());
        assert_eq!(manager.get_valid_access_token().await.unwrap(), token.access_token);
        assert_eq!(endpoint.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn token_inside_margin_is_refreshed_and_persisted() {
        let endpoint = Arc::new(MockTokenEndpoint::new());
        let (store, manager) = manager_with(Some(token_expiring_in(30)), endpoint.clone()).await;

        let access = manager.get_valid_access_token().await.unwrap();
        assert_eq!(endpoint.refresh_calls(), 1);

        let stored: TokenData = store.get(keys::TOKEN_DATA).await.unwrap().unwrap();
        assert_eq!(stored.access_token, access);
        assert!(stored.expires > Utc::now().timestamp_millis());
    }

    #[tokio::test]
    async fn missing_token_is_unauthenticated() {
        let endpoint = Arc::new(MockTokenEndpoint::new());
        let (_, manager) = manager_with(None, endpoint).await;

        assert!(!manager.is_logged_in());
        let err = manager.get_valid_access_token().await.unwrap_err();
        assert_eq!(err.reason(), "unauthenticated");
    }

    #[tokio::test]
    async fn rejected_refresh_logs_out() {
        let endpoint = Arc::new(MockTokenEndpoint::new());
        endpoint.fail_with(Some(MockFailure::Rejected(400)));
        let (store, manager) = manager_with(Some(token_expiring_in(-1)), endpoint.clone()).await;

        let err = manager.get_valid_access_token().await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(_)));
        assert_eq!(
            manager.status(),
            AuthStatus::LoggedOut {
                reason: Some(LogoutReason::RefreshRejected)
            }
        );
        assert_eq!(store.get::<TokenData>(keys::TOKEN_DATA).await.unwrap(), None);

        // Never retried with the rejected token
        let err = manager.get_valid_access_token().await.unwrap_err();
        assert_eq!(err, AuthError::Unauthenticated);
        assert_eq!(endpoint.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn unreachable_endpoint_keeps_token() {
        let endpoint = Arc::new(MockTokenEndpoint::new());
        endpoint.fail_with(Some(MockFailure::Network));
        let token = token_expiring_in(-1);
        let (store, manager) = manager_with(Some(token.clone()), endpoint).await;

        let err = manager.get_valid_access_token().await.unwrap_err();
        assert!(matches!(err, AuthError::Network(_)));
        assert!(manager.is_logged_in());
        assert_eq!(store.get(keys::TOKEN_DATA).await.unwrap(), Some(token));
    }

    #[tokio::test]
    async fn acquire_persists_token() {
        let endpoint = Arc::new(MockTokenEndpoint::new());
        let (store, manager) = manager_with(None, endpoint.clone()).await;

        let token = manager.acquire("code-1", "https://ext/cb").await.unwrap();
        assert!(manager.is_logged_in());
        assert_eq!(endpoint.exchange_calls(), 1);
        assert_eq!(store.get(keys::TOKEN_DATA).await.unwrap(), Some(token));
    }

    #[tokio::test]
    async fn rejected_code_is_exchange_failed() {
        let endpoint = Arc::new(MockTokenEndpoint::new());
        endpoint.fail_with(Some(MockFailure::Rejected(401)));
        let (_, manager) = manager_with(None, endpoint).await;

        let err = manager.acquire("bad", "https://ext/cb").await.unwrap_err();
        assert_eq!(err.reason(), "exchange_failed");
        assert!(!manager.is_logged_in());
    }

    #[tokio::test]
    async fn stale_refresh_token_reuses_rotated_token() {
        let endpoint = Arc::new(MockTokenEndpoint::new());
        let old = token_expiring_in(-1);
        let (_, manager) = manager_with(Some(old.clone()), endpoint.clone()).await;

        let first = manager.refresh(&old.refresh_token).await.unwrap();
        let second = manager.refresh(&old.refresh_token).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(endpoint.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn unauthorized_and_logout_clear_token() {
        let endpoint = Arc::new(MockTokenEndpoint::new());
        let (store, manager) = manager_with(Some(token_expiring_in(3600)), endpoint).await;

        manager.handle_unauthorized().await;
        assert_eq!(
            manager.status(),
            AuthStatus::LoggedOut {
                reason: Some(LogoutReason::Unauthorized)
            }
        );
        assert_eq!(store.get::<TokenData>(keys::TOKEN_DATA).await.unwrap(), None);

        store
            .set(keys::TOKEN_DATA, &token_expiring_in(3600))
            .await
            .unwrap();
        manager.logout().await.unwrap();
        assert_eq!(store.get::<TokenData>(keys::TOKEN_DATA).await.unwrap(), None);
    }

    #[tokio::test]
    async fn logout_in_other_context_is_observed() {
        let endpoint = Arc::new(MockTokenEndpoint::new());
        let (store, manager) = manager_with(Some(token_expiring_in(3600)), endpoint).await;
        let _listener = manager.spawn_store_listener();
        let mut status = manager.subscribe();

        store.new_context().remove(keys::TOKEN_DATA).await.unwrap();

        status.changed().await.unwrap();
        assert_eq!(
            *status.borrow(),
            AuthStatus::LoggedOut {
                reason: Some(LogoutReason::ClearedElsewhere)
            }
        );
    }

    #[tokio::test]
    async fn scheduler_refreshes_before_expiry() {
        let endpoint = Arc::new(MockTokenEndpoint::new());
        // Due 200ms from now
        let token = TokenData {
            expires: (Utc::now() + chrono::Duration::milliseconds(60_200)).timestamp_millis(),
            ..token_expiring_in(0)
        };
        let (_, manager) = manager_with(Some(token), endpoint.clone()).await;

        let _scheduler = manager.spawn_refresh_scheduler();
        for _ in 0..60 {
            if endpoint.refresh_calls() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(endpoint.refresh_calls(), 1);
    }
}
