use super::{StorageArea, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Identity of one execution context (popup, options page, background).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A write that landed in the shared area.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub key: String,
    /// JSON text now stored at `key`, `None` after a removal
    pub new_value: Option<String>,
    pub origin: ContextId,
}

impl StorageChange {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, StorageError> {
        decode(&self.key, self.new_value.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Typed handle on the shared storage area for one execution context.
///
/// Clones belong to the same context; use [`Store::new_context`] for a
/// handle that acts as a different one.
#[derive(Clone)]
pub struct Store {
    area: Arc<dyn StorageArea>,
    context: ContextId,
    write_lock: Arc<Mutex<()>>,
    retry: RetryPolicy,
}

impl Store {
    pub fn new(area: Arc<dyn StorageArea>) -> Self {
        Self {
            area,
            context: ContextId::new(),
            write_lock: Arc::new(Mutex::new(())),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Handle on the same area acting as another execution context.
    pub fn new_context(&self) -> Self {
        Self {
            area: Arc::clone(&self.area),
            context: ContextId::new(),
            write_lock: Arc::new(Mutex::new(())),
            retry: self.retry,
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let raw = self.get_raw(key).await?;
        decode(key, raw.as_deref())
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.retrying(key, || self.area.read(key)).await
    }

    /// Replace the whole value at `key`.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_string(value).map_err(|source| StorageError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.write(key, Some(json)).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.write(key, None).await
    }

    async fn write(&self, key: &str, value: Option<String>) -> Result<(), StorageError> {
        // Same-key writes from this context land in call order
        let _guard = self.write_lock.lock().await;

        self.retrying(key, || self.area.write(key, value.clone()))
            .await?;

        let change = StorageChange {
            key: key.to_string(),
            new_value: value,
            origin: self.context,
        };
        // No receivers is fine
        let _ = self.area.notifier().send(change);
        Ok(())
    }

    async fn retrying<T, F, Fut>(&self, key: &str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::debug!(key, attempt, error = %e, "Storage unavailable, retrying");
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(key, attempts, error = %e, "Storage still unavailable, giving up");
                    return Err(e);
                }
                result => return result,
            }
        }
    }

    /// Changes to exactly `key`, from every context including this one.
    pub fn subscribe(&self, key: &str) -> Subscription {
        Subscription {
            receiver: self.area.notifier().subscribe(),
            filter: Filter::Key(key.to_string()),
        }
    }

    /// Changes to every key starting with `prefix`.
    pub fn subscribe_prefix(&self, prefix: &str) -> Subscription {
        Subscription {
            receiver: self.area.notifier().subscribe(),
            filter: Filter::Prefix(prefix.to_string()),
        }
    }

    /// Run `listener` for every change to `key` until the handle is dropped.
    pub fn watch<F>(&self, key: &str, mut listener: F) -> WatchHandle
    where
        F: FnMut(StorageChange) + Send + 'static,
    {
        let mut subscription = self.subscribe(key);
        WatchHandle::new(tokio::spawn(async move {
            while let Some(change) = subscription.recv().await {
                listener(change);
            }
        }))
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: Option<&str>) -> Result<Option<T>, StorageError> {
    raw.map(|json| {
        serde_json::from_str(json).map_err(|source| StorageError::Corrupt {
            key: key.to_string(),
            source,
        })
    })
    .transpose()
}

#[derive(Debug)]
enum Filter {
    Key(String),
    Prefix(String),
}

impl Filter {
    fn matches(&self, key: &str) -> bool {
        match self {
            Filter::Key(k) => k == key,
            Filter::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

/// Stream of storage changes. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<StorageChange>,
    filter: Filter,
}

impl Subscription {
    /// Next matching change, `None` once the area is gone.
    pub async fn recv(&mut self) -> Option<StorageChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) if self.filter.matches(&change.key) => return Some(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, filter = ?self.filter, "Storage subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Background listener; stops when unsubscribed or dropped.
#[derive(Debug)]
pub struct WatchHandle {
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn unsubscribe(self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryArea;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        name: String,
        count: u32,
    }

    fn store() -> (MemoryArea, Store) {
        let area = MemoryArea::new();
        let store = Store::new(Arc::new(area.clone())).with_retry(RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        });
        (area, store)
    }

    #[tokio::test]
    async fn set_replaces_whole_value() {
        let (_, store) = store();
        store
            .set("entry", &Entry { name: "a".into(), count: 1 })
            .await
            .unwrap();
        store
            .set("entry", &Entry { name: "b".into(), count: 2 })
            .await
            .unwrap();

        let entry: Option<Entry> = store.get("entry").await.unwrap();
        assert_eq!(entry, Some(Entry { name: "b".into(), count: 2 }));

        store.remove("entry").await.unwrap();
        assert_eq!(store.get::<Entry>("entry").await.unwrap(), None);
    }

    #[tokio::test]
    async fn undecodable_value_is_corrupt() {
        let (_, store) = store();
        store.set("entry", &"just a string").await.unwrap();

        let err = store.get::<Entry>("entry").await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { ref key, .. } if key == "entry"));
    }

    #[tokio::test]
    async fn other_contexts_see_writes() {
        let (_, popup) = store();
        let background = popup.new_context();
        let mut subscription = background.subscribe("settings");

        popup.set("unrelated", &1).await.unwrap();
        popup.set("settings", &true).await.unwrap();

        let change = subscription.recv().await.unwrap();
        assert_eq!(change.key, "settings");
        assert_eq!(change.origin, popup.context());
        assert_ne!(change.origin, background.context());
        assert_eq!(change.decode::<bool>().unwrap(), Some(true));
        assert_eq!(background.get::<bool>("settings").await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn prefix_subscription_filters_keys() {
        let (_, store) = store();
        let mut subscription = store.subscribe_prefix("cache.");

        store.set("settings", &1).await.unwrap();
        store.set("cache.a.accounts", &2).await.unwrap();

        let change = subscription.recv().await.unwrap();
        assert_eq!(change.key, "cache.a.accounts");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (area, store) = store();
        area.fail_next(2);

        store.set("entry", &7).await.unwrap();
        assert_eq!(store.get::<i32>("entry").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn unavailable_after_last_attempt() {
        let (area, store) = store();
        area.set_available(false);

        let err = store.set("entry", &7).await.unwrap_err();
        assert!(err.is_transient());

        area.set_available(true);
        assert_eq!(store.get::<i32>("entry").await.unwrap(), None);
    }

    #[tokio::test]
    async fn watch_stops_after_unsubscribe() {
        let (_, store) = store();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = store.watch("navigation", move |change| {
            let _ = tx.send(change.new_value);
        });

        store.set("navigation", &"main").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some("\"main\"".to_string()));

        handle.unsubscribe();
        store.set("navigation", &"addTx").await.unwrap();
        // Sender lives in the aborted task, so the channel closes
        assert_eq!(rx.recv().await, None);
    }
}
