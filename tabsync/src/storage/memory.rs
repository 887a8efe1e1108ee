use super::{StorageArea, StorageChange, StorageError};
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const CHANGE_CAPACITY: usize = 256;

/// In-process storage area. Clones share the same values, so several
/// [`Store`](super::Store) contexts can run in one process.
#[derive(Clone)]
pub struct MemoryArea {
    inner: Arc<Inner>,
}

struct Inner {
    values: RwLock<HashMap<String, String>>,
    available: AtomicBool,
    failures_left: AtomicUsize,
    notifier: broadcast::Sender<StorageChange>,
}

impl MemoryArea {
    pub fn new() -> Self {
        let (notifier, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                values: RwLock::new(HashMap::new()),
                available: AtomicBool::new(true),
                failures_left: AtomicUsize::new(0),
                notifier,
            }),
        }
    }

    /// Make every operation fail with `Unavailable` until switched back.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `count` operations with `Unavailable`.
    pub fn fail_next(&self, count: usize) {
        self.inner.failures_left.store(count, Ordering::SeqCst);
    }

    /// Raw JSON currently stored at `key`.
    pub async fn raw(&self, key: &str) -> Option<String> {
        self.inner.values.read().await.get(key).cloned()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory area switched off".into()));
        }
        let injected = self
            .inner
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

impl Default for MemoryArea {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageArea for MemoryArea {
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StorageError>> {
        async move {
            self.check_available()?;
            Ok(self.inner.values.read().await.get(key).cloned())
        }
        .boxed()
    }

    fn write<'a>(
        &'a self,
        key: &'a str,
        value: Option<String>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            self.check_available()?;
            let mut values = self.inner.values.write().await;
            match value {
                Some(value) => {
                    values.insert(key.to_string(), value);
                }
                None => {
                    values.remove(key);
                }
            }
            Ok(())
        }
        .boxed()
    }

    fn notifier(&self) -> broadcast::Sender<StorageChange> {
        self.inner.notifier.clone()
    }
}
