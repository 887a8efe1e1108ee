mod file;
mod memory;
mod store;

pub use file::FileArea;
pub use memory::MemoryArea;
pub use store::{ContextId, RetryPolicy, StorageChange, Store, Subscription, WatchHandle};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::broadcast;

/// Keys shared by every context that opens the store.
pub mod keys {
    use uuid::Uuid;

    pub const TOKEN_DATA: &str = "tokenData";
    pub const SETTINGS: &str = "settings";
    pub const TX_DRAFT: &str = "txDraft";
    pub const NAVIGATION: &str = "navigation";
    pub const BUDGETS: &str = "budgets";
    pub const CACHE_PREFIX: &str = "cache.";

    /// `cache.<budgetId>.<scope>`
    pub fn cache(budget_id: Uuid, scope: &str) -> String {
        format!("{}{}.{}", CACHE_PREFIX, budget_id, scope)
    }

    /// Inverse of [`cache`].
    pub fn parse_cache(key: &str) -> Option<(Uuid, &str)> {
        let rest = key.strip_prefix(CACHE_PREFIX)?;
        let (budget_id, scope) = rest.split_once('.')?;
        Some((Uuid::parse_str(budget_id).ok()?, scope))
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    /// The storage area could not be reached. Transient; retrying may succeed.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("stored value for '{key}' could not be decoded: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("value for '{key}' could not be encoded: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// Raw key/value area shared by every execution context.
///
/// Values are JSON text. A write replaces the whole value at a key;
/// writing `None` removes it.
pub trait StorageArea: Send + Sync {
    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StorageError>>;

    fn write<'a>(
        &'a self,
        key: &'a str,
        value: Option<String>,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Channel every context publishes its writes on.
    fn notifier(&self) -> broadcast::Sender<StorageChange>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn cache_keys_round_trip() {
        let budget_id = Uuid::new_v4();
        let key = keys::cache(budget_id, "accounts");
        assert_eq!(key, format!("cache.{}.accounts", budget_id));
        assert_eq!(keys::parse_cache(&key), Some((budget_id, "accounts")));
        assert_eq!(keys::parse_cache("settings"), None);
        assert_eq!(keys::parse_cache("cache.not-a-uuid.accounts"), None);
    }
}
