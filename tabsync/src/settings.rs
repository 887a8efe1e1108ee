use crate::storage::{keys, StorageError, Store, WatchHandle};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User preferences shared by every surface.
///
/// Missing keys take their default, unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub animations: bool,
    pub emoji: bool,
    pub current_tab_access: bool,
    /// Budget selected in the options page
    pub budget_id: Option<Uuid>,
    /// Flag accounts not reconciled for this many days; 0 turns the flag off
    pub reconcile_after_days: u32,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            animations: true,
            emoji: true,
            current_tab_access: false,
            budget_id: None,
            reconcile_after_days: 7,
        }
    }
}

impl AppSettings {
    fn from_stored(stored: Result<Option<AppSettings>, StorageError>) -> Result<Self, StorageError> {
        match stored {
            Ok(settings) => Ok(settings.unwrap_or_default()),
            Err(StorageError::Corrupt { source, .. }) => {
                tracing::warn!(error = %source, "Stored settings are corrupt, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }
}

pub struct SettingsStore {
    store: Store,
}

impl SettingsStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn load(&self) -> Result<AppSettings, StorageError> {
        AppSettings::from_stored(self.store.get(keys::SETTINGS).await)
    }

    /// Read-modify-write of the whole settings object.
    pub async fn update<F>(&self, change: F) -> Result<AppSettings, StorageError>
    where
        F: FnOnce(&mut AppSettings),
    {
        let mut settings = self.load().await?;
        change(&mut settings);
        self.store.set(keys::SETTINGS, &settings).await?;
        Ok(settings)
    }

    /// Call `listener` with the new settings after every write, from any context.
    pub fn watch<F>(&self, mut listener: F) -> WatchHandle
    where
        F: FnMut(AppSettings) + Send + 'static,
    {
        self.store.watch(keys::SETTINGS, move |change| {
            if let Ok(settings) = AppSettings::from_stored(change.decode()) {
                listener(settings);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryArea;
    use std::sync::Arc;

    fn settings_store() -> (Store, SettingsStore) {
        let store = Store::new(Arc::new(MemoryArea::new()));
        (store.clone(), SettingsStore::new(store))
    }

    #[tokio::test]
    async fn missing_settings_use_defaults() {
        let (_, settings) = settings_store();
        let loaded = settings.load().await.unwrap();
        assert!(loaded.animations);
        assert!(loaded.emoji);
        assert!(!loaded.current_tab_access);
        assert_eq!(loaded.budget_id, None);
        assert_eq!(loaded.reconcile_after_days, 7);
    }

    #[tokio::test]
    async fn partial_object_fills_missing_keys() {
        let (store, settings) = settings_store();
        store
            .set(
                keys::SETTINGS,
                &serde_json::json!({ "emoji": false, "somethingNew": 3 }),
            )
            .await
            .unwrap();

        let loaded = settings.load().await.unwrap();
        assert!(!loaded.emoji);
        assert!(loaded.animations);
        assert_eq!(loaded.reconcile_after_days, 7);
    }

    #[tokio::test]
    async fn corrupt_settings_fall_back_to_defaults() {
        let (store, settings) = settings_store();
        store.set(keys::SETTINGS, &"not an object").await.unwrap();
        assert_eq!(settings.load().await.unwrap(), AppSettings::default());
    }

    #[tokio::test]
    async fn update_persists_and_notifies() {
        let (store, settings) = settings_store();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _handle = SettingsStore::new(store.new_context()).watch(move |s| {
            let _ = tx.send(s);
        });

        let budget_id = Uuid::new_v4();
        settings
            .update(|s| {
                s.budget_id = Some(budget_id);
                s.animations = false;
            })
            .await
            .unwrap();

        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.budget_id, Some(budget_id));
        assert!(!seen.animations);
        assert_eq!(settings.load().await.unwrap(), seen);
    }
}
