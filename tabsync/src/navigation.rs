use crate::draft::TxDraftInit;
use crate::storage::{keys, StorageError, Store};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Category,
    Account,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxViewTarget {
    #[serde(rename = "type")]
    pub kind: TargetKind,
    pub id: Uuid,
}

/// Page shown by the UI surfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "page", rename_all = "camelCase")]
pub enum NavigationState {
    #[default]
    Main,
    AddTx {
        draft: TxDraftInit,
    },
    TxView {
        target: TxViewTarget,
    },
}

/// Main page plus one level: every other page returns to main.
pub struct Navigator {
    store: Store,
    state: watch::Sender<NavigationState>,
}

impl Navigator {
    /// Resume from the persisted page; anything unreadable starts on main.
    pub async fn open(store: Store) -> Self {
        let state = match store.get::<NavigationState>(keys::NAVIGATION).await {
            Ok(state) => state.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not restore navigation, starting on main");
                NavigationState::Main
            }
        };
        let (state, _) = watch::channel(state);
        Self { store, state }
    }

    pub fn current(&self) -> NavigationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NavigationState> {
        self.state.subscribe()
    }

    pub async fn open_add_tx(&self, draft: TxDraftInit) -> Result<(), StorageError> {
        self.go(NavigationState::AddTx { draft }).await
    }

    pub async fn open_tx_view(&self, target: TxViewTarget) -> Result<(), StorageError> {
        self.go(NavigationState::TxView { target }).await
    }

    pub async fn return_to_main(&self) -> Result<(), StorageError> {
        self.go(NavigationState::Main).await
    }

    /// A submitted transaction closes the add page.
    pub async fn transaction_added(&self) -> Result<(), StorageError> {
        self.return_to_main().await
    }

    async fn go(&self, next: NavigationState) -> Result<(), StorageError> {
        self.store.set(keys::NAVIGATION, &next).await?;
        tracing::debug!(page = ?next, "Navigated");
        self.state.send_replace(next);
        Ok(())
    }
}
