//! Alert badges derived from a budget snapshot.
//!
//! Everything here is a pure function of its inputs. [`AlertsMemo`] only
//! skips recomputation when the inputs are known to be unchanged.

use crate::cache::{BudgetSnapshot, SnapshotVersion};
use crate::settings::AppSettings;
use chrono::{DateTime, NaiveDate, Utc};
use itertools::Itertools;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryAlert {
    pub overspent: bool,
    pub unapproved: usize,
}

impl CategoryAlert {
    pub fn is_empty(&self) -> bool {
        !self.overspent && self.unapproved == 0
    }
}

pub type CategoryAlerts = BTreeMap<Uuid, CategoryAlert>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountAlert {
    pub needs_reconciliation: bool,
    pub unapproved: usize,
}

pub type AccountAlerts = BTreeMap<Uuid, AccountAlert>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BudgetAlerts {
    pub categories: CategoryAlerts,
    pub accounts: AccountAlerts,
    /// All unapproved transactions, categorized or not
    pub unapproved_total: usize,
}

impl BudgetAlerts {
    pub fn overspent_count(&self) -> usize {
        self.categories.values().filter(|a| a.overspent).count()
    }

    pub fn accounts_needing_reconciliation(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.accounts
            .iter()
            .filter(|(_, alert)| alert.needs_reconciliation)
            .map(|(id, _)| *id)
    }
}

/// Compute the alerts of a snapshot as of `now`.
pub fn derive(snapshot: &BudgetSnapshot, settings: &AppSettings, now: DateTime<Utc>) -> BudgetAlerts {
    let unapproved = snapshot.transactions.iter().filter(|t| !t.approved);
    let by_category = unapproved.clone().filter_map(|t| t.category_id).counts();
    let by_account = unapproved.clone().map(|t| t.account_id).counts();

    let categories = snapshot
        .categories
        .iter()
        .map(|(id, category)| {
            let alert = CategoryAlert {
                overspent: category.balance.is_negative() && !category.is_credit_card_payment,
                unapproved: by_category.get(id).copied().unwrap_or(0),
            };
            (*id, alert)
        })
        .collect();

    let today = now.date_naive();
    let accounts = snapshot
        .accounts
        .iter()
        .map(|(id, account)| {
            let alert = AccountAlert {
                needs_reconciliation: !account.closed
                    && reconciliation_overdue(
                        account.last_reconciled_at,
                        today,
                        settings.reconcile_after_days,
                    ),
                unapproved: by_account.get(id).copied().unwrap_or(0),
            };
            (*id, alert)
        })
        .collect();

    BudgetAlerts {
        categories,
        accounts,
        unapproved_total: unapproved.count(),
    }
}

fn reconciliation_overdue(
    last_reconciled_at: Option<DateTime<Utc>>,
    today: NaiveDate,
    after_days: u32,
) -> bool {
    if after_days == 0 {
        return false;
    }
    match last_reconciled_at {
        Some(at) => (today - at.date_naive()).num_days() > i64::from(after_days),
        None => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MemoKey {
    version: SnapshotVersion,
    reconcile_after_days: u32,
    day: NaiveDate,
}

/// Last derived alerts per budget, keyed by snapshot identity.
#[derive(Default)]
pub struct AlertsMemo {
    entries: Mutex<HashMap<Uuid, (MemoKey, Arc<BudgetAlerts>)>>,
}

impl AlertsMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        snapshot: &BudgetSnapshot,
        settings: &AppSettings,
        now: DateTime<Utc>,
    ) -> Arc<BudgetAlerts> {
        let key = MemoKey {
            version: snapshot.version,
            reconcile_after_days: settings.reconcile_after_days,
            day: now.date_naive(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached, alerts)) = entries.get(&snapshot.budget_id) {
            if *cached == key {
                return Arc::clone(alerts);
            }
        }

        let alerts = Arc::new(derive(snapshot, settings, now));
        entries.insert(snapshot.budget_id, (key, Arc::clone(&alerts)));
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use ynab_api::endpoints::Milliunits;

    async fn snapshot() -> (Harness, BudgetSnapshot) {
        let h = Harness::logged_in().await.unwrap();
        let snapshot = h.cache.load_budget(h.budget_id(), false).await.unwrap();
        (h, snapshot)
    }

    #[tokio::test]
    async fn overspent_excludes_credit_card_payments() {
        let (h, snapshot) = snapshot().await;
        let f = &h.fixture;
        let alerts = derive(&snapshot, &AppSettings::default(), Utc::now());

        assert!(alerts.categories[&f.rent].overspent);
        assert!(!alerts.categories[&f.visa_payment].overspent);
        assert!(!alerts.categories[&f.groceries].overspent);
        assert_eq!(alerts.overspent_count(), 1);
    }

    #[tokio::test]
    async fn unapproved_counted_per_category_and_account() {
        let (h, snapshot) = snapshot().await;
        let f = &h.fixture;
        let alerts = derive(&snapshot, &AppSettings::default(), Utc::now());

        assert_eq!(alerts.categories[&f.groceries].unapproved, 2);
        assert_eq!(alerts.categories[&f.rent].unapproved, 1);
        assert!(alerts.categories[&f.visa_payment].is_empty());
        assert_eq!(alerts.accounts[&f.checking].unapproved, 3);
        assert_eq!(alerts.accounts[&f.visa].unapproved, 1);
        assert_eq!(alerts.unapproved_total, 4);
    }

    #[tokio::test]
    async fn reconciliation_follows_setting() {
        let (h, snapshot) = snapshot().await;
        let f = &h.fixture;

        let alerts = derive(&snapshot, &AppSettings::default(), Utc::now());
        let mut overdue: Vec<_> = alerts.accounts_needing_reconciliation().collect();
        overdue.sort();
        let mut expected = vec![f.savings, f.visa];
        expected.sort();
        assert_eq!(overdue, expected);

        let disabled = AppSettings {
            reconcile_after_days: 0,
            ..AppSettings::default()
        };
        let alerts = derive(&snapshot, &disabled, Utc::now());
        assert_eq!(alerts.accounts_needing_reconciliation().count(), 0);
    }

    #[test]
    fn reconciliation_threshold_is_exclusive() {
        let now = Utc::now();
        let today = now.date_naive();
        let at = |days| Some(now - chrono::Duration::days(days));

        assert!(!reconciliation_overdue(at(7), today, 7));
        assert!(reconciliation_overdue(at(8), today, 7));
        assert!(reconciliation_overdue(None, today, 7));
        assert!(!reconciliation_overdue(None, today, 0));
    }

    #[tokio::test]
    async fn memo_recomputes_only_on_new_version() {
        let (h, snapshot) = snapshot().await;
        let memo = AlertsMemo::new();
        let settings = AppSettings::default();
        let now = Utc::now();

        let first = memo.get(&snapshot, &settings, now);
        let second = memo.get(&snapshot, &settings, now);
        assert!(Arc::ptr_eq(&first, &second));

        h.cache
            .apply_pending(
                h.budget_id(),
                crate::cache::BalanceDelta {
                    account_id: h.fixture.checking,
                    category_id: Some(h.fixture.groceries),
                    transfer_account_id: None,
                    amount: Milliunits::new(-60_000),
                },
            )
            .await;
        let changed = h.cache.snapshot(h.budget_id()).await;
        let third = memo.get(&changed, &settings, now);
        assert!(!Arc::ptr_eq(&first, &third));
        assert!(third.categories[&h.fixture.groceries].overspent);
    }
}
