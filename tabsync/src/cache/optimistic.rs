use super::entities::{CachedAccount, CachedCategory, CachedTransaction, EntityMap};
use uuid::Uuid;
use ynab_api::endpoints::Milliunits;

/// Identifies one pending mutation for confirm/rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutationId(Uuid);

impl MutationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Balance effect of a transaction the server has not acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceDelta {
    pub account_id: Uuid,
    pub category_id: Option<Uuid>,
    /// Counter account of a transfer; it moves by `-amount`
    pub transfer_account_id: Option<Uuid>,
    pub amount: Milliunits,
}

impl BalanceDelta {
    fn from_transaction(transaction: &CachedTransaction) -> Self {
        Self {
            account_id: transaction.account_id,
            category_id: transaction.category_id,
            transfer_account_id: transaction.transfer_account_id,
            amount: transaction.amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MutationState {
    Tentative,
    /// Acknowledged by the server at cache sequence `seq`. It keeps applying
    /// to a scope until that scope holds data fetched after `seq`.
    Confirmed { seq: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingMutation {
    pub id: MutationId,
    pub budget_id: Uuid,
    pub delta: BalanceDelta,
    state: MutationState,
}

impl PendingMutation {
    pub fn tentative(budget_id: Uuid, delta: BalanceDelta) -> Self {
        Self {
            id: MutationId::new(),
            budget_id,
            delta,
            state: MutationState::Tentative,
        }
    }

    /// Swap the tentative delta for the authoritative record.
    pub fn confirm(&mut self, transaction: &CachedTransaction, seq: u64) {
        self.delta = BalanceDelta::from_transaction(transaction);
        self.state = MutationState::Confirmed { seq };
    }

    pub fn is_tentative(&self) -> bool {
        self.state == MutationState::Tentative
    }

    /// Whether data fetched at `fetch_seq` still lacks this mutation.
    fn applies_to(&self, fetch_seq: u64) -> bool {
        match self.state {
            MutationState::Tentative => true,
            MutationState::Confirmed { seq } => fetch_seq < seq,
        }
    }

    /// Both balance scopes were refetched after confirmation.
    pub fn is_settled(&self, accounts_seq: u64, categories_seq: u64) -> bool {
        !self.applies_to(accounts_seq) && !self.applies_to(categories_seq)
    }
}

/// Pending mutations of one budget laid over a fetched account map.
pub(crate) fn overlay_accounts<'a>(
    accounts: &mut EntityMap<CachedAccount>,
    pending: impl Iterator<Item = &'a PendingMutation>,
    fetch_seq: u64,
) {
    for mutation in pending.filter(|m| m.applies_to(fetch_seq)) {
        let delta = &mutation.delta;
        if let Some(account) = accounts.get_mut(&delta.account_id) {
            account.balance += delta.amount;
        }
        if let Some(account) = delta
            .transfer_account_id
            .and_then(|id| accounts.get_mut(&id))
        {
            account.balance -= delta.amount;
        }
    }
}

pub(crate) fn overlay_categories<'a>(
    categories: &mut EntityMap<CachedCategory>,
    pending: impl Iterator<Item = &'a PendingMutation>,
    fetch_seq: u64,
) {
    for mutation in pending.filter(|m| m.applies_to(fetch_seq)) {
        let delta = &mutation.delta;
        if let Some(category) = delta.category_id.and_then(|id| categories.get_mut(&id)) {
            category.balance += delta.amount;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ynab_api::endpoints::{accounts::AccountType, TransactionId};

    fn account(balance: i64) -> CachedAccount {
        CachedAccount {
            name: "Checking".to_string(),
            balance: Milliunits::new(balance),
            closed: false,
            account_type: AccountType::Checking,
            transfer_payee_id: None,
            last_reconciled_at: None,
        }
    }

    #[test]
    fn tentative_delta_moves_both_sides_of_a_transfer() {
        let checking = Uuid::new_v4();
        let savings = Uuid::new_v4();
        let mut accounts = EntityMap::from([(checking, account(100_000)), (savings, account(0))]);
        let mutation = PendingMutation::tentative(
            Uuid::new_v4(),
            BalanceDelta {
                account_id: checking,
                category_id: None,
                transfer_account_id: Some(savings),
                amount: Milliunits::new(-25_000),
            },
        );

        overlay_accounts(&mut accounts, [mutation].iter(), 0);
        assert_eq!(accounts[&checking].balance, Milliunits::new(75_000));
        assert_eq!(accounts[&savings].balance, Milliunits::new(25_000));
    }

    #[test]
    fn confirmed_delta_stops_after_later_fetch() {
        let checking = Uuid::new_v4();
        let mut mutation = PendingMutation::tentative(
            Uuid::new_v4(),
            BalanceDelta {
                account_id: checking,
                category_id: None,
                transfer_account_id: None,
                amount: Milliunits::new(-10_000),
            },
        );
        let authoritative = CachedTransaction {
            id: TransactionId::new("server-id"),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            amount: Milliunits::new(-12_000),
            account_id: checking,
            category_id: None,
            payee_id: None,
            transfer_account_id: None,
            approved: true,
        };
        mutation.confirm(&authoritative, 5);
        assert!(!mutation.is_tentative());

        // Data fetched before confirmation still lacks the transaction
        let mut accounts = EntityMap::from([(checking, account(100_000))]);
        overlay_accounts(&mut accounts, [mutation.clone()].iter(), 3);
        assert_eq!(accounts[&checking].balance, Milliunits::new(88_000));

        let mut accounts = EntityMap::from([(checking, account(88_000))]);
        overlay_accounts(&mut accounts, [mutation.clone()].iter(), 6);
        assert_eq!(accounts[&checking].balance, Milliunits::new(88_000));

        assert!(!mutation.is_settled(6, 3));
        assert!(mutation.is_settled(6, 7));
    }
}
