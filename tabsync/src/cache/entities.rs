//! Typed projections of the remote records, built at the fetch boundary.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use ynab_api::endpoints::{
    accounts::{Account, AccountType},
    budgets::BudgetSummary,
    categories::CategoryGroup,
    payees::Payee,
    transactions::Transaction,
    Milliunits, TransactionId,
};

pub type EntityMap<T> = BTreeMap<Uuid, T>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBudget {
    pub id: Uuid,
    pub name: String,
}

impl From<BudgetSummary> for CachedBudget {
    fn from(budget: BudgetSummary) -> Self {
        Self {
            id: budget.id,
            name: budget.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCategory {
    pub name: String,
    pub group: String,
    pub balance: Milliunits,
    pub hidden: bool,
    /// Payment category of a credit card account (named after the account)
    pub is_credit_card_payment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAccount {
    pub name: String,
    pub balance: Milliunits,
    pub closed: bool,
    pub account_type: AccountType,
    pub transfer_payee_id: Option<Uuid>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPayee {
    pub name: String,
    /// Set when the payee stands for a transfer into this account
    pub transfer_account_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedTransaction {
    pub id: TransactionId,
    pub date: NaiveDate,
    pub amount: Milliunits,
    pub account_id: Uuid,
    pub category_id: Option<Uuid>,
    pub payee_id: Option<Uuid>,
    pub transfer_account_id: Option<Uuid>,
    pub approved: bool,
}

impl From<Transaction> for CachedTransaction {
    fn from(transaction: Transaction) -> Self {
        Self {
            id: transaction.id,
            date: transaction.date,
            amount: transaction.amount,
            account_id: transaction.account_id,
            category_id: transaction.category_id,
            payee_id: transaction.payee_id,
            transfer_account_id: transaction.transfer_account_id,
            approved: transaction.approved,
        }
    }
}

pub fn categories_from_groups(groups: Vec<CategoryGroup>) -> EntityMap<CachedCategory> {
    groups
        .into_iter()
        .filter(|group| !group.deleted)
        .flat_map(|group| {
            let is_credit_card_payment = group.is_credit_card_payments();
            let group_name = group.name;
            group
                .categories
                .into_iter()
                .filter(|category| !category.deleted)
                .map(move |category| {
                    (
                        category.id,
                        CachedCategory {
                            name: category.name,
                            group: group_name.clone(),
                            balance: category.balance,
                            hidden: category.hidden,
                            is_credit_card_payment,
                        },
                    )
                })
        })
        .collect()
}

pub fn accounts_from_records(accounts: Vec<Account>) -> EntityMap<CachedAccount> {
    accounts
        .into_iter()
        .filter(|account| !account.deleted)
        .map(|account| {
            (
                account.id,
                CachedAccount {
                    name: account.name,
                    balance: account.balance,
                    closed: account.closed,
                    account_type: account.account_type,
                    transfer_payee_id: account.transfer_payee_id,
                    last_reconciled_at: account.last_reconciled_at,
                },
            )
        })
        .collect()
}

pub fn payees_from_records(payees: Vec<Payee>) -> EntityMap<CachedPayee> {
    payees
        .into_iter()
        .filter(|payee| !payee.deleted)
        .map(|payee| {
            (
                payee.id,
                CachedPayee {
                    name: payee.name,
                    transfer_account_id: payee.transfer_account_id,
                },
            )
        })
        .collect()
}

pub fn transactions_from_records(transactions: Vec<Transaction>) -> Vec<CachedTransaction> {
    transactions
        .into_iter()
        .filter(|transaction| !transaction.deleted)
        .map(CachedTransaction::from)
        .collect()
}

/// Payment category linked to a credit card account.
pub fn payment_category_for(
    account: &CachedAccount,
    categories: &EntityMap<CachedCategory>,
) -> Option<Uuid> {
    if !account.account_type.has_payment_category() {
        return None;
    }
    categories
        .iter()
        .find(|(_, category)| category.is_credit_card_payment && category.name == account.name)
        .map(|(id, _)| *id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ynab_api::endpoints::categories::{Category, CREDIT_CARD_PAYMENTS_GROUP};

    fn category(name: &str, group_id: Uuid, deleted: bool) -> Category {
        Category {
            id: Uuid::new_v4(),
            category_group_id: group_id,
            category_group_name: None,
            name: name.to_string(),
            hidden: false,
            budgeted: Milliunits::ZERO,
            activity: Milliunits::ZERO,
            balance: Milliunits::new(-5_000),
            deleted,
        }
    }

    #[test]
    fn deleted_categories_and_groups_are_dropped() {
        let bills = Uuid::new_v4();
        let cards = Uuid::new_v4();
        let gone = Uuid::new_v4();
        let groups = vec![
            CategoryGroup {
                id: bills,
                name: "Bills".to_string(),
                hidden: false,
                deleted: false,
                categories: vec![category("Rent", bills, false), category("Old", bills, true)],
            },
            CategoryGroup {
                id: cards,
                name: CREDIT_CARD_PAYMENTS_GROUP.to_string(),
                hidden: false,
                deleted: false,
                categories: vec![category("Visa", cards, false)],
            },
            CategoryGroup {
                id: gone,
                name: "Gone".to_string(),
                hidden: false,
                deleted: true,
                categories: vec![category("Ghost", gone, false)],
            },
        ];

        let categories = categories_from_groups(groups);
        let names: Vec<_> = categories.values().map(|c| c.name.as_str()).collect();
        assert_eq!(categories.len(), 2);
        assert!(names.contains(&"Rent"));
        assert!(names.contains(&"Visa"));

        let visa = categories.values().find(|c| c.name == "Visa").unwrap();
        assert!(visa.is_credit_card_payment);
        assert_eq!(visa.group, CREDIT_CARD_PAYMENTS_GROUP);
        assert_eq!(visa.balance, Milliunits::new(-5_000));
    }

    #[test]
    fn payment_category_only_for_credit_accounts() {
        let visa_payment = Uuid::new_v4();
        let categories = EntityMap::from([(
            visa_payment,
            CachedCategory {
                name: "Visa".to_string(),
                group: CREDIT_CARD_PAYMENTS_GROUP.to_string(),
                balance: Milliunits::ZERO,
                hidden: false,
                is_credit_card_payment: true,
            },
        )]);
        let mut account = CachedAccount {
            name: "Visa".to_string(),
            balance: Milliunits::ZERO,
            closed: false,
            account_type: AccountType::CreditCard,
            transfer_payee_id: None,
            last_reconciled_at: None,
        };

        assert_eq!(payment_category_for(&account, &categories), Some(visa_payment));

        account.account_type = AccountType::Savings;
        assert_eq!(payment_category_for(&account, &categories), None);
    }
}
