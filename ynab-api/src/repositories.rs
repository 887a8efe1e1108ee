use crate::endpoints::{
    BudgetId, Milliunits,
    accounts::ListAccounts,
    budgets::ListBudgets,
    categories::ListCategories,
    payees::ListPayees,
    transactions::{CreateTransaction, ListTransactions, NewTransaction},
};
use chrono::NaiveDate;
use uuid::Uuid;

#[derive(Default)]
pub struct AccountRepository {
    budget_id: BudgetId,
}

impl AccountRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(mut self, budget_id: impl Into<BudgetId>) -> Self {
        self.budget_id = budget_id.into();
        self
    }

    pub fn list(&self) -> ListAccounts {
        ListAccounts::new(self.budget_id.clone())
    }
}

pub struct BudgetRepository;

impl BudgetRepository {
    pub fn list(&self) -> ListBudgets {
        ListBudgets::new()
    }
}

#[derive(Default)]
pub struct CategoryRepository {
    budget_id: BudgetId,
}

impl CategoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(mut self, budget_id: impl Into<BudgetId>) -> Self {
        self.budget_id = budget_id.into();
        self
    }

    pub fn list(&self) -> ListCategories {
        ListCategories::new().budget_id(self.budget_id.clone())
    }
}

#[derive(Default)]
pub struct PayeeRepository {
    budget_id: BudgetId,
}

impl PayeeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(mut self, budget_id: impl Into<BudgetId>) -> Self {
        self.budget_id = budget_id.into();
        self
    }

    pub fn list(&self) -> ListPayees {
        ListPayees::new().budget_id(self.budget_id.clone())
    }
}

#[derive(Default)]
pub struct TransactionRepository {
    budget_id: BudgetId,
}

impl TransactionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(mut self, budget_id: impl Into<BudgetId>) -> Self {
        self.budget_id = budget_id.into();
        self
    }

    pub fn list(&self) -> ListTransactions {
        ListTransactions::new().budget_id(self.budget_id.clone())
    }

    pub fn create(&self, account_id: Uuid, date: NaiveDate, amount: Milliunits) -> CreateTransaction {
        CreateTransaction::new(account_id, date, amount).budget_id(self.budget_id.clone())
    }

    pub fn create_from(&self, transaction: NewTransaction) -> CreateTransaction {
        CreateTransaction::from_transaction(transaction).budget_id(self.budget_id.clone())
    }
}
