use super::{BudgetId, Milliunits};
use crate::macros::setter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tower_api_client::{Request, RequestData};
use uuid::Uuid;

// Common

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    /// Whether this account is on budget or not
    pub on_budget: bool,
    pub closed: bool,
    /// The current balance of the account in milliunits format
    pub balance: Milliunits,
    /// The payee id which should be used when transferring to this account
    pub transfer_payee_id: Option<Uuid>,
    /// When the account was last reconciled, absent if it never was
    #[serde(default)]
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub deleted: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccountType {
    Checking,
    Savings,
    Cash,
    CreditCard,
    LineOfCredit,
    OtherAsset,
    OtherLiability,
    Mortgage,
    AutoLoan,
    StudentLoan,
    PersonalLoan,
    MedicalDebt,
    OtherDebt,
}

impl AccountType {
    /// Accounts whose spending is covered by a credit card payment category.
    pub fn has_payment_category(&self) -> bool {
        matches!(self, Self::CreditCard | Self::LineOfCredit)
    }
}

// Requests

#[derive(Default, Debug, Clone, Serialize)]
pub struct ListAccounts {
    budget_id: BudgetId,
}

impl ListAccounts {
    pub fn new(budget_id: BudgetId) -> Self {
        Self { budget_id }
    }

    setter!(budget_id: BudgetId);
}

impl Request for ListAccounts {
    type Data = ();
    type Response = AccountsResponse;

    fn endpoint(&self) -> Cow<'_, str> {
        format!("/budgets/{}/accounts", self.budget_id).into()
    }

    fn data(&self) -> RequestData<&Self::Data> {
        RequestData::Empty
    }
}

// Responses

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountsResponse {
    pub data: AccountsData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountsData {
    pub accounts: Vec<Account>,
}
