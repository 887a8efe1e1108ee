use super::{BudgetId, Milliunits, TransactionId};
use crate::macros::setter;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tower_api_client::{Method, Request, RequestData};
use uuid::Uuid;

// Common

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: TransactionId,
    pub date: NaiveDate,
    pub amount: Milliunits,
    pub memo: Option<String>,
    pub cleared: ReconciliationStatus,
    pub approved: bool,
    pub flag_color: Option<FlagColor>,
    pub account_id: Uuid,
    pub payee_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub transfer_account_id: Option<Uuid>,
    pub deleted: bool,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Cleared,
    Uncleared,
    Reconciled,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlagColor {
    Red,
    Orange,
    Yellow,
    Green,
    Blue,
    Purple,
}

/// Server-side filter for transaction listings.
#[derive(Debug, Copy, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Uncategorized,
    Unapproved,
}

// Requests

#[derive(Default, Debug, Clone, Serialize)]
pub struct ListTransactions {
    #[serde(skip)]
    budget_id: BudgetId,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    transaction_type: Option<TransactionType>,
}

impl ListTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    setter!(budget_id: BudgetId);

    pub fn only(mut self, transaction_type: TransactionType) -> Self {
        self.transaction_type = Some(transaction_type);
        self
    }
}

impl Request for ListTransactions {
    type Data = Self;
    type Response = TransactionsResponse;

    fn endpoint(&self) -> Cow<'_, str> {
        format!("/budgets/{}/transactions", self.budget_id).into()
    }

    fn data(&self) -> RequestData<&Self::Data> {
        RequestData::Query(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateTransaction {
    #[serde(skip)]
    budget_id: BudgetId,
    transaction: NewTransaction,
}

impl CreateTransaction {
    pub fn new<T>(account_id: Uuid, date: NaiveDate, amount: T) -> Self
    where
        T: Into<Milliunits>,
    {
        Self {
            budget_id: BudgetId::default(),
            transaction: NewTransaction::new(account_id, date, amount),
        }
    }

    pub fn from_transaction(transaction: NewTransaction) -> Self {
        Self {
            budget_id: BudgetId::default(),
            transaction,
        }
    }

    setter!(budget_id: BudgetId);
    setter!(opt transaction.payee_id: Uuid);
    setter!(opt transaction.category_id: Uuid);
    setter!(opt transaction.memo: String);
    setter!(opt transaction.cleared: ReconciliationStatus);
    setter!(opt transaction.approved: bool);
    setter!(opt transaction.flag_color: FlagColor);
}

impl Request for CreateTransaction {
    type Data = Self;
    type Response = CreateTransactionResponse;
    const METHOD: Method = Method::POST;

    fn endpoint(&self) -> Cow<'_, str> {
        format!("/budgets/{}/transactions", self.budget_id).into()
    }

    fn data(&self) -> RequestData<&Self::Data> {
        RequestData::Json(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub account_id: Uuid,
    pub date: NaiveDate,
    pub amount: Milliunits,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payee_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleared: Option<ReconciliationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flag_color: Option<FlagColor>,
}

impl NewTransaction {
    pub fn new<T>(account_id: Uuid, date: NaiveDate, amount: T) -> Self
    where
        T: Into<Milliunits>,
    {
        Self {
            account_id,
            date,
            amount: amount.into(),
            payee_id: None,
            category_id: None,
            memo: None,
            cleared: None,
            approved: None,
            flag_color: None,
        }
    }
}

// Responses

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionsResponse {
    pub data: TransactionsData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionsData {
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransactionResponse {
    pub data: CreateTransactionData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransactionData {
    pub transaction: Transaction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_body_omits_unset_fields() {
        let account_id = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let request = CreateTransaction::new(account_id, date, Milliunits::new(-130_000))
            .memo("groceries")
            .approved(true);

        let body = serde_json::to_value(&request).unwrap();
        let transaction = &body["transaction"];
        assert_eq!(transaction["amount"], -130_000);
        assert_eq!(transaction["date"], "2024-03-01");
        assert_eq!(transaction["memo"], "groceries");
        assert!(transaction.get("payee_id").is_none());
        assert!(transaction.get("flag_color").is_none());
        assert!(body.get("budget_id").is_none());
    }

    #[test]
    fn unapproved_filter_is_sent_as_type() {
        let request = ListTransactions::new().only(TransactionType::Unapproved);
        let query = serde_json::to_value(&request).unwrap();
        assert_eq!(query["type"], "unapproved");
    }
}
