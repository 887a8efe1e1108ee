use super::BudgetId;
use crate::macros::setter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tower_api_client::{Request, RequestData};
use uuid::Uuid;

// Common

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payee {
    pub id: Uuid,
    pub name: String,
    /// Set when this payee is the transfer payee of an account
    pub transfer_account_id: Option<Uuid>,
    pub deleted: bool,
}

// Requests

#[derive(Default, Debug, Clone, Serialize)]
pub struct ListPayees {
    budget_id: BudgetId,
}

impl ListPayees {
    pub fn new() -> Self {
        Self::default()
    }

    setter!(budget_id: BudgetId);
}

impl Request for ListPayees {
    type Data = ();
    type Response = PayeesResponse;

    fn endpoint(&self) -> Cow<'_, str> {
        format!("/budgets/{}/payees", self.budget_id).into()
    }

    fn data(&self) -> RequestData<&Self::Data> {
        RequestData::Empty
    }
}

// Responses

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayeesResponse {
    pub data: PayeesData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayeesData {
    pub payees: Vec<Payee>,
}
