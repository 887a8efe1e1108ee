use super::{BudgetId, Milliunits};
use crate::macros::setter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tower_api_client::{Request, RequestData};
use uuid::Uuid;

/// Name of the group that holds one payment category per credit card account.
pub const CREDIT_CARD_PAYMENTS_GROUP: &str = "Credit Card Payments";

// Common

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub category_group_id: Uuid,
    pub category_group_name: Option<String>,
    pub name: String,
    pub hidden: bool,
    pub budgeted: Milliunits,
    pub activity: Milliunits,
    pub balance: Milliunits,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryGroup {
    pub id: Uuid,
    pub name: String,
    pub hidden: bool,
    pub deleted: bool,
    pub categories: Vec<Category>,
}

impl CategoryGroup {
    pub fn is_credit_card_payments(&self) -> bool {
        self.name == CREDIT_CARD_PAYMENTS_GROUP
    }
}

// Requests

#[derive(Default, Debug, Clone, Serialize)]
pub struct ListCategories {
    budget_id: BudgetId,
}

impl ListCategories {
    pub fn new() -> Self {
        Self::default()
    }

    setter!(budget_id: BudgetId);
}

impl Request for ListCategories {
    type Data = ();
    type Response = ListCategoriesResponse;

    fn endpoint(&self) -> Cow<'_, str> {
        format!("/budgets/{}/categories", self.budget_id).into()
    }

    fn data(&self) -> RequestData<&Self::Data> {
        RequestData::Empty
    }
}

// Responses

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListCategoriesResponse {
    pub data: CategoriesData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoriesData {
    pub category_groups: Vec<CategoryGroup>,
}
