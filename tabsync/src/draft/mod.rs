mod validators;

pub use validators::parse_amount;

use crate::api::{ApiError, BudgetApi};
use crate::auth::{AuthError, TokenManager};
use crate::cache::{BudgetSnapshot, CacheError, EntityCache};
use crate::storage::{keys, Store};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;
use ynab_api::endpoints::transactions::FlagColor;
use ynab_api::endpoints::TransactionId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmountType {
    Inflow,
    #[default]
    Outflow,
}

/// Presets a new draft starts from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TxDraftInit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payee_id: Option<Uuid>,
}

/// The transaction being edited, as persisted under `txDraft`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TxDraft {
    /// Unsigned decimal; the sign comes from `amount_type`
    pub amount: String,
    pub amount_type: AmountType,
    pub account_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub payee_id: Option<Uuid>,
    pub memo: String,
    pub flag: Option<FlagColor>,
    pub is_transfer: bool,
    pub date: NaiveDate,
    pub cleared: bool,
    /// Set once the user picked a category; transfer detection leaves it alone
    pub category_touched: bool,
}

impl Default for TxDraft {
    fn default() -> Self {
        Self {
            amount: String::new(),
            amount_type: AmountType::default(),
            account_id: None,
            category_id: None,
            payee_id: None,
            memo: String::new(),
            flag: None,
            is_transfer: false,
            date: Local::now().date_naive(),
            cleared: false,
            category_touched: false,
        }
    }
}

impl TxDraft {
    pub fn from_init(init: &TxDraftInit) -> Self {
        Self {
            account_id: init.account_id,
            category_id: init.category_id,
            payee_id: init.payee_id,
            category_touched: init.category_id.is_some(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftField {
    Amount(String),
    AmountType(AmountType),
    Account(Option<Uuid>),
    Category(Option<Uuid>),
    Payee(Option<Uuid>),
    Memo(String),
    Flag(Option<FlagColor>),
    Date(NaiveDate),
    Cleared(bool),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DraftError {
    #[error("invalid amount {0:?}: expected digits with at most three decimals")]
    InvalidAmount(String),

    #[error("amount must be greater than zero")]
    NotPositive,

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("unknown account {0}")]
    UnknownAccount(Uuid),

    #[error("unknown category {0}")]
    UnknownCategory(Uuid),

    #[error("draft could not be saved: {0}")]
    Storage(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] DraftError),

    #[error("a submission of this draft is already in flight")]
    AlreadySubmitting,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("network error: {0}")]
    Network(String),

    #[error("transaction rejected ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("draft could not be saved: {0}")]
    Storage(String),

    /// The submission task panicked or was aborted
    #[error("submission interrupted: {0}")]
    Interrupted(String),
}

impl SubmitError {
    pub fn reason(&self) -> &'static str {
        match self {
            SubmitError::Validation(_) => "validation",
            SubmitError::AlreadySubmitting => "already_submitting",
            SubmitError::Auth(e) => e.reason(),
            SubmitError::Network(_) => "network",
            SubmitError::Rejected { .. } => "rejected",
            SubmitError::Storage(_) => "storage",
            SubmitError::Interrupted(_) => "interrupted",
        }
    }
}

impl From<ApiError> for SubmitError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Unauthorized => SubmitError::Auth(AuthError::Unauthenticated),
            ApiError::Status { status, detail } => SubmitError::Rejected { status, detail },
            ApiError::Network(e) => SubmitError::Network(e),
        }
    }
}

/// Clears the in-flight flag when a submission ends, however it ends.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Draft editing and submission for one budget.
///
/// Every accepted change is written to the store before it becomes visible,
/// so the draft survives a reload of any context. The stored draft is
/// authoritative: edits start from it, not from the local copy.
pub struct TxDraftMachine {
    store: Store,
    cache: Arc<EntityCache>,
    auth: Arc<TokenManager>,
    api: Arc<dyn BudgetApi>,
    budget_id: Uuid,
    draft: Mutex<TxDraft>,
    submitting: Arc<AtomicBool>,
}

impl TxDraftMachine {
    /// Restore the persisted draft, or start empty.
    pub async fn open(
        store: Store,
        cache: Arc<EntityCache>,
        auth: Arc<TokenManager>,
        api: Arc<dyn BudgetApi>,
        budget_id: Uuid,
    ) -> Arc<Self> {
        let draft = match store.get::<TxDraft>(keys::TX_DRAFT).await {
            Ok(draft) => draft.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not restore draft, starting empty");
                TxDraft::default()
            }
        };

        Arc::new(Self {
            store,
            cache,
            auth,
            api,
            budget_id,
            draft: Mutex::new(draft),
            submitting: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn budget_id(&self) -> Uuid {
        self.budget_id
    }

    pub async fn draft(&self) -> TxDraft {
        let mut current = self.draft.lock().await;
        self.reload(&mut current).await;
        current.clone()
    }

    pub fn is_submitting(&self) -> bool {
        self.submitting.load(Ordering::SeqCst)
    }

    /// Replace the draft with a fresh one built from `init`.
    pub async fn start(&self, init: &TxDraftInit) -> Result<TxDraft, DraftError> {
        let mut current = self.draft.lock().await;
        let mut draft = TxDraft::from_init(init);
        if draft.payee_id.is_some() {
            let snapshot = self.lookup().await;
            validators::apply_transfer_rules(&mut draft, &snapshot);
        }
        self.commit(&mut current, draft).await
    }

    /// Validate one field change and persist the result.
    pub async fn set_field(&self, field: DraftField) -> Result<TxDraft, DraftError> {
        let mut current = self.draft.lock().await;
        self.reload(&mut current).await;
        let mut draft = current.clone();

        match field {
            DraftField::Amount(amount) => {
                validators::parse_amount(&amount)?;
                draft.amount = amount;
            }
            DraftField::AmountType(amount_type) => draft.amount_type = amount_type,
            DraftField::Account(account_id) => {
                let snapshot = self.lookup().await;
                if let Some(id) = account_id {
                    if !snapshot.accounts.is_empty() && !snapshot.accounts.contains_key(&id) {
                        return Err(DraftError::UnknownAccount(id));
                    }
                }
                draft.account_id = account_id;
                validators::apply_transfer_rules(&mut draft, &snapshot);
            }
            DraftField::Category(category_id) => {
                if let Some(id) = category_id {
                    let snapshot = self.cache.snapshot(self.budget_id).await;
                    let categories = &snapshot.categories;
                    if !categories.is_empty() && !categories.contains_key(&id) {
                        return Err(DraftError::UnknownCategory(id));
                    }
                }
                draft.category_id = category_id;
                // Clearing the category hands it back to transfer detection
                draft.category_touched = category_id.is_some();
            }
            DraftField::Payee(payee_id) => {
                let snapshot = self.lookup().await;
                draft.payee_id = payee_id;
                validators::apply_transfer_rules(&mut draft, &snapshot);
            }
            DraftField::Memo(memo) => draft.memo = memo,
            DraftField::Flag(flag) => draft.flag = flag,
            DraftField::Date(date) => draft.date = date,
            DraftField::Cleared(cleared) => draft.cleared = cleared,
        }

        self.commit(&mut current, draft).await
    }

    /// Select `payee_id` and resolve whether it makes the draft a transfer.
    pub async fn detect_transfer(&self, payee_id: Option<Uuid>) -> Result<bool, DraftError> {
        let draft = self.set_field(DraftField::Payee(payee_id)).await?;
        Ok(draft.is_transfer)
    }

    /// Drop the draft, keeping nothing but today's date.
    pub async fn discard(&self) -> Result<(), DraftError> {
        let mut current = self.draft.lock().await;
        self.commit(&mut current, TxDraft::default()).await?;
        Ok(())
    }

    /// Submit the draft and wait for the outcome.
    ///
    /// The submission runs on its own task: dropping this future does not
    /// cancel it, and its result still reaches the cache.
    pub async fn submit(self: &Arc<Self>) -> Result<TransactionId, SubmitError> {
        self.submit_detached()?
            .await
            .map_err(|e| SubmitError::Interrupted(e.to_string()))?
    }

    /// Start a submission in the background.
    ///
    /// Fails at once with [`SubmitError::AlreadySubmitting`] while another
    /// submission of this draft is in flight.
    pub fn submit_detached(
        self: &Arc<Self>,
    ) -> Result<JoinHandle<Result<TransactionId, SubmitError>>, SubmitError> {
        if self.submitting.swap(true, Ordering::SeqCst) {
            tracing::debug!("Submission already in flight");
            return Err(SubmitError::AlreadySubmitting);
        }
        let in_flight = InFlight(Arc::clone(&self.submitting));
        let this = Arc::clone(self);

        Ok(tokio::spawn(async move {
            let _in_flight = in_flight;
            this.run_submit().await
        }))
    }

    async fn run_submit(&self) -> Result<TransactionId, SubmitError> {
        let draft = self.draft().await;
        let snapshot = self.lookup().await;
        let commit = validators::validate(&draft, &snapshot)?;

        self.store
            .set(keys::TX_DRAFT, &draft)
            .await
            .map_err(|e| SubmitError::Storage(e.to_string()))?;
        let token = self.auth.get_valid_access_token().await?;

        let mutation = self.cache.apply_pending(self.budget_id, commit.delta).await;
        tracing::info!(
            budget_id = %self.budget_id,
            amount = %commit.transaction.amount,
            "Submitting transaction"
        );

        match self
            .api
            .create_transaction(&token, self.budget_id, commit.transaction)
            .await
        {
            Ok(created) => {
                self.cache.confirm_pending(mutation, &created).await;
                tracing::info!(transaction_id = %created.id, "Transaction committed");
                self.reset_after_commit(&draft).await;
                self.cache.refresh_after_mutation(self.budget_id).await;
                Ok(created.id)
            }
            Err(e) => {
                self.cache.rollback_pending(mutation).await;
                if e == ApiError::Unauthorized {
                    self.auth.handle_unauthorized().await;
                }
                let error = SubmitError::from(e);
                tracing::warn!(error = %error, "Transaction submission failed, draft kept");
                Err(error)
            }
        }
    }

    /// Start over with the same account, unless the draft was edited while
    /// the submission was in flight.
    async fn reset_after_commit(&self, submitted: &TxDraft) {
        let mut current = self.draft.lock().await;
        self.reload(&mut current).await;
        if *current != *submitted {
            tracing::debug!("Draft edited during submission, keeping edits");
            return;
        }
        let next = TxDraft::from_init(&TxDraftInit {
            account_id: submitted.account_id,
            ..TxDraftInit::default()
        });
        if let Err(e) = self.commit(&mut current, next).await {
            tracing::warn!(error = %e, "Committed transaction but could not reset draft");
        }
    }

    async fn commit(&self, current: &mut TxDraft, draft: TxDraft) -> Result<TxDraft, DraftError> {
        self.store
            .set(keys::TX_DRAFT, &draft)
            .await
            .map_err(|e| DraftError::Storage(e.to_string()))?;
        *current = draft.clone();
        Ok(draft)
    }

    /// Replace the local copy with the stored draft, which another context
    /// may have written since.
    async fn reload(&self, current: &mut TxDraft) {
        match self.store.get::<TxDraft>(keys::TX_DRAFT).await {
            Ok(Some(stored)) => *current = stored,
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Could not re-read draft, keeping local copy"),
        }
    }

    /// Snapshot with the lookup scopes loaded when possible.
    async fn lookup(&self) -> BudgetSnapshot {
        let (payees, accounts, categories) = tokio::join!(
            self.cache.get_payees(self.budget_id, false),
            self.cache.get_accounts(self.budget_id, false),
            self.cache.get_categories(self.budget_id, false),
        );
        let failures: [Option<CacheError>; 3] = [payees.err(), accounts.err(), categories.err()];
        for error in failures.into_iter().flatten() {
            tracing::warn!(error = %error, "Lookup data unavailable");
        }
        self.cache.snapshot(self.budget_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ApiCall, Harness};
    use std::time::Duration;
    use ynab_api::endpoints::Milliunits;

    async fn machine(h: &Harness) -> Arc<TxDraftMachine> {
        TxDraftMachine::open(
            h.store.clone(),
            h.cache.clone(),
            h.auth.clone(),
            h.api.clone(),
            h.budget_id(),
        )
        .await
    }

    #[tokio::test]
    async fn fields_persist_and_restore() {
        let h = Harness::logged_in().await.unwrap();
        let drafts = machine(&h).await;

        drafts
            .set_field(DraftField::Account(Some(h.fixture.checking)))
            .await
            .unwrap();
        drafts
            .set_field(DraftField::Amount("12.5".into()))
            .await
            .unwrap();
        drafts
            .set_field(DraftField::Memo("lunch".into()))
            .await
            .unwrap();

        let restored = machine(&h).await.draft().await;
        assert_eq!(restored, drafts.draft().await);
        assert_eq!(restored.amount, "12.5");
    }

    #[tokio::test]
    async fn invalid_amount_leaves_draft_untouched() {
        let h = Harness::logged_in().await.unwrap();
        let drafts = machine(&h).await;
        drafts
            .set_field(DraftField::Amount("4.20".into()))
            .await
            .unwrap();

        let err = drafts
            .set_field(DraftField::Amount("4.2001".into()))
            .await
            .unwrap_err();
        assert_eq!(err, DraftError::InvalidAmount("4.2001".into()));
        assert_eq!(drafts.draft().await.amount, "4.20");
    }

    #[tokio::test]
    async fn amount_type_keeps_magnitude() {
        let h = Harness::logged_in().await.unwrap();
        let drafts = machine(&h).await;
        drafts
            .set_field(DraftField::Amount("7".into()))
            .await
            .unwrap();
        let draft = drafts
            .set_field(DraftField::AmountType(AmountType::Inflow))
            .await
            .unwrap();
        assert_eq!(draft.amount, "7");
        assert_eq!(draft.amount_type, AmountType::Inflow);
    }

    #[tokio::test]
    async fn transfer_payee_for_own_account_is_not_a_transfer() {
        let h = Harness::logged_in().await.unwrap();
        let f = &h.fixture;
        let drafts = machine(&h).await;

        drafts
            .set_field(DraftField::Account(Some(f.checking)))
            .await
            .unwrap();
        assert!(drafts.detect_transfer(Some(f.to_savings)).await.unwrap());

        // Moving the draft onto the payee's own account undoes the transfer
        let draft = drafts
            .set_field(DraftField::Account(Some(f.savings)))
            .await
            .unwrap();
        assert!(!draft.is_transfer);
    }

    #[tokio::test]
    async fn untouched_payment_category_clears_with_payee() {
        let h = Harness::logged_in().await.unwrap();
        let f = &h.fixture;
        let drafts = machine(&h).await;
        drafts
            .set_field(DraftField::Account(Some(f.checking)))
            .await
            .unwrap();

        drafts.detect_transfer(Some(f.to_visa)).await.unwrap();
        assert_eq!(drafts.draft().await.category_id, Some(f.visa_payment));

        let draft = drafts
            .set_field(DraftField::Payee(Some(f.grocer)))
            .await
            .unwrap();
        assert!(!draft.is_transfer);
        assert_eq!(draft.category_id, None);
    }

    #[tokio::test]
    async fn unknown_account_is_rejected_once_accounts_are_known() {
        let h = Harness::logged_in().await.unwrap();
        let drafts = machine(&h).await;
        let stranger = Uuid::new_v4();

        let err = drafts
            .set_field(DraftField::Account(Some(stranger)))
            .await
            .unwrap_err();
        assert_eq!(err, DraftError::UnknownAccount(stranger));
    }

    #[tokio::test]
    async fn submit_requires_amount_account_and_category() {
        let h = Harness::logged_in().await.unwrap();
        let drafts = machine(&h).await;

        let err = drafts.submit().await.unwrap_err();
        assert_eq!(err, SubmitError::Validation(DraftError::Missing("amount")));

        drafts
            .set_field(DraftField::Amount("0".into()))
            .await
            .unwrap();
        let err = drafts.submit().await.unwrap_err();
        assert_eq!(err.reason(), "validation");
        assert_eq!(err, SubmitError::Validation(DraftError::NotPositive));

        drafts
            .set_field(DraftField::Amount("3".into()))
            .await
            .unwrap();
        drafts
            .set_field(DraftField::Account(Some(h.fixture.checking)))
            .await
            .unwrap();
        let err = drafts.submit().await.unwrap_err();
        assert_eq!(err, SubmitError::Validation(DraftError::Missing("category")));
        assert_eq!(h.api.calls(ApiCall::CreateTransaction), 0);
    }

    #[tokio::test]
    async fn successful_submit_resets_draft_and_refetches() {
        let h = Harness::logged_in().await.unwrap();
        let f = &h.fixture;
        let drafts = machine(&h).await;
        drafts
            .start(&TxDraftInit {
                account_id: Some(f.checking),
                category_id: Some(f.groceries),
                payee_id: Some(f.grocer),
            })
            .await
            .unwrap();
        drafts
            .set_field(DraftField::Amount("10".into()))
            .await
            .unwrap();

        drafts.submit().await.unwrap();

        let created = h.api.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].amount, Milliunits::new(-10_000));
        assert_eq!(created[0].category_id, Some(f.groceries));

        let draft = drafts.draft().await;
        assert_eq!(draft.amount, "");
        assert_eq!(draft.account_id, Some(f.checking));
        assert_eq!(draft.category_id, None);

        let accounts = h.cache.get_accounts(h.budget_id(), false).await.unwrap();
        assert_eq!(
            accounts[&f.checking].balance,
            f.balance(f.checking) - Milliunits::new(10_000)
        );
        assert_eq!(h.cache.tentative_count(h.budget_id()).await, 0);
        assert!(!drafts.is_submitting());
    }

    #[tokio::test]
    async fn second_submit_while_pending_fails_fast() {
        let h = Harness::with_latency(Duration::from_millis(100)).await.unwrap();
        let f = &h.fixture;
        let drafts = machine(&h).await;
        drafts
            .start(&TxDraftInit {
                account_id: Some(f.checking),
                category_id: Some(f.groceries),
                payee_id: None,
            })
            .await
            .unwrap();
        drafts
            .set_field(DraftField::Amount("1".into()))
            .await
            .unwrap();

        let first = drafts.submit_detached().unwrap();
        let err = drafts.submit().await.unwrap_err();
        assert_eq!(err.reason(), "already_submitting");

        first.await.unwrap().unwrap();
        assert_eq!(h.api.calls(ApiCall::CreateTransaction), 1);
    }

    #[tokio::test]
    async fn rejected_submit_surfaces_status() {
        let h = Harness::logged_in().await.unwrap();
        let f = &h.fixture;
        let drafts = machine(&h).await;
        drafts
            .start(&TxDraftInit {
                account_id: Some(f.checking),
                category_id: Some(f.rent),
                payee_id: None,
            })
            .await
            .unwrap();
        drafts
            .set_field(DraftField::Amount("5".into()))
            .await
            .unwrap();
        h.api.fail_creates_with(Some(ApiError::Status {
            status: 400,
            detail: "bad_request: invalid date".into(),
        }));

        let err = drafts.submit().await.unwrap_err();
        assert_eq!(
            err,
            SubmitError::Rejected {
                status: 400,
                detail: "bad_request: invalid date".into()
            }
        );
        assert_eq!(drafts.draft().await.amount, "5");
        assert!(!drafts.is_submitting());
    }
}
