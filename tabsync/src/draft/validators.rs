use super::{AmountType, DraftError, TxDraft};
use crate::cache::{entities::payment_category_for, BalanceDelta, BudgetSnapshot};
use uuid::Uuid;
use ynab_api::endpoints::transactions::{NewTransaction, ReconciliationStatus};
use ynab_api::endpoints::Milliunits;

const MAX_FRACTION_DIGITS: usize = 3;

/// Parse an unsigned decimal amount into milliunits.
///
/// Accepts `130`, `130.`, `130.5`, `.5` and at most three fractional digits.
/// An empty string is an amount not entered yet.
pub fn parse_amount(input: &str) -> Result<Option<Milliunits>, DraftError> {
    if input.is_empty() {
        return Ok(None);
    }
    let invalid = || DraftError::InvalidAmount(input.to_string());

    let (whole, fraction) = input.split_once('.').unwrap_or((input, ""));
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty())
        || !all_digits(whole)
        || !all_digits(fraction)
        || fraction.len() > MAX_FRACTION_DIGITS
    {
        return Err(invalid());
    }

    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let fraction: i64 = format!("{fraction:0<3}").parse().map_err(|_| invalid())?;

    whole
        .checked_mul(1000)
        .and_then(|units| units.checked_add(fraction))
        .map(|units| Some(Milliunits::new(units)))
        .ok_or_else(invalid)
}

/// Account the selected payee transfers into, unless it is the draft's own.
pub fn transfer_target(draft: &TxDraft, snapshot: &BudgetSnapshot) -> Option<Uuid> {
    let payee = snapshot.payees.get(&draft.payee_id?)?;
    payee
        .transfer_account_id
        .filter(|target| Some(*target) != draft.account_id)
}

/// Re-derive `is_transfer` and, for an untouched category, the auto-filled
/// payment category of a credit card target.
///
/// A category the user chose is never overwritten. An untouched category is
/// always the auto-filled one, so it is cleared when no longer applicable.
pub fn apply_transfer_rules(draft: &mut TxDraft, snapshot: &BudgetSnapshot) {
    let target = transfer_target(draft, snapshot);
    draft.is_transfer = target.is_some();

    if !draft.category_touched {
        draft.category_id = target
            .and_then(|id| snapshot.accounts.get(&id))
            .and_then(|account| payment_category_for(account, &snapshot.categories));
    }
}

/// A draft that passed validation, ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub transaction: NewTransaction,
    pub delta: BalanceDelta,
}

pub fn validate(draft: &TxDraft, snapshot: &BudgetSnapshot) -> Result<Commit, DraftError> {
    let magnitude = parse_amount(&draft.amount)?.ok_or(DraftError::Missing("amount"))?;
    if !magnitude.is_positive() {
        return Err(DraftError::NotPositive);
    }
    let account_id = draft.account_id.ok_or(DraftError::Missing("account"))?;
    if draft.category_id.is_none() && !draft.is_transfer {
        return Err(DraftError::Missing("category"));
    }

    let amount = match draft.amount_type {
        AmountType::Inflow => magnitude,
        AmountType::Outflow => -magnitude,
    };

    let mut transaction = NewTransaction::new(account_id, draft.date, amount);
    transaction.payee_id = draft.payee_id;
    transaction.category_id = draft.category_id;
    transaction.memo = Some(draft.memo.trim().to_string()).filter(|memo| !memo.is_empty());
    transaction.flag_color = draft.flag;
    transaction.cleared = Some(if draft.cleared {
        ReconciliationStatus::Cleared
    } else {
        ReconciliationStatus::Uncleared
    });
    transaction.approved = Some(true);

    Ok(Commit {
        transaction,
        delta: BalanceDelta {
            account_id,
            category_id: draft.category_id,
            transfer_account_id: transfer_target(draft, snapshot),
            amount,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_convert_exactly() {
        let parse = |s| parse_amount(s).unwrap().map(|m| m.inner());
        assert_eq!(parse("130.00"), Some(130_000));
        assert_eq!(parse("130"), Some(130_000));
        assert_eq!(parse("130."), Some(130_000));
        assert_eq!(parse("0.1"), Some(100));
        assert_eq!(parse(".005"), Some(5));
        assert_eq!(parse("19.999"), Some(19_999));
        assert_eq!(parse(""), None);
    }

    #[test]
    fn malformed_amounts_are_rejected() {
        for input in ["-5", "+5", "1.2345", "1,50", "1.2.3", ".", "abc", " 5", "99999999999999999999"] {
            assert_eq!(
                parse_amount(input),
                Err(DraftError::InvalidAmount(input.to_string())),
                "{input}"
            );
        }
    }
}
