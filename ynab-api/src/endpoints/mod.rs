pub mod accounts;
pub mod budgets;
pub mod categories;
pub mod payees;
pub mod transactions;

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Default, Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BudgetId {
    #[serde(rename = "last-used")]
    LastUsed,
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(untagged)]
    Uuid(Uuid),
}

impl Display for BudgetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LastUsed => f.write_str("last-used"),
            Self::Default => f.write_str("default"),
            Self::Uuid(uuid) => uuid.fmt(f),
        }
    }
}

impl From<Uuid> for BudgetId {
    fn from(uuid: Uuid) -> Self {
        BudgetId::Uuid(uuid)
    }
}

impl FromStr for BudgetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last-used" => Ok(BudgetId::LastUsed),
            "default" => Ok(BudgetId::Default),
            _ => Uuid::parse_str(s).map(BudgetId::Uuid),
        }
    }
}

/// Money in thousandths of the budget currency unit (1000 = 1.00).
#[derive(
    Default, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Milliunits(i64);

impl Milliunits {
    pub const ZERO: Milliunits = Milliunits(0);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn inner(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }
}

impl From<i64> for Milliunits {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Milliunits> for i64 {
    fn from(value: Milliunits) -> Self {
        value.0
    }
}

impl std::ops::Add for Milliunits {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Milliunits {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for Milliunits {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl std::ops::SubAssign for Milliunits {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl std::ops::Neg for Milliunits {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Self(-self.0)
    }
}

impl std::iter::Sum for Milliunits {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, x| acc + x)
    }
}

impl Display for Milliunits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:03}", sign, abs / 1000, abs % 1000)
    }
}

/// Transaction identifier as issued by the API.
///
/// Scheduled and transfer transactions carry suffixed ids
/// (`<uuid>_2024-01-31`, `<uuid>_t_2024-01-31`), so the id is kept opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base uuid of the id, ignoring any date/transfer suffix.
    pub fn uuid(&self) -> Option<Uuid> {
        let base = self.0.split('_').next().unwrap_or(&self.0);
        Uuid::parse_str(base).ok()
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for TransactionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyFormat {
    pub iso_code: String,
    pub decimal_digits: i32,
    pub decimal_separator: String,
    pub symbol_first: bool,
    pub group_separator: String,
    pub currency_symbol: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_id_parses_keywords_and_uuids() {
        assert_eq!("last-used".parse::<BudgetId>().unwrap(), BudgetId::LastUsed);
        assert_eq!("default".parse::<BudgetId>().unwrap(), BudgetId::Default);

        let uuid = Uuid::new_v4();
        assert_eq!(
            uuid.to_string().parse::<BudgetId>().unwrap(),
            BudgetId::Uuid(uuid)
        );
        assert!("not-a-budget".parse::<BudgetId>().is_err());
    }

    #[test]
    fn milliunits_display_keeps_three_decimals() {
        assert_eq!(Milliunits::new(130_000).to_string(), "130.000");
        assert_eq!(Milliunits::new(-1_005).to_string(), "-1.005");
        assert_eq!(Milliunits::new(5).to_string(), "0.005");
    }

    #[test]
    fn milliunits_serialize_as_plain_integers() {
        let json = serde_json::to_string(&Milliunits::new(-4200)).unwrap();
        assert_eq!(json, "-4200");
        let back: Milliunits = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Milliunits::new(-4200));
    }

    #[test]
    fn transaction_id_strips_suffix_for_uuid() {
        let uuid = Uuid::new_v4();
        let id = TransactionId::new(format!("{}_t_2019-07-31", uuid));
        assert_eq!(id.uuid(), Some(uuid));
        assert_eq!(TransactionId::new("temp").uuid(), None);
    }
}
