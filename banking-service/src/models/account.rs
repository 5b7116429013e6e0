use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "inactive" => Self::Inactive,
            "closed" => Self::Closed,
            _ => Self::Active,
        }
    }
}

/// A remote bank account reached through a connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BankingAccount {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub external_account_id: String,
    pub iban: Option<String>,
    pub account_number: Option<String>,
    pub name: Option<String>,
    pub currency: String,
    pub balance: Decimal,
    pub account_type: Option<String>,
    pub bank_name: Option<String>,
    pub bank_country: Option<String>,
    pub account_holder_name: Option<String>,
    pub status: AccountStatus,
    pub balance_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Account fields captured when a link completes.
#[derive(Debug, Clone)]
pub struct NewBankingAccount {
    pub external_account_id: String,
    pub iban: Option<String>,
    pub account_number: Option<String>,
    pub name: Option<String>,
    pub currency: String,
    pub balance: Decimal,
    pub account_type: Option<String>,
    pub bank_name: Option<String>,
    pub bank_country: Option<String>,
    pub account_holder_name: Option<String>,
    pub status: AccountStatus,
}

impl NewBankingAccount {
    pub fn into_account(self, connection_id: Uuid, now: DateTime<Utc>) -> BankingAccount {
        BankingAccount {
            id: Uuid::new_v4(),
            connection_id,
            external_account_id: self.external_account_id,
            iban: self.iban,
            account_number: self.account_number,
            name: self.name,
            currency: self.currency,
            balance: self.balance,
            account_type: self.account_type,
            bank_name: self.bank_name,
            bank_country: self.bank_country,
            account_holder_name: self.account_holder_name,
            status: self.status,
            balance_updated_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }
}
