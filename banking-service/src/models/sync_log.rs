use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BankingSyncStatus {
    Syncing,
    Synced,
    Error,
}

impl BankingSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syncing => "SYNCING",
            Self::Synced => "SYNCED",
            Self::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "SYNCED" => Self::Synced,
            "ERROR" => Self::Error,
            _ => Self::Syncing,
        }
    }
}

/// One row per sync attempt; closed exactly once.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLog {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub account_id: Uuid,
    pub status: BankingSyncStatus,
    pub accounts_synced: i32,
    pub transactions_synced: i32,
    pub transactions_inserted: i32,
    pub transactions_updated: i32,
    pub balance_updated: bool,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncLog {
    pub fn open(connection_id: Uuid, account_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id,
            account_id,
            status: BankingSyncStatus::Syncing,
            accounts_synced: 0,
            transactions_synced: 0,
            transactions_inserted: 0,
            transactions_updated: 0,
            balance_updated: false,
            error: None,
            error_code: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Final values written when a sync attempt ends.
#[derive(Debug, Clone)]
pub struct SyncLogClose {
    pub status: BankingSyncStatus,
    pub accounts_synced: i32,
    pub transactions_inserted: i32,
    pub transactions_updated: i32,
    pub balance_updated: bool,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

impl SyncLogClose {
    pub fn synced(inserted: i32, updated: i32, balance_updated: bool) -> Self {
        Self {
            status: BankingSyncStatus::Synced,
            accounts_synced: 1,
            transactions_inserted: inserted,
            transactions_updated: updated,
            balance_updated,
            error: None,
            error_code: None,
        }
    }

    pub fn failed(code: &str, message: String) -> Self {
        Self {
            status: BankingSyncStatus::Error,
            accounts_synced: 0,
            transactions_inserted: 0,
            transactions_updated: 0,
            balance_updated: false,
            error: Some(message),
            error_code: Some(code.to_string()),
        }
    }

    pub fn apply_to(&self, log: &mut SyncLog, completed_at: DateTime<Utc>) {
        log.status = self.status;
        log.accounts_synced = self.accounts_synced;
        log.transactions_inserted = self.transactions_inserted;
        log.transactions_updated = self.transactions_updated;
        log.transactions_synced = self.transactions_inserted + self.transactions_updated;
        log.balance_updated = self.balance_updated;
        log.error = self.error.clone();
        log.error_code = self.error_code.clone();
        log.completed_at = Some(completed_at);
    }
}
