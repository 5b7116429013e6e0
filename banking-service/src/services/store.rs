//! Persistence contract shared by the Postgres and in-memory stores.

use crate::error::Result;
use crate::models::{
    AccountStatus, BankingAccount, BankingConnection, BankingTransactionRecord, ConnectionStatus,
    NewBankingAccount, SyncLog, SyncLogClose,
};
use crate::providers::BankingTransactionData;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Values written when a pending connection's callback is consumed.
#[derive(Debug, Clone)]
pub struct LinkCompletion {
    pub status: ConnectionStatus,
    pub external_connection_id: String,
    pub encrypted_secret: Option<String>,
    pub authorized_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A status change on an established connection.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: ConnectionStatus,
    /// Replaces `authorized_at` when set.
    pub authorized_at: Option<DateTime<Utc>>,
    /// Replaces `expires_at` when set.
    pub expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl StatusUpdate {
    pub fn to(status: ConnectionStatus) -> Self {
        Self {
            status,
            authorized_at: None,
            expires_at: None,
            last_error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

/// Row counts from applying one provider snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncBatchOutcome {
    pub inserted: i32,
    pub updated: i32,
    pub unchanged: i32,
    pub balance_updated: bool,
}

/// Whether a stored transaction needs a status or signed-amount correction.
///
/// Date, description and merchant are kept as first recorded.
pub fn transaction_changed(existing: &BankingTransactionRecord, incoming: &BankingTransactionData) -> bool {
    existing.status != incoming.status
        || existing.amount != incoming.magnitude()
        || existing.direction != incoming.direction()
}

/// Storage for connections, accounts, transactions and sync logs.
///
/// Connection writes are compare-and-set on the current status and fail with
/// `BankingError::Conflict` when another writer got there first.
#[async_trait]
pub trait BankingStore: Send + Sync {
    async fn insert_pending_connection(&self, connection: &BankingConnection) -> Result<()>;

    async fn get_connection(&self, id: Uuid) -> Result<Option<BankingConnection>>;

    async fn list_connections_for_user(&self, user_id: Uuid) -> Result<Vec<BankingConnection>>;

    async fn list_connections_by_status(&self, status: ConnectionStatus) -> Result<Vec<BankingConnection>>;

    /// Move a `PENDING` connection out of `PENDING`, clear its link-state
    /// record and insert its accounts, all or nothing.
    async fn complete_link(
        &self,
        id: Uuid,
        completion: &LinkCompletion,
        accounts: &[NewBankingAccount],
    ) -> Result<BankingConnection>;

    async fn update_connection_status(
        &self,
        id: Uuid,
        expected: ConnectionStatus,
        update: &StatusUpdate,
    ) -> Result<BankingConnection>;

    async fn get_account(&self, id: Uuid) -> Result<Option<BankingAccount>>;

    async fn list_accounts(&self, connection_id: Uuid) -> Result<Vec<BankingAccount>>;

    async fn update_account_status(&self, id: Uuid, status: AccountStatus) -> Result<()>;

    /// Upsert transactions by `(account_id, external_transaction_id)` and set
    /// the balance, in one transaction.
    async fn apply_sync_batch(
        &self,
        account_id: Uuid,
        transactions: &[BankingTransactionData],
        balance: Decimal,
    ) -> Result<SyncBatchOutcome>;

    async fn list_transactions(&self, account_id: Uuid) -> Result<Vec<BankingTransactionRecord>>;

    async fn open_sync_log(&self, log: &SyncLog) -> Result<()>;

    /// Close an open log. Closing a log twice is a `Conflict`.
    async fn close_sync_log(&self, id: Uuid, close: &SyncLogClose) -> Result<SyncLog>;

    async fn list_sync_logs(&self, account_id: Uuid) -> Result<Vec<SyncLog>>;

    /// Most recent `SYNCED` log for the account.
    async fn last_successful_sync(&self, account_id: Uuid) -> Result<Option<SyncLog>>;

    async fn health_check(&self) -> Result<()>;
}
