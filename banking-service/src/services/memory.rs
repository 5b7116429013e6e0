//! In-process [`BankingStore`] for tests and database-less local runs.

use super::store::{transaction_changed, BankingStore, LinkCompletion, StatusUpdate, SyncBatchOutcome};
use crate::error::{BankingError, Result};
use crate::models::{
    AccountStatus, BankingAccount, BankingConnection, BankingSyncStatus, BankingTransactionRecord,
    ConnectionStatus, NewBankingAccount, SyncLog, SyncLogClose,
};
use crate::providers::BankingTransactionData;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    connections: HashMap<Uuid, BankingConnection>,
    accounts: HashMap<Uuid, BankingAccount>,
    transactions: HashMap<(Uuid, String), BankingTransactionRecord>,
    sync_logs: Vec<SyncLog>,
}

/// Every operation holds the table lock for its whole duration, so batch
/// writes are atomic with respect to readers.
#[derive(Default)]
pub struct InMemoryBankingStore {
    tables: RwLock<Tables>,
}

impl InMemoryBankingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transaction_count(&self) -> usize {
        self.tables.read().await.transactions.len()
    }

    pub async fn sync_log_count(&self) -> usize {
        self.tables.read().await.sync_logs.len()
    }
}

fn conflict_for(connection: &BankingConnection, expected: ConnectionStatus) -> BankingError {
    BankingError::Conflict(format!(
        "connection {} is {}, expected {}",
        connection.id, connection.status, expected
    ))
}

#[async_trait]
impl BankingStore for InMemoryBankingStore {
    async fn insert_pending_connection(&self, connection: &BankingConnection) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.connections.contains_key(&connection.id) {
            return Err(BankingError::Conflict(format!(
                "connection {} already exists",
                connection.id
            )));
        }
        tables.connections.insert(connection.id, connection.clone());
        Ok(())
    }

    async fn get_connection(&self, id: Uuid) -> Result<Option<BankingConnection>> {
        Ok(self.tables.read().await.connections.get(&id).cloned())
    }

    async fn list_connections_for_user(&self, user_id: Uuid) -> Result<Vec<BankingConnection>> {
        let tables = self.tables.read().await;
        let mut connections: Vec<BankingConnection> = tables
            .connections
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        connections.sort_by_key(|c| c.created_at);
        Ok(connections)
    }

    async fn list_connections_by_status(&self, status: ConnectionStatus) -> Result<Vec<BankingConnection>> {
        let tables = self.tables.read().await;
        let mut connections: Vec<BankingConnection> = tables
            .connections
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        connections.sort_by_key(|c| c.created_at);
        Ok(connections)
    }

    async fn complete_link(
        &self,
        id: Uuid,
        completion: &LinkCompletion,
        accounts: &[NewBankingAccount],
    ) -> Result<BankingConnection> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();

        let current = tables
            .connections
            .get(&id)
            .ok_or_else(|| BankingError::NotFound(format!("Connection {}", id)))?;
        if current.status != ConnectionStatus::Pending {
            return Err(conflict_for(current, ConnectionStatus::Pending));
        }

        let mut seen = std::collections::HashSet::new();
        if accounts.iter().any(|a| !seen.insert(a.external_account_id.as_str())) {
            return Err(BankingError::Conflict(
                "duplicate external account id in link".to_string(),
            ));
        }

        let mut updated = current.clone();
        updated.status = completion.status;
        updated.external_connection_id = Some(completion.external_connection_id.clone());
        updated.encrypted_secret = completion.encrypted_secret.clone();
        updated.authorized_at = completion.authorized_at;
        updated.expires_at = completion.expires_at;
        updated.last_error = completion.last_error.clone();
        updated.link_state_hash = None;
        updated.link_state_expires_at = None;
        updated.updated_at = now;

        for account in accounts {
            let account = account.clone().into_account(id, now);
            tables.accounts.insert(account.id, account);
        }
        tables.connections.insert(id, updated.clone());
        Ok(updated)
    }

    async fn update_connection_status(
        &self,
        id: Uuid,
        expected: ConnectionStatus,
        update: &StatusUpdate,
    ) -> Result<BankingConnection> {
        let mut tables = self.tables.write().await;
        let connection = tables
            .connections
            .get_mut(&id)
            .ok_or_else(|| BankingError::NotFound(format!("Connection {}", id)))?;
        if connection.status != expected {
            return Err(conflict_for(connection, expected));
        }

        connection.status = update.status;
        if let Some(at) = update.authorized_at {
            connection.authorized_at = Some(at);
        }
        if let Some(at) = update.expires_at {
            connection.expires_at = Some(at);
        }
        connection.last_error = update.last_error.clone();
        connection.updated_at = Utc::now();
        Ok(connection.clone())
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<BankingAccount>> {
        Ok(self.tables.read().await.accounts.get(&id).cloned())
    }

    async fn list_accounts(&self, connection_id: Uuid) -> Result<Vec<BankingAccount>> {
        let tables = self.tables.read().await;
        let mut accounts: Vec<BankingAccount> = tables
            .accounts
            .values()
            .filter(|a| a.connection_id == connection_id)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.external_account_id.cmp(&b.external_account_id));
        Ok(accounts)
    }

    async fn update_account_status(&self, id: Uuid, status: AccountStatus) -> Result<()> {
        let mut tables = self.tables.write().await;
        let account = tables
            .accounts
            .get_mut(&id)
            .ok_or_else(|| BankingError::NotFound(format!("Account {}", id)))?;
        account.status = status;
        account.updated_at = Utc::now();
        Ok(())
    }

    async fn apply_sync_batch(
        &self,
        account_id: Uuid,
        transactions: &[BankingTransactionData],
        balance: Decimal,
    ) -> Result<SyncBatchOutcome> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        if !tables.accounts.contains_key(&account_id) {
            return Err(BankingError::NotFound(format!("Account {}", account_id)));
        }

        let mut outcome = SyncBatchOutcome::default();
        for tx in transactions {
            let key = (account_id, tx.external_transaction_id.clone());
            match tables.transactions.get_mut(&key) {
                Some(existing) if transaction_changed(existing, tx) => {
                    existing.status = tx.status;
                    existing.amount = tx.magnitude();
                    existing.direction = tx.direction();
                    existing.updated_at = now;
                    outcome.updated += 1;
                }
                Some(_) => outcome.unchanged += 1,
                None => {
                    tables.transactions.insert(
                        key,
                        BankingTransactionRecord {
                            id: Uuid::new_v4(),
                            account_id,
                            external_transaction_id: tx.external_transaction_id.clone(),
                            date: tx.date,
                            amount: tx.magnitude(),
                            direction: tx.direction(),
                            currency: tx.currency.clone(),
                            description: tx.description.clone(),
                            merchant: tx.merchant.clone(),
                            status: tx.status,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                    outcome.inserted += 1;
                }
            }
        }

        if let Some(account) = tables.accounts.get_mut(&account_id) {
            if account.balance != balance {
                account.balance = balance;
                account.balance_updated_at = Some(now);
                account.updated_at = now;
                outcome.balance_updated = true;
            }
        }

        Ok(outcome)
    }

    async fn list_transactions(&self, account_id: Uuid) -> Result<Vec<BankingTransactionRecord>> {
        let tables = self.tables.read().await;
        let mut transactions: Vec<BankingTransactionRecord> = tables
            .transactions
            .values()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect();
        transactions.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then_with(|| a.external_transaction_id.cmp(&b.external_transaction_id))
        });
        Ok(transactions)
    }

    async fn open_sync_log(&self, log: &SyncLog) -> Result<()> {
        self.tables.write().await.sync_logs.push(log.clone());
        Ok(())
    }

    async fn close_sync_log(&self, id: Uuid, close: &SyncLogClose) -> Result<SyncLog> {
        let mut tables = self.tables.write().await;
        let log = tables
            .sync_logs
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| BankingError::NotFound(format!("Sync log {}", id)))?;
        if log.is_closed() {
            return Err(BankingError::Conflict(format!("sync log {} already closed", id)));
        }
        close.apply_to(log, Utc::now());
        Ok(log.clone())
    }

    async fn list_sync_logs(&self, account_id: Uuid) -> Result<Vec<SyncLog>> {
        let tables = self.tables.read().await;
        let mut logs: Vec<SyncLog> = tables
            .sync_logs
            .iter()
            .filter(|l| l.account_id == account_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(logs)
    }

    async fn last_successful_sync(&self, account_id: Uuid) -> Result<Option<SyncLog>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sync_logs
            .iter()
            .filter(|l| l.account_id == account_id && l.status == BankingSyncStatus::Synced)
            .max_by_key(|l| l.started_at)
            .cloned())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
