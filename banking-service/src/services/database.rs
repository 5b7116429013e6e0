//! PostgreSQL [`BankingStore`].

use super::store::{BankingStore, LinkCompletion, StatusUpdate, SyncBatchOutcome};
use crate::error::{BankingError, Result};
use crate::models::{
    AccountStatus, BankingAccount, BankingConnection, BankingSyncStatus, BankingTransactionRecord,
    ConnectionStatus, NewBankingAccount, ProviderKind, SyncLog, SyncLogClose, TransactionDirection,
    TransactionStatus,
};
use crate::providers::BankingTransactionData;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const CONNECTION_COLUMNS: &str = "id, user_id, provider, status, external_connection_id, encrypted_secret, \
     authorized_at, expires_at, last_error, link_state_hash, link_state_expires_at, created_at, updated_at";

const ACCOUNT_COLUMNS: &str = "id, connection_id, external_account_id, iban, account_number, name, currency, \
     balance, account_type, bank_name, bank_country, account_holder_name, status, balance_updated_at, \
     created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, account_id, external_transaction_id, date, amount, direction, currency, \
     description, merchant, status, created_at, updated_at";

const SYNC_LOG_COLUMNS: &str = "id, connection_id, account_id, status, accounts_synced, transactions_synced, \
     transactions_inserted, transactions_updated, balance_updated, error, error_code, started_at, completed_at";

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, FromRow)]
struct ConnectionRow {
    id: Uuid,
    user_id: Uuid,
    provider: String,
    status: String,
    external_connection_id: Option<String>,
    encrypted_secret: Option<String>,
    authorized_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    link_state_hash: Option<String>,
    link_state_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn decode_error(what: &str, value: &str) -> BankingError {
    BankingError::Database(sqlx::Error::Decode(
        format!("unknown {} '{}'", what, value).into(),
    ))
}

impl TryFrom<ConnectionRow> for BankingConnection {
    type Error = BankingError;

    fn try_from(row: ConnectionRow) -> Result<Self> {
        let provider =
            ProviderKind::from_str(&row.provider).ok_or_else(|| decode_error("provider", &row.provider))?;
        let status =
            ConnectionStatus::from_str(&row.status).ok_or_else(|| decode_error("status", &row.status))?;
        Ok(BankingConnection {
            id: row.id,
            user_id: row.user_id,
            provider,
            status,
            external_connection_id: row.external_connection_id,
            encrypted_secret: row.encrypted_secret,
            authorized_at: row.authorized_at,
            expires_at: row.expires_at,
            last_error: row.last_error,
            link_state_hash: row.link_state_hash,
            link_state_expires_at: row.link_state_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AccountRow {
    id: Uuid,
    connection_id: Uuid,
    external_account_id: String,
    iban: Option<String>,
    account_number: Option<String>,
    name: Option<String>,
    currency: String,
    balance: Decimal,
    account_type: Option<String>,
    bank_name: Option<String>,
    bank_country: Option<String>,
    account_holder_name: Option<String>,
    status: String,
    balance_updated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for BankingAccount {
    fn from(row: AccountRow) -> Self {
        BankingAccount {
            id: row.id,
            connection_id: row.connection_id,
            external_account_id: row.external_account_id,
            iban: row.iban,
            account_number: row.account_number,
            name: row.name,
            currency: row.currency,
            balance: row.balance,
            account_type: row.account_type,
            bank_name: row.bank_name,
            bank_country: row.bank_country,
            account_holder_name: row.account_holder_name,
            status: AccountStatus::from_str(&row.status),
            balance_updated_at: row.balance_updated_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    account_id: Uuid,
    external_transaction_id: String,
    date: NaiveDate,
    amount: Decimal,
    direction: String,
    currency: String,
    description: Option<String>,
    merchant: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TransactionRow> for BankingTransactionRecord {
    fn from(row: TransactionRow) -> Self {
        BankingTransactionRecord {
            id: row.id,
            account_id: row.account_id,
            external_transaction_id: row.external_transaction_id,
            date: row.date,
            amount: row.amount,
            direction: TransactionDirection::from_str(&row.direction),
            currency: row.currency,
            description: row.description,
            merchant: row.merchant,
            status: TransactionStatus::from_str(&row.status),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct SyncLogRow {
    id: Uuid,
    connection_id: Uuid,
    account_id: Uuid,
    status: String,
    accounts_synced: i32,
    transactions_synced: i32,
    transactions_inserted: i32,
    transactions_updated: i32,
    balance_updated: bool,
    error: Option<String>,
    error_code: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<SyncLogRow> for SyncLog {
    fn from(row: SyncLogRow) -> Self {
        SyncLog {
            id: row.id,
            connection_id: row.connection_id,
            account_id: row.account_id,
            status: BankingSyncStatus::from_str(&row.status),
            accounts_synced: row.accounts_synced,
            transactions_synced: row.transactions_synced,
            transactions_inserted: row.transactions_inserted,
            transactions_updated: row.transactions_updated,
            balance_updated: row.balance_updated,
            error: row.error,
            error_code: row.error_code,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PgBankingStore {
    pool: PgPool,
}

impl PgBankingStore {
    #[instrument(skip(database_url), fields(service = "banking-service"))]
    pub async fn connect(database_url: &str, max_connections: u32, min_connections: u32) -> Result<Self> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BankingError::Database(e.into()))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn current_status(&self, id: Uuid) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM banking_connections WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(status,)| status))
    }

    /// Explain why a compare-and-set update matched no row.
    async fn cas_failure(&self, id: Uuid, expected: ConnectionStatus) -> BankingError {
        match self.current_status(id).await {
            Ok(Some(actual)) => BankingError::Conflict(format!(
                "connection {} is {}, expected {}",
                id, actual, expected
            )),
            Ok(None) => BankingError::NotFound(format!("Connection {}", id)),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl BankingStore for PgBankingStore {
    #[instrument(skip(self, connection), fields(connection_id = %connection.id))]
    async fn insert_pending_connection(&self, connection: &BankingConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO banking_connections
                (id, user_id, provider, status, link_state_hash, link_state_expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(connection.id)
        .bind(connection.user_id)
        .bind(connection.provider.as_str())
        .bind(connection.status.as_str())
        .bind(&connection.link_state_hash)
        .bind(connection.link_state_expires_at)
        .bind(connection.created_at)
        .bind(connection.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_connection(&self, id: Uuid) -> Result<Option<BankingConnection>> {
        let query = format!("SELECT {} FROM banking_connections WHERE id = $1", CONNECTION_COLUMNS);
        sqlx::query_as::<_, ConnectionRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(BankingConnection::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn list_connections_for_user(&self, user_id: Uuid) -> Result<Vec<BankingConnection>> {
        let query = format!(
            "SELECT {} FROM banking_connections WHERE user_id = $1 ORDER BY created_at",
            CONNECTION_COLUMNS
        );
        sqlx::query_as::<_, ConnectionRow>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(BankingConnection::try_from)
            .collect()
    }

    #[instrument(skip(self))]
    async fn list_connections_by_status(&self, status: ConnectionStatus) -> Result<Vec<BankingConnection>> {
        let query = format!(
            "SELECT {} FROM banking_connections WHERE status = $1 ORDER BY created_at",
            CONNECTION_COLUMNS
        );
        sqlx::query_as::<_, ConnectionRow>(&query)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(BankingConnection::try_from)
            .collect()
    }

    #[instrument(skip(self, completion, accounts), fields(status = %completion.status, accounts = accounts.len()))]
    async fn complete_link(
        &self,
        id: Uuid,
        completion: &LinkCompletion,
        accounts: &[NewBankingAccount],
    ) -> Result<BankingConnection> {
        let mut tx = self.pool.begin().await?;

        let query = format!(
            r#"
            UPDATE banking_connections
            SET status = $2, external_connection_id = $3, encrypted_secret = $4,
                authorized_at = $5, expires_at = $6, last_error = $7,
                link_state_hash = NULL, link_state_expires_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            RETURNING {}
            "#,
            CONNECTION_COLUMNS
        );
        let row = sqlx::query_as::<_, ConnectionRow>(&query)
            .bind(id)
            .bind(completion.status.as_str())
            .bind(&completion.external_connection_id)
            .bind(&completion.encrypted_secret)
            .bind(completion.authorized_at)
            .bind(completion.expires_at)
            .bind(&completion.last_error)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(self.cas_failure(id, ConnectionStatus::Pending).await);
        };

        let now = Utc::now();
        for account in accounts {
            let account = account.clone().into_account(id, now);
            sqlx::query(
                r#"
                INSERT INTO banking_accounts
                    (id, connection_id, external_account_id, iban, account_number, name, currency, balance,
                     account_type, bank_name, bank_country, account_holder_name, status, balance_updated_at,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(account.id)
            .bind(account.connection_id)
            .bind(&account.external_account_id)
            .bind(&account.iban)
            .bind(&account.account_number)
            .bind(&account.name)
            .bind(&account.currency)
            .bind(account.balance)
            .bind(&account.account_type)
            .bind(&account.bank_name)
            .bind(&account.bank_country)
            .bind(&account.account_holder_name)
            .bind(account.status.as_str())
            .bind(account.balance_updated_at)
            .bind(account.created_at)
            .bind(account.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Link completion committed");
        BankingConnection::try_from(row)
    }

    #[instrument(skip(self, update), fields(to = %update.status))]
    async fn update_connection_status(
        &self,
        id: Uuid,
        expected: ConnectionStatus,
        update: &StatusUpdate,
    ) -> Result<BankingConnection> {
        let query = format!(
            r#"
            UPDATE banking_connections
            SET status = $3,
                authorized_at = COALESCE($4, authorized_at),
                expires_at = COALESCE($5, expires_at),
                last_error = $6,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            CONNECTION_COLUMNS
        );
        let row = sqlx::query_as::<_, ConnectionRow>(&query)
            .bind(id)
            .bind(expected.as_str())
            .bind(update.status.as_str())
            .bind(update.authorized_at)
            .bind(update.expires_at)
            .bind(&update.last_error)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => BankingConnection::try_from(row),
            None => Err(self.cas_failure(id, expected).await),
        }
    }

    #[instrument(skip(self))]
    async fn get_account(&self, id: Uuid) -> Result<Option<BankingAccount>> {
        let query = format!("SELECT {} FROM banking_accounts WHERE id = $1", ACCOUNT_COLUMNS);
        Ok(sqlx::query_as::<_, AccountRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(BankingAccount::from))
    }

    #[instrument(skip(self))]
    async fn list_accounts(&self, connection_id: Uuid) -> Result<Vec<BankingAccount>> {
        let query = format!(
            "SELECT {} FROM banking_accounts WHERE connection_id = $1 ORDER BY external_account_id",
            ACCOUNT_COLUMNS
        );
        Ok(sqlx::query_as::<_, AccountRow>(&query)
            .bind(connection_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(BankingAccount::from)
            .collect())
    }

    #[instrument(skip(self))]
    async fn update_account_status(&self, id: Uuid, status: AccountStatus) -> Result<()> {
        let result = sqlx::query("UPDATE banking_accounts SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BankingError::NotFound(format!("Account {}", id)));
        }
        Ok(())
    }

    #[instrument(skip(self, transactions), fields(transactions = transactions.len()))]
    async fn apply_sync_batch(
        &self,
        account_id: Uuid,
        transactions: &[BankingTransactionData],
        balance: Decimal,
    ) -> Result<SyncBatchOutcome> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent batches for the same account.
        let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM banking_accounts WHERE id = $1 FOR UPDATE")
            .bind(account_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            tx.rollback().await?;
            return Err(BankingError::NotFound(format!("Account {}", account_id)));
        }

        let mut outcome = SyncBatchOutcome::default();
        for item in transactions {
            let written: Option<(bool,)> = sqlx::query_as(
                r#"
                INSERT INTO banking_transactions
                    (id, account_id, external_transaction_id, date, amount, direction, currency,
                     description, merchant, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (account_id, external_transaction_id) DO UPDATE
                SET amount = EXCLUDED.amount,
                    direction = EXCLUDED.direction,
                    status = EXCLUDED.status,
                    updated_at = NOW()
                WHERE (banking_transactions.amount, banking_transactions.direction, banking_transactions.status)
                      IS DISTINCT FROM
                      (EXCLUDED.amount, EXCLUDED.direction, EXCLUDED.status)
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(account_id)
            .bind(&item.external_transaction_id)
            .bind(item.date)
            .bind(item.magnitude())
            .bind(item.direction().as_str())
            .bind(&item.currency)
            .bind(&item.description)
            .bind(&item.merchant)
            .bind(item.status.as_str())
            .fetch_optional(&mut *tx)
            .await?;

            match written {
                Some((true,)) => outcome.inserted += 1,
                Some((false,)) => outcome.updated += 1,
                None => outcome.unchanged += 1,
            }
        }

        let balance_result = sqlx::query(
            r#"
            UPDATE banking_accounts
            SET balance = $2, balance_updated_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND balance IS DISTINCT FROM $2
            "#,
        )
        .bind(account_id)
        .bind(balance)
        .execute(&mut *tx)
        .await?;
        outcome.balance_updated = balance_result.rows_affected() > 0;

        tx.commit().await?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn list_transactions(&self, account_id: Uuid) -> Result<Vec<BankingTransactionRecord>> {
        let query = format!(
            "SELECT {} FROM banking_transactions WHERE account_id = $1 ORDER BY date DESC, external_transaction_id",
            TRANSACTION_COLUMNS
        );
        Ok(sqlx::query_as::<_, TransactionRow>(&query)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(BankingTransactionRecord::from)
            .collect())
    }

    #[instrument(skip(self, log), fields(sync_log_id = %log.id))]
    async fn open_sync_log(&self, log: &SyncLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO banking_sync_logs (id, connection_id, account_id, status, started_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(log.id)
        .bind(log.connection_id)
        .bind(log.account_id)
        .bind(log.status.as_str())
        .bind(log.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, close), fields(status = close.status.as_str()))]
    async fn close_sync_log(&self, id: Uuid, close: &SyncLogClose) -> Result<SyncLog> {
        let query = format!(
            r#"
            UPDATE banking_sync_logs
            SET status = $2, accounts_synced = $3, transactions_synced = $4 + $5,
                transactions_inserted = $4, transactions_updated = $5, balance_updated = $6,
                error = $7, error_code = $8, completed_at = NOW()
            WHERE id = $1 AND completed_at IS NULL
            RETURNING {}
            "#,
            SYNC_LOG_COLUMNS
        );
        let row = sqlx::query_as::<_, SyncLogRow>(&query)
            .bind(id)
            .bind(close.status.as_str())
            .bind(close.accounts_synced)
            .bind(close.transactions_inserted)
            .bind(close.transactions_updated)
            .bind(close.balance_updated)
            .bind(&close.error)
            .bind(&close.error_code)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => {
                let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM banking_sync_logs WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
                Err(match exists {
                    Some(_) => BankingError::Conflict(format!("sync log {} already closed", id)),
                    None => BankingError::NotFound(format!("Sync log {}", id)),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn list_sync_logs(&self, account_id: Uuid) -> Result<Vec<SyncLog>> {
        let query = format!(
            "SELECT {} FROM banking_sync_logs WHERE account_id = $1 ORDER BY started_at DESC",
            SYNC_LOG_COLUMNS
        );
        Ok(sqlx::query_as::<_, SyncLogRow>(&query)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(SyncLog::from)
            .collect())
    }

    #[instrument(skip(self))]
    async fn last_successful_sync(&self, account_id: Uuid) -> Result<Option<SyncLog>> {
        let query = format!(
            "SELECT {} FROM banking_sync_logs WHERE account_id = $1 AND status = 'SYNCED' \
             ORDER BY started_at DESC LIMIT 1",
            SYNC_LOG_COLUMNS
        );
        Ok(sqlx::query_as::<_, SyncLogRow>(&query)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
            .map(SyncLog::from))
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
