//! Account synchronization.
//!
//! One cycle per account: guard, check the connection, open a sync log,
//! fetch from the provider, upsert transactions and balance atomically, then
//! close the log. Failures end up in the log and the returned [`SyncReport`].

use super::connections::ConnectionManager;
use super::metrics::{BankingEvent, EventSink};
use super::store::SyncBatchOutcome;
use crate::error::{BankingError, PermanentKind, ProviderError, Result};
use crate::models::{
    AccountStatus, BankingAccount, BankingConnection, BankingSyncStatus, ConnectionStatus, SyncLog,
    SyncLogClose,
};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    /// Window start when an account has never synced.
    pub lookback_days: i64,
    /// Days re-fetched before the last successful sync.
    pub overlap_days: i64,
    /// Upper bound on one provider round trip.
    pub call_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            lookback_days: 90,
            overlap_days: 1,
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// Outcome of one account sync.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub account_id: Uuid,
    pub connection_id: Option<Uuid>,
    /// Absent when the sync was refused before a log was opened.
    pub sync_log_id: Option<Uuid>,
    pub status: BankingSyncStatus,
    pub inserted: i32,
    pub updated: i32,
    pub balance_updated: bool,
    pub error_code: Option<String>,
    pub error: Option<String>,
    pub retryable: bool,
    pub duration: Duration,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.status == BankingSyncStatus::Synced
    }

    fn refused(account_id: Uuid, connection_id: Option<Uuid>, error: &BankingError) -> Self {
        Self {
            account_id,
            connection_id,
            sync_log_id: None,
            status: BankingSyncStatus::Error,
            inserted: 0,
            updated: 0,
            balance_updated: false,
            error_code: Some(error.code().to_string()),
            error: Some(error.sanitized_message()),
            retryable: error.is_retryable(),
            duration: Duration::ZERO,
        }
    }
}

/// Removes the account from the in-flight set when dropped.
struct InFlightGuard {
    in_flight: Arc<DashMap<Uuid, ()>>,
    account_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.account_id);
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    manager: ConnectionManager,
    in_flight: Arc<DashMap<Uuid, ()>>,
    settings: SyncSettings,
    events: Arc<dyn EventSink>,
}

impl SyncEngine {
    pub fn new(manager: ConnectionManager, settings: SyncSettings) -> Self {
        let events = Arc::clone(manager.events());
        Self {
            manager,
            in_flight: Arc::new(DashMap::new()),
            settings,
            events,
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn settings(&self) -> SyncSettings {
        self.settings
    }

    pub fn is_syncing(&self, account_id: Uuid) -> bool {
        self.in_flight.contains_key(&account_id)
    }

    fn acquire(&self, account_id: Uuid) -> Option<InFlightGuard> {
        match self.in_flight.entry(account_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(InFlightGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    account_id,
                })
            }
        }
    }

    /// Sync one account.
    ///
    /// Refusals (already running, unknown account, connection not
    /// `AUTHORIZED`) are errors and leave no sync log. Anything that fails
    /// after the log is opened is reported through the `SyncReport`.
    #[instrument(skip(self))]
    pub async fn sync_account(&self, account_id: Uuid) -> Result<SyncReport> {
        let _guard = match self.acquire(account_id) {
            Some(guard) => guard,
            None => {
                self.events.record(&BankingEvent::SyncRejected {
                    account_id,
                    reason: "in_progress",
                });
                return Err(BankingError::SyncInProgress(account_id));
            }
        };

        let account = self
            .manager
            .store()
            .get_account(account_id)
            .await?
            .ok_or_else(|| BankingError::NotFound(format!("Account {}", account_id)))?;
        if account.status == AccountStatus::Closed {
            self.events.record(&BankingEvent::SyncRejected {
                account_id,
                reason: "account_closed",
            });
            return Err(BankingError::Conflict(format!("account {} is closed", account_id)));
        }

        let connection = self.manager.get_connection(account.connection_id).await?;
        if connection.status != ConnectionStatus::Authorized {
            self.events.record(&BankingEvent::SyncRejected {
                account_id,
                reason: "connection_not_active",
            });
            return Err(BankingError::ConnectionNotActive(connection.status));
        }

        let started = Instant::now();
        let log = SyncLog::open(connection.id, account.id);
        self.manager.store().open_sync_log(&log).await?;

        let result = self.run_cycle(&connection, &account).await;
        let duration = started.elapsed();

        let report = match result {
            Ok(outcome) => {
                self.manager
                    .store()
                    .close_sync_log(
                        log.id,
                        &SyncLogClose::synced(outcome.inserted, outcome.updated, outcome.balance_updated),
                    )
                    .await?;
                info!(
                    inserted = outcome.inserted,
                    updated = outcome.updated,
                    unchanged = outcome.unchanged,
                    balance_updated = outcome.balance_updated,
                    "Account synced"
                );
                SyncReport {
                    account_id,
                    connection_id: Some(connection.id),
                    sync_log_id: Some(log.id),
                    status: BankingSyncStatus::Synced,
                    inserted: outcome.inserted,
                    updated: outcome.updated,
                    balance_updated: outcome.balance_updated,
                    error_code: None,
                    error: None,
                    retryable: false,
                    duration,
                }
            }
            Err(error) => {
                let message = error.sanitized_message();
                if let Err(close_error) = self
                    .manager
                    .store()
                    .close_sync_log(log.id, &SyncLogClose::failed(error.code(), message.clone()))
                    .await
                {
                    error!(sync_log_id = %log.id, error = %close_error, "Failed to close sync log");
                }
                warn!(code = error.code(), "Account sync failed");
                self.apply_failure_consequences(&connection, &account, &error)
                    .await;
                SyncReport {
                    account_id,
                    connection_id: Some(connection.id),
                    sync_log_id: Some(log.id),
                    status: BankingSyncStatus::Error,
                    inserted: 0,
                    updated: 0,
                    balance_updated: false,
                    error_code: Some(error.code().to_string()),
                    error: Some(message),
                    retryable: error.is_retryable(),
                    duration,
                }
            }
        };

        self.events.record(&BankingEvent::SyncCompleted {
            account_id,
            provider: connection.provider,
            status: report.status,
            duration,
            inserted: report.inserted,
            updated: report.updated,
        });
        Ok(report)
    }

    /// Sync every open account of a connection; one failure does not stop the rest.
    #[instrument(skip(self))]
    pub async fn sync_connection(&self, connection_id: Uuid) -> Result<Vec<SyncReport>> {
        let accounts = self.manager.list_accounts(connection_id).await?;
        let mut reports = Vec::with_capacity(accounts.len());

        for account in accounts
            .into_iter()
            .filter(|a| a.status != AccountStatus::Closed)
        {
            match self.sync_account(account.id).await {
                Ok(report) => reports.push(report),
                Err(e) => reports.push(SyncReport::refused(account.id, Some(connection_id), &e)),
            }
        }

        Ok(reports)
    }

    /// First day of the fetch window for an account.
    pub async fn window_start(&self, account_id: Uuid) -> Result<NaiveDate> {
        let start = match self.manager.store().last_successful_sync(account_id).await? {
            Some(last) => last.started_at - ChronoDuration::days(self.settings.overlap_days),
            None => Utc::now() - ChronoDuration::days(self.settings.lookback_days),
        };
        Ok(start.date_naive())
    }

    async fn run_cycle(
        &self,
        connection: &BankingConnection,
        account: &BankingAccount,
    ) -> Result<SyncBatchOutcome> {
        let from = self.window_start(account.id).await?;
        let adapter = self.manager.providers().get(connection.provider)?;
        let handle = self.manager.connection_handle(connection).await?;

        let snapshot = match tokio::time::timeout(
            self.settings.call_timeout,
            adapter.sync_account(&handle, &account.external_account_id, from),
        )
        .await
        {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => return Err(BankingError::Provider(e)),
            Err(_) => {
                return Err(BankingError::Provider(ProviderError::Transient(
                    "provider call timed out".to_string(),
                )))
            }
        };

        self.manager
            .store()
            .apply_sync_batch(account.id, &snapshot.transactions, snapshot.balance)
            .await
    }

    async fn apply_failure_consequences(
        &self,
        connection: &BankingConnection,
        account: &BankingAccount,
        error: &BankingError,
    ) {
        let BankingError::Provider(provider_error) = error else {
            return;
        };
        self.events.record(&BankingEvent::ProviderFailure {
            provider: connection.provider,
            operation: "sync_account",
            code: provider_error.code(),
        });

        let outcome = match provider_error.permanent_kind() {
            Some(PermanentKind::Unauthorized) => self
                .manager
                .mark_expired(connection.id, "provider rejected the connection credentials")
                .await
                .map(|_| ()),
            Some(PermanentKind::Revoked) => self
                .manager
                .mark_revoked(connection.id, "provider reported the connection as revoked")
                .await
                .map(|_| ()),
            Some(PermanentKind::NotFound) => {
                self.manager
                    .store()
                    .update_account_status(account.id, AccountStatus::Closed)
                    .await
            }
            _ => Ok(()),
        };

        if let Err(e) = outcome {
            warn!(code = e.code(), "Could not apply sync failure to connection state");
        }
    }
}
