use crate::error::{BankingError, ProviderError};
use crate::models::{AccountStatus, ConnectionStatus};
use crate::services::{SyncEngine, SyncReport};
use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub workers: usize,
    pub max_retries: u32,
    /// First backoff delay between retries of one account.
    pub retry_initial_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600),
            workers: 4,
            max_retries: 3,
            retry_initial_interval: Duration::from_secs(2),
        }
    }
}

/// Counts for one scheduler pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub expired: usize,
    /// `IN_PROGRESS` connections the provider has since moved on.
    pub refreshed: usize,
    pub synced: usize,
    pub failed: usize,
    /// Accounts already syncing or whose connection changed state mid-pass.
    pub skipped: usize,
}

enum AccountOutcome {
    Synced,
    Failed,
    Skipped,
}

pub struct SyncScheduler {
    engine: SyncEngine,
    config: SchedulerConfig,
    shutdown_token: CancellationToken,
}

impl SyncScheduler {
    pub fn new(engine: SyncEngine, config: SchedulerConfig) -> Self {
        Self {
            engine,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self) {
        tracing::info!("Initiating sync scheduler shutdown");
        self.shutdown_token.cancel();
    }

    /// Tick until cancelled. Returns immediately when disabled.
    pub async fn run(self) {
        if !self.config.enabled {
            tracing::info!("Sync scheduler disabled by configuration");
            return;
        }

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            workers = self.config.workers,
            "Starting sync scheduler"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Sync scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let summary = self.run_once().await;
                    tracing::info!(
                        expired = summary.expired,
                        refreshed = summary.refreshed,
                        synced = summary.synced,
                        failed = summary.failed,
                        skipped = summary.skipped,
                        "Sync pass finished"
                    );
                }
            }
        }
    }

    /// One pass: expire overdue connections, refresh those still in progress,
    /// then sync every open account of every authorized connection.
    pub async fn run_once(&self) -> TickSummary {
        let manager = self.engine.manager();
        let mut summary = TickSummary::default();

        match manager.expire_overdue(Utc::now()).await {
            Ok(count) => summary.expired = count,
            Err(e) => tracing::warn!(code = e.code(), "Expiry sweep failed"),
        }

        self.refresh_in_progress(&mut summary).await;

        let connections = match manager
            .store()
            .list_connections_by_status(ConnectionStatus::Authorized)
            .await
        {
            Ok(connections) => connections,
            Err(e) => {
                tracing::error!(code = e.code(), "Could not list authorized connections");
                return summary;
            }
        };

        let mut account_ids: Vec<Uuid> = Vec::new();
        for connection in connections {
            match manager.list_accounts(connection.id).await {
                Ok(accounts) => account_ids.extend(
                    accounts
                        .into_iter()
                        .filter(|a| a.status != AccountStatus::Closed)
                        .map(|a| a.id),
                ),
                Err(e) => tracing::warn!(
                    connection_id = %connection.id,
                    code = e.code(),
                    "Could not list accounts"
                ),
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();

        for account_id in account_ids {
            if self.shutdown_token.is_cancelled() {
                break;
            }
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let engine = self.engine.clone();
            let config = self.config.clone();
            tasks.spawn(async move {
                let outcome = sync_with_retry(&engine, &config, account_id).await;
                drop(permit);
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(AccountOutcome::Synced) => summary.synced += 1,
                Ok(AccountOutcome::Failed) => summary.failed += 1,
                Ok(AccountOutcome::Skipped) => summary.skipped += 1,
                Err(e) => {
                    tracing::error!(error = %e, "Sync task panicked");
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    async fn refresh_in_progress(&self, summary: &mut TickSummary) {
        let manager = self.engine.manager();
        let connections = match manager
            .store()
            .list_connections_by_status(ConnectionStatus::InProgress)
            .await
        {
            Ok(connections) => connections,
            Err(e) => {
                tracing::warn!(code = e.code(), "Could not list in-progress connections");
                return;
            }
        };

        for connection in connections {
            if self.shutdown_token.is_cancelled() {
                return;
            }
            match manager.refresh_status(connection.id).await {
                Ok(refreshed) if refreshed.status != ConnectionStatus::InProgress => {
                    tracing::info!(
                        connection_id = %connection.id,
                        status = %refreshed.status,
                        "In-progress connection refreshed"
                    );
                    summary.refreshed += 1;
                }
                Ok(_) => {}
                // Another writer moved it first.
                Err(BankingError::Conflict(_) | BankingError::ConnectionNotActive(_)) => {
                    summary.skipped += 1
                }
                Err(e) => {
                    tracing::warn!(
                        connection_id = %connection.id,
                        code = e.code(),
                        "Connection refresh failed"
                    );
                    summary.failed += 1;
                }
            }
        }
    }
}

/// Retry retryable failures with exponential backoff, at most `max_retries` times.
async fn sync_with_retry(
    engine: &SyncEngine,
    config: &SchedulerConfig,
    account_id: Uuid,
) -> AccountOutcome {
    let backoff = ExponentialBackoff {
        initial_interval: config.retry_initial_interval,
        current_interval: config.retry_initial_interval,
        max_elapsed_time: None,
        ..Default::default()
    };
    let attempts = AtomicU32::new(0);
    let attempts = &attempts;
    let max_retries = config.max_retries;

    let result: Result<SyncReport, BankingError> = retry(backoff, || async move {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        match engine.sync_account(account_id).await {
            Ok(report) if report.is_success() || !report.retryable || attempt >= max_retries => Ok(report),
            Ok(report) => {
                tracing::debug!(
                    account_id = %account_id,
                    attempt = attempt + 1,
                    code = report.error_code.as_deref().unwrap_or_default(),
                    "Retrying account sync"
                );
                Err(backoff::Error::transient(BankingError::Provider(
                    ProviderError::Transient(report.error.unwrap_or_default()),
                )))
            }
            Err(e) => Err(backoff::Error::permanent(e)),
        }
    })
    .await;

    match result {
        Ok(report) if report.is_success() => AccountOutcome::Synced,
        Ok(report) => {
            tracing::warn!(
                account_id = %account_id,
                code = report.error_code.as_deref().unwrap_or_default(),
                attempts = attempts.load(Ordering::SeqCst),
                "Account sync failed"
            );
            AccountOutcome::Failed
        }
        Err(
            BankingError::SyncInProgress(_)
            | BankingError::ConnectionNotActive(_)
            | BankingError::Conflict(_),
        ) => AccountOutcome::Skipped,
        Err(e) => {
            tracing::warn!(account_id = %account_id, code = e.code(), "Account sync refused");
            AccountOutcome::Failed
        }
    }
}
