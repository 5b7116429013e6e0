//! Account sync: idempotence, single-flight, windows and failure handling.

mod common;

use banking_service::error::{BankingError, PermanentKind, ProviderError};
use banking_service::models::{
    AccountStatus, BankingSyncStatus, ConnectionStatus, ProviderKind, TransactionDirection,
    TransactionStatus,
};
use banking_service::providers::mock::MockOperation;
use banking_service::providers::MockBankingProvider;
use banking_service::services::{BankingEvent, BankingStore, SyncSettings};
use chrono::{Duration as ChronoDuration, Utc};
use common::TestHarness;
use rust_decimal::Decimal;
use std::time::Duration;

fn provider() -> MockBankingProvider {
    let today = Utc::now().date_naive();
    let provider = MockBankingProvider::new(ProviderKind::SaltEdge)
        .with_accounts(vec![MockBankingProvider::account("acc-1", Decimal::new(100, 0))]);
    provider.set_transactions(
        "acc-1",
        vec![MockBankingProvider::transaction("tx-1", today, Decimal::new(-10, 0))],
    );
    provider
}

#[tokio::test]
async fn test_link_then_sync_end_to_end() {
    let harness = TestHarness::new(provider());
    let connection = harness.link("ext-1").await;
    let account = harness.only_account(connection.id).await;
    assert_eq!(account.balance, Decimal::new(100, 0));

    let report = harness.engine.sync_account(account.id).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.inserted, 1);
    assert_eq!(report.updated, 0);
    assert!(!report.balance_updated);

    let transactions = harness.store.list_transactions(account.id).await.unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].external_transaction_id, "tx-1");
    assert_eq!(transactions[0].amount, Decimal::new(10, 0));
    assert_eq!(transactions[0].direction, TransactionDirection::Debit);

    let account = harness.only_account(connection.id).await;
    assert_eq!(account.balance, Decimal::new(100, 0));

    let again = harness.engine.sync_account(account.id).await.unwrap();
    assert!(again.is_success());
    assert_eq!((again.inserted, again.updated), (0, 0));
    assert_eq!(harness.store.transaction_count().await, 1);
}

#[tokio::test]
async fn test_resync_with_identical_data_keeps_row_count() {
    let harness = TestHarness::new(provider());
    let connection = harness.link("ext-1").await;
    let account = harness.only_account(connection.id).await;

    harness.engine.sync_account(account.id).await.unwrap();
    let after_first = harness.store.transaction_count().await;
    harness.engine.sync_account(account.id).await.unwrap();

    assert_eq!(harness.store.transaction_count().await, after_first);
    assert_eq!(harness.store.sync_log_count().await, 2);
}

#[tokio::test]
async fn test_changed_transaction_and_balance_are_updated() {
    let harness = TestHarness::new(provider());
    let connection = harness.link("ext-1").await;
    let account = harness.only_account(connection.id).await;
    harness.engine.sync_account(account.id).await.unwrap();

    let today = Utc::now().date_naive();
    let mut settled = MockBankingProvider::transaction("tx-1", today, Decimal::new(-12, 0));
    settled.status = TransactionStatus::Pending;
    settled.description = Some("Coffee".to_string());
    harness.provider.set_transactions("acc-1", vec![settled]);
    harness.provider.set_balance("acc-1", Decimal::new(88, 0));

    let report = harness.engine.sync_account(account.id).await.unwrap();

    assert_eq!((report.inserted, report.updated), (0, 1));
    assert!(report.balance_updated);
    let account = harness.only_account(connection.id).await;
    assert_eq!(account.balance, Decimal::new(88, 0));
    assert!(account.balance_updated_at.is_some());
    let transactions = harness.store.list_transactions(account.id).await.unwrap();
    assert_eq!(transactions[0].amount, Decimal::new(12, 0));
    assert_eq!(transactions[0].status, TransactionStatus::Pending);
    assert_eq!(
        transactions[0].description.as_deref(),
        Some("Mock transaction tx-1")
    );
}

#[tokio::test]
async fn test_descriptive_changes_do_not_rewrite_stored_transaction() {
    let harness = TestHarness::new(provider());
    let connection = harness.link("ext-1").await;
    let account = harness.only_account(connection.id).await;
    harness.engine.sync_account(account.id).await.unwrap();
    let before = harness.store.list_transactions(account.id).await.unwrap();

    let today = Utc::now().date_naive();
    let mut renamed =
        MockBankingProvider::transaction("tx-1", today - ChronoDuration::days(1), Decimal::new(-10, 0));
    renamed.description = Some("REWRITTEN".to_string());
    renamed.merchant = Some("Other".to_string());
    harness.provider.set_transactions("acc-1", vec![renamed]);

    let report = harness.engine.sync_account(account.id).await.unwrap();

    assert_eq!((report.inserted, report.updated), (0, 0));
    let after = harness.store.list_transactions(account.id).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].description, before[0].description);
    assert_eq!(after[0].merchant, None);
    assert_eq!(after[0].date, today);
    assert_eq!(after[0].updated_at, before[0].updated_at);
}

#[tokio::test]
async fn test_concurrent_syncs_are_single_flight() {
    let harness = TestHarness::new(provider().with_latency(Duration::from_millis(100)));
    let connection = harness.link("ext-1").await;
    let account = harness.only_account(connection.id).await;

    let (a, b) = tokio::join!(
        harness.engine.sync_account(account.id),
        harness.engine.sync_account(account.id)
    );

    let (ok, rejected) = match (a, b) {
        (Ok(report), Err(e)) | (Err(e), Ok(report)) => (report, e),
        other => panic!("expected one success and one rejection, got {:?}", other),
    };
    assert_eq!(ok.status, BankingSyncStatus::Synced);
    assert!(matches!(rejected, BankingError::SyncInProgress(id) if id == account.id));
    assert_eq!(harness.store.sync_log_count().await, 1);
    assert!(!harness.engine.is_syncing(account.id));

    assert!(harness.events.events().iter().any(|e| matches!(
        e,
        BankingEvent::SyncRejected { reason: "in_progress", .. }
    )));
}

#[tokio::test]
async fn test_fetch_window_uses_lookback_then_overlap() {
    let harness = TestHarness::new(provider());
    let connection = harness.link("ext-1").await;
    let account = harness.only_account(connection.id).await;

    let expected_first = (Utc::now() - ChronoDuration::days(90)).date_naive();
    harness.engine.sync_account(account.id).await.unwrap();
    let last = harness
        .store
        .last_successful_sync(account.id)
        .await
        .unwrap()
        .unwrap();
    harness.engine.sync_account(account.id).await.unwrap();

    let windows = harness.provider.transaction_windows();
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0].0, expected_first);
    assert_eq!(windows[1].0, (last.started_at - ChronoDuration::days(1)).date_naive());
}

#[tokio::test]
async fn test_sync_refused_unless_authorized() {
    let harness = TestHarness::new(provider());
    let connection = harness.link("ext-1").await;
    let account = harness.only_account(connection.id).await;
    harness
        .manager
        .revoke(connection.id, harness.user_id)
        .await
        .unwrap();

    let result = harness.engine.sync_account(account.id).await;

    assert!(matches!(
        result,
        Err(BankingError::ConnectionNotActive(ConnectionStatus::Revoked))
    ));
    assert_eq!(harness.store.sync_log_count().await, 0);
}

#[tokio::test]
async fn test_transient_failure_is_reported_and_logged() {
    let harness = TestHarness::new(provider());
    let connection = harness.link("ext-1").await;
    let account = harness.only_account(connection.id).await;
    harness.provider.fail_next(
        MockOperation::GetTransactions,
        ProviderError::Transient("503 Service Unavailable".to_string()),
    );

    let report = harness.engine.sync_account(account.id).await.unwrap();

    assert_eq!(report.status, BankingSyncStatus::Error);
    assert_eq!(report.error_code.as_deref(), Some("PROVIDER_TRANSIENT"));
    assert!(report.retryable);

    let logs = harness.store.list_sync_logs(account.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, BankingSyncStatus::Error);
    assert_eq!(logs[0].error_code.as_deref(), Some("PROVIDER_TRANSIENT"));
    assert!(logs[0].completed_at.is_some());
    assert_eq!(
        harness.manager.get_connection(connection.id).await.unwrap().status,
        ConnectionStatus::Authorized
    );
}

#[tokio::test]
async fn test_failure_report_survives_sync_log_close_error() {
    let harness = TestHarness::with_failing_log_close(provider());
    let connection = harness.link("ext-1").await;
    let account = harness.only_account(connection.id).await;
    harness.provider.fail_next(
        MockOperation::GetTransactions,
        ProviderError::permanent(PermanentKind::Revoked, "ConnectionDisabled (406)"),
    );

    let report = harness.engine.sync_account(account.id).await.unwrap();

    assert_eq!(report.status, BankingSyncStatus::Error);
    assert_eq!(report.error_code.as_deref(), Some("PROVIDER_REVOKED"));
    assert_eq!(
        harness.manager.get_connection(connection.id).await.unwrap().status,
        ConnectionStatus::Revoked
    );
    assert!(!harness.engine.is_syncing(account.id));
}

#[tokio::test]
async fn test_slow_provider_times_out_as_transient() {
    let settings = SyncSettings {
        call_timeout: Duration::from_millis(20),
        ..SyncSettings::default()
    };
    let harness = TestHarness::with_settings(provider().with_latency(Duration::from_millis(500)), settings);
    let connection = harness.link("ext-1").await;
    let account = harness.only_account(connection.id).await;

    let report = harness.engine.sync_account(account.id).await.unwrap();

    assert_eq!(report.status, BankingSyncStatus::Error);
    assert!(report.retryable);
    assert_eq!(harness.store.transaction_count().await, 0);
}

#[tokio::test]
async fn test_unauthorized_provider_error_expires_connection() {
    let harness = TestHarness::new(provider());
    let connection = harness.link("ext-1").await;
    let account = harness.only_account(connection.id).await;
    harness.provider.fail_next(
        MockOperation::GetTransactions,
        ProviderError::permanent(PermanentKind::Unauthorized, "ConsentExpired (401)"),
    );

    let report = harness.engine.sync_account(account.id).await.unwrap();

    assert!(!report.retryable);
    assert_eq!(
        harness.manager.get_connection(connection.id).await.unwrap().status,
        ConnectionStatus::Expired
    );
    assert!(matches!(
        harness.engine.sync_account(account.id).await,
        Err(BankingError::ConnectionNotActive(ConnectionStatus::Expired))
    ));
    assert_eq!(harness.store.sync_log_count().await, 1);
}

#[tokio::test]
async fn test_revoked_provider_error_revokes_connection() {
    let harness = TestHarness::new(provider());
    let connection = harness.link("ext-1").await;
    let account = harness.only_account(connection.id).await;
    harness.provider.fail_next(
        MockOperation::GetTransactions,
        ProviderError::permanent(PermanentKind::Revoked, "ConnectionDisabled (406)"),
    );

    harness.engine.sync_account(account.id).await.unwrap();

    assert_eq!(
        harness.manager.get_connection(connection.id).await.unwrap().status,
        ConnectionStatus::Revoked
    );
}

#[tokio::test]
async fn test_missing_account_is_closed_and_skipped() {
    let harness = TestHarness::new(provider());
    let connection = harness.link("ext-1").await;
    let account = harness.only_account(connection.id).await;
    harness.provider.fail_next(
        MockOperation::GetTransactions,
        ProviderError::permanent(PermanentKind::NotFound, "AccountNotFound (404)"),
    );

    harness.engine.sync_account(account.id).await.unwrap();

    let account = harness.only_account(connection.id).await;
    assert_eq!(account.status, AccountStatus::Closed);
    assert!(harness
        .engine
        .sync_connection(connection.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_sync_connection_reports_every_account() {
    let today = Utc::now().date_naive();
    let provider = MockBankingProvider::new(ProviderKind::SaltEdge).with_accounts(vec![
        MockBankingProvider::account("acc-1", Decimal::new(100, 0)),
        MockBankingProvider::account("acc-2", Decimal::new(5, 0)),
    ]);
    provider.set_transactions(
        "acc-1",
        vec![MockBankingProvider::transaction("tx-1", today, Decimal::new(-10, 0))],
    );
    provider.set_transactions(
        "acc-2",
        vec![
            MockBankingProvider::transaction("tx-a", today, Decimal::new(40, 0)),
            MockBankingProvider::transaction("tx-b", today, Decimal::new(-3, 0)),
        ],
    );
    provider.fail_next(
        MockOperation::GetTransactions,
        ProviderError::Transient("timeout".to_string()),
    );
    let harness = TestHarness::new(provider);
    let connection = harness.link("ext-1").await;

    let reports = harness.engine.sync_connection(connection.id).await.unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(reports.iter().filter(|r| r.is_success()).count(), 1);
    assert_eq!(
        reports
            .iter()
            .filter(|r| r.status == BankingSyncStatus::Error)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_sync_events_are_recorded() {
    let harness = TestHarness::new(provider());
    let connection = harness.link("ext-1").await;
    let account = harness.only_account(connection.id).await;

    harness.engine.sync_account(account.id).await.unwrap();

    assert!(harness.events.events().iter().any(|e| matches!(
        e,
        BankingEvent::SyncCompleted {
            status: BankingSyncStatus::Synced,
            inserted: 1,
            ..
        }
    )));
}
