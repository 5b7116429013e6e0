//! Common test utilities for banking-service integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use banking_service::error::{BankingError, Result};
use banking_service::models::{
    AccountStatus, BankingAccount, BankingConnection, BankingTransactionRecord, ConnectionStatus,
    NewBankingAccount, ProviderKind, SyncLog, SyncLogClose,
};
use banking_service::providers::{BankingTransactionData, MockBankingProvider, ProviderRegistry};
use banking_service::security::{AesGcmCipher, LinkStateSigner};
use banking_service::services::{
    BankingStore, CallbackParams, ConnectionManager, EventSink, InMemoryBankingStore, LinkCompletion,
    LinkStart, OAuthCallbackHandler, RecordingEventSink, StatusUpdate, SyncBatchOutcome, SyncEngine,
    SyncSettings,
};
use rust_decimal::Decimal;
use chrono::Utc;
use secrecy::SecretString;
use std::sync::{Arc, Once};
use std::time::Duration;
use uuid::Uuid;

static INIT: Once = Once::new();

pub const REDIRECT_URI: &str = "https://api.example.com/banking/callback";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,banking_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn test_cipher() -> AesGcmCipher {
    AesGcmCipher::new(&[7u8; 32])
}

pub fn test_signer() -> LinkStateSigner {
    LinkStateSigner::new(
        SecretString::new("test-state-secret".to_string()),
        Duration::from_secs(600),
    )
}

/// In-memory store, scripted provider and recording sink wired together.
pub struct TestHarness {
    pub store: Arc<InMemoryBankingStore>,
    pub provider: Arc<MockBankingProvider>,
    pub events: Arc<RecordingEventSink>,
    pub manager: ConnectionManager,
    pub callback: OAuthCallbackHandler,
    pub engine: SyncEngine,
    pub user_id: Uuid,
}

impl TestHarness {
    pub fn new(provider: MockBankingProvider) -> Self {
        Self::with_settings(provider, SyncSettings::default())
    }

    pub fn with_settings(provider: MockBankingProvider, settings: SyncSettings) -> Self {
        Self::build(provider, settings, |store| store)
    }

    /// Sync log closes fail; everything else goes to the in-memory store.
    pub fn with_failing_log_close(provider: MockBankingProvider) -> Self {
        Self::build(provider, SyncSettings::default(), |store| {
            Arc::new(FailingLogCloseStore { inner: store })
        })
    }

    fn build(
        provider: MockBankingProvider,
        settings: SyncSettings,
        wrap: impl FnOnce(Arc<InMemoryBankingStore>) -> Arc<dyn BankingStore>,
    ) -> Self {
        init_tracing();

        let store = Arc::new(InMemoryBankingStore::new());
        let provider = Arc::new(provider);
        let events = Arc::new(RecordingEventSink::new());

        let mut registry = ProviderRegistry::new();
        registry.register(provider.clone());

        let store_dyn = wrap(store.clone());
        let events_dyn: Arc<dyn EventSink> = events.clone();
        let manager = ConnectionManager::new(
            store_dyn,
            Arc::new(registry),
            Arc::new(test_cipher()),
            test_signer(),
            REDIRECT_URI,
            events_dyn,
        );

        Self {
            callback: OAuthCallbackHandler::new(manager.clone()),
            engine: SyncEngine::new(manager.clone(), settings),
            manager,
            store,
            provider,
            events,
            user_id: Uuid::new_v4(),
        }
    }

    pub async fn start_link(&self) -> LinkStart {
        self.manager
            .start_link(self.user_id, ProviderKind::SaltEdge)
            .await
            .expect("start_link failed")
    }

    /// Run the whole flow: start, provider redirect, callback.
    pub async fn link(&self, external_connection_id: &str) -> BankingConnection {
        let start = self.start_link().await;
        let params = callback_params(&start, Some(external_connection_id), None);
        self.callback
            .handle(params, Utc::now())
            .await
            .expect("callback failed")
    }

    pub async fn accounts(&self, connection_id: Uuid) -> Vec<BankingAccount> {
        self.manager
            .list_accounts(connection_id)
            .await
            .expect("list_accounts failed")
    }

    pub async fn only_account(&self, connection_id: Uuid) -> BankingAccount {
        let mut accounts = self.accounts(connection_id).await;
        assert_eq!(accounts.len(), 1, "expected exactly one account");
        accounts.remove(0)
    }
}

/// The state token the provider would echo back, recovered from the redirect URL.
pub fn state_from_redirect(redirect_url: &str) -> String {
    let return_to = query_value(redirect_url, "return_to").expect("redirect has no return_to");
    query_value(&return_to, "state").expect("return_to has no state")
}

fn query_value(url: &str, key: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == key {
            urlencoding::decode(v).ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

pub fn callback_params(start: &LinkStart, external_id: Option<&str>, error: Option<&str>) -> CallbackParams {
    CallbackParams {
        connection_id: Some(start.connection_id.to_string()),
        state: Some(state_from_redirect(&start.redirect_url)),
        external_connection_id: external_id.map(str::to_string),
        error: error.map(str::to_string),
    }
}

/// Delegates to the in-memory store but refuses to close sync logs.
pub struct FailingLogCloseStore {
    inner: Arc<InMemoryBankingStore>,
}

#[async_trait]
impl BankingStore for FailingLogCloseStore {
    async fn insert_pending_connection(&self, connection: &BankingConnection) -> Result<()> {
        self.inner.insert_pending_connection(connection).await
    }

    async fn get_connection(&self, id: Uuid) -> Result<Option<BankingConnection>> {
        self.inner.get_connection(id).await
    }

    async fn list_connections_for_user(&self, user_id: Uuid) -> Result<Vec<BankingConnection>> {
        self.inner.list_connections_for_user(user_id).await
    }

    async fn list_connections_by_status(&self, status: ConnectionStatus) -> Result<Vec<BankingConnection>> {
        self.inner.list_connections_by_status(status).await
    }

    async fn complete_link(
        &self,
        id: Uuid,
        completion: &LinkCompletion,
        accounts: &[NewBankingAccount],
    ) -> Result<BankingConnection> {
        self.inner.complete_link(id, completion, accounts).await
    }

    async fn update_connection_status(
        &self,
        id: Uuid,
        expected: ConnectionStatus,
        update: &StatusUpdate,
    ) -> Result<BankingConnection> {
        self.inner.update_connection_status(id, expected, update).await
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<BankingAccount>> {
        self.inner.get_account(id).await
    }

    async fn list_accounts(&self, connection_id: Uuid) -> Result<Vec<BankingAccount>> {
        self.inner.list_accounts(connection_id).await
    }

    async fn update_account_status(&self, id: Uuid, status: AccountStatus) -> Result<()> {
        self.inner.update_account_status(id, status).await
    }

    async fn apply_sync_batch(
        &self,
        account_id: Uuid,
        transactions: &[BankingTransactionData],
        balance: Decimal,
    ) -> Result<SyncBatchOutcome> {
        self.inner.apply_sync_batch(account_id, transactions, balance).await
    }

    async fn list_transactions(&self, account_id: Uuid) -> Result<Vec<BankingTransactionRecord>> {
        self.inner.list_transactions(account_id).await
    }

    async fn open_sync_log(&self, log: &SyncLog) -> Result<()> {
        self.inner.open_sync_log(log).await
    }

    async fn close_sync_log(&self, _id: Uuid, _close: &SyncLogClose) -> Result<SyncLog> {
        Err(BankingError::Conflict("sync log store unavailable".to_string()))
    }

    async fn list_sync_logs(&self, account_id: Uuid) -> Result<Vec<SyncLog>> {
        self.inner.list_sync_logs(account_id).await
    }

    async fn last_successful_sync(&self, account_id: Uuid) -> Result<Option<SyncLog>> {
        self.inner.last_successful_sync(account_id).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}
