//! Scripted in-process provider for tests and local development.

use super::{
    AccountSnapshot, BankingAccountData, BankingProvider, BankingTransactionData, CompletedLink,
    ConnectionHandle, ConnectionState, LinkRequest, LinkSession, ProviderConnectionStatus,
};
use crate::error::ProviderError;
use crate::models::{AccountStatus, ProviderKind, TransactionStatus};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use rust_decimal::Decimal;
use secrecy::Secret;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Adapter calls that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Authenticate,
    InitiateLink,
    CompleteLink,
    GetAccounts,
    GetTransactions,
    GetBalance,
    ConnectionStatus,
    Refresh,
    Revoke,
}

#[derive(Default)]
struct MockState {
    accounts: Vec<BankingAccountData>,
    transactions: HashMap<String, Vec<BankingTransactionData>>,
    balances: HashMap<String, Decimal>,
    link_status: Option<ProviderConnectionStatus>,
    connection_status: Option<ProviderConnectionStatus>,
    failures: HashMap<MockOperation, VecDeque<ProviderError>>,
    calls: HashMap<MockOperation, usize>,
    revoked: Vec<String>,
    transaction_windows: Vec<(NaiveDate, NaiveDate)>,
}

/// Deterministic [`BankingProvider`] with injectable failures.
pub struct MockBankingProvider {
    kind: ProviderKind,
    base_url: String,
    latency: Option<Duration>,
    state: Mutex<MockState>,
}

impl Default for MockBankingProvider {
    fn default() -> Self {
        Self::new(ProviderKind::SaltEdge)
    }
}

impl MockBankingProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            base_url: "https://mock-bank.local".to_string(),
            latency: None,
            state: Mutex::new(MockState::default()),
        }
    }

    /// A provider preloaded with one account and a few transactions.
    pub fn demo(kind: ProviderKind) -> Self {
        let today = Utc::now().date_naive();
        let provider = Self::new(kind).with_accounts(vec![Self::account("acc-1", Decimal::new(125000, 2))]);
        provider.set_transactions(
            "acc-1",
            vec![
                Self::transaction("tx-1", today - ChronoDuration::days(3), Decimal::new(-4250, 2)),
                Self::transaction("tx-2", today - ChronoDuration::days(2), Decimal::new(250000, 2)),
                Self::transaction("tx-3", today - ChronoDuration::days(1), Decimal::new(-1999, 2)),
            ],
        );
        provider
    }

    /// Simulated network latency applied to every sync call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_accounts(self, accounts: Vec<BankingAccountData>) -> Self {
        {
            let mut state = self.lock();
            for account in &accounts {
                state
                    .balances
                    .insert(account.external_account_id.clone(), account.balance);
            }
            state.accounts = accounts;
        }
        self
    }

    pub fn set_transactions(&self, external_account_id: &str, transactions: Vec<BankingTransactionData>) {
        self.lock()
            .transactions
            .insert(external_account_id.to_string(), transactions);
    }

    pub fn set_balance(&self, external_account_id: &str, balance: Decimal) {
        self.lock()
            .balances
            .insert(external_account_id.to_string(), balance);
    }

    /// Status reported by `complete_link_and_get_accounts`.
    pub fn set_link_status(&self, status: ProviderConnectionStatus) {
        self.lock().link_status = Some(status);
    }

    /// Status reported by `get_connection_status` and `refresh_connection`.
    pub fn set_connection_status(&self, status: ProviderConnectionStatus) {
        self.lock().connection_status = Some(status);
    }

    /// Queue an error for the next call to `operation`.
    pub fn fail_next(&self, operation: MockOperation, error: ProviderError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn calls(&self, operation: MockOperation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn revoked_connections(&self) -> Vec<String> {
        self.lock().revoked.clone()
    }

    /// Date windows requested through `get_transactions`, oldest first.
    pub fn transaction_windows(&self) -> Vec<(NaiveDate, NaiveDate)> {
        self.lock().transaction_windows.clone()
    }

    pub fn account(external_id: &str, balance: Decimal) -> BankingAccountData {
        BankingAccountData {
            external_account_id: external_id.to_string(),
            iban: Some(format!("DE89370400440532013{:03}", external_id.len())),
            account_number: None,
            name: Some(format!("Account {}", external_id)),
            currency: "EUR".to_string(),
            balance,
            account_type: Some("checking".to_string()),
            bank_name: Some("Mock Bank".to_string()),
            bank_country: Some("DE".to_string()),
            account_holder_name: Some("Jane Doe".to_string()),
            status: AccountStatus::Active,
        }
    }

    pub fn transaction(external_id: &str, date: NaiveDate, amount: Decimal) -> BankingTransactionData {
        BankingTransactionData {
            external_transaction_id: external_id.to_string(),
            date,
            amount,
            currency: "EUR".to_string(),
            description: Some(format!("Mock transaction {}", external_id)),
            merchant: None,
            status: TransactionStatus::Completed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, operation: MockOperation) -> Result<(), ProviderError> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_insert(0) += 1;
        match state.failures.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState {
            status: self
                .lock()
                .connection_status
                .unwrap_or(ProviderConnectionStatus::Active),
            expires_at: Some(Utc::now() + ChronoDuration::days(90)),
        }
    }
}

#[async_trait]
impl BankingProvider for MockBankingProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn authenticate(&self) -> Result<(), ProviderError> {
        self.enter(MockOperation::Authenticate)
    }

    async fn initiate_link(&self, request: &LinkRequest) -> Result<LinkSession, ProviderError> {
        self.enter(MockOperation::InitiateLink)?;
        Ok(LinkSession {
            redirect_url: format!(
                "{}/connect?session={}&return_to={}",
                self.base_url,
                request.connection_id,
                urlencoding::encode(&request.return_to)
            ),
            provider_reference: Some(format!("mock-session-{}", request.connection_id)),
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
        })
    }

    async fn complete_link_and_get_accounts(
        &self,
        external_connection_id: &str,
    ) -> Result<CompletedLink, ProviderError> {
        self.enter(MockOperation::CompleteLink)?;
        let state = self.lock();
        Ok(CompletedLink {
            status: state.link_status.unwrap_or(ProviderConnectionStatus::Active),
            secret: Secret::new(format!("mock-secret-{}", external_connection_id)),
            expires_at: Some(Utc::now() + ChronoDuration::days(90)),
            accounts: state.accounts.clone(),
        })
    }

    async fn get_accounts(
        &self,
        _handle: &ConnectionHandle,
    ) -> Result<Vec<BankingAccountData>, ProviderError> {
        self.enter(MockOperation::GetAccounts)?;
        Ok(self.lock().accounts.clone())
    }

    async fn get_transactions(
        &self,
        _handle: &ConnectionHandle,
        external_account_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<BankingTransactionData>, ProviderError> {
        self.simulate_latency().await;
        self.enter(MockOperation::GetTransactions)?;
        let mut state = self.lock();
        state.transaction_windows.push((from, to));
        let transactions = state
            .transactions
            .get(external_account_id)
            .map(|txs| {
                txs.iter()
                    .filter(|tx| tx.date >= from && tx.date <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(transactions)
    }

    async fn get_balance(
        &self,
        _handle: &ConnectionHandle,
        external_account_id: &str,
    ) -> Result<Decimal, ProviderError> {
        self.enter(MockOperation::GetBalance)?;
        self.lock()
            .balances
            .get(external_account_id)
            .copied()
            .ok_or_else(|| {
                ProviderError::permanent(crate::error::PermanentKind::NotFound, "AccountNotFound (404)")
            })
    }

    async fn get_connection_status(
        &self,
        _handle: &ConnectionHandle,
    ) -> Result<ConnectionState, ProviderError> {
        self.enter(MockOperation::ConnectionStatus)?;
        Ok(self.connection_state())
    }

    async fn refresh_connection(
        &self,
        _handle: &ConnectionHandle,
    ) -> Result<ConnectionState, ProviderError> {
        self.enter(MockOperation::Refresh)?;
        Ok(self.connection_state())
    }

    async fn revoke_connection(&self, handle: &ConnectionHandle) -> Result<(), ProviderError> {
        self.enter(MockOperation::Revoke)?;
        self.lock()
            .revoked
            .push(handle.external_connection_id.clone());
        Ok(())
    }

    async fn sync_account(
        &self,
        handle: &ConnectionHandle,
        external_account_id: &str,
        from: NaiveDate,
    ) -> Result<AccountSnapshot, ProviderError> {
        let to = Utc::now().date_naive();
        let transactions = self
            .get_transactions(handle, external_account_id, from, to)
            .await?;
        let balance = self.get_balance(handle, external_account_id).await?;
        Ok(AccountSnapshot {
            transactions,
            balance,
        })
    }
}
