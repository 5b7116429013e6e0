//! Open banking provider abstractions.
//!
//! Every aggregator is reached through [`BankingProvider`], which hides the
//! provider's OAuth flow and request-signing scheme behind one contract.

pub mod factory;
pub mod mock;
pub mod saltedge;

use crate::error::ProviderError;
use crate::models::{
    AccountStatus, ConnectionStatus, NewBankingAccount, ProviderKind, TransactionDirection,
    TransactionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use uuid::Uuid;

pub use factory::{build_provider, ProviderConfig, ProviderRegistry};
pub use mock::MockBankingProvider;
pub use saltedge::{SaltEdgeConfig, SaltEdgeProvider, SALTEDGE_API_URL};

/// Provider-side identity of an established connection.
///
/// The secret is decrypted only for the duration of a call.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub external_connection_id: String,
    pub secret: Option<SecretString>,
}

impl ConnectionHandle {
    pub fn new(external_connection_id: impl Into<String>, secret: Option<SecretString>) -> Self {
        Self {
            external_connection_id: external_connection_id.into(),
            secret,
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("external_connection_id", &self.external_connection_id)
            .finish_non_exhaustive()
    }
}

/// Input for starting the OAuth handshake.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub user_id: Uuid,
    pub connection_id: Uuid,
    /// Where the provider sends the browser back, state token included.
    pub return_to: String,
}

/// Result of starting the OAuth handshake.
#[derive(Debug, Clone)]
pub struct LinkSession {
    pub redirect_url: String,
    pub provider_reference: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Connection health as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderConnectionStatus {
    Active,
    /// Consent given, provider still fetching data.
    InProgress,
    /// Consent lapsed; the user must reauthorize.
    Expired,
    /// Disabled by the user or the bank.
    Revoked,
}

impl ProviderConnectionStatus {
    /// Local status this provider report maps to.
    pub fn as_connection_status(&self) -> ConnectionStatus {
        match self {
            Self::Active => ConnectionStatus::Authorized,
            Self::InProgress => ConnectionStatus::InProgress,
            Self::Expired => ConnectionStatus::Expired,
            Self::Revoked => ConnectionStatus::Revoked,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionState {
    pub status: ProviderConnectionStatus,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of a successful callback exchange.
pub struct CompletedLink {
    pub status: ProviderConnectionStatus,
    pub secret: SecretString,
    pub expires_at: Option<DateTime<Utc>>,
    pub accounts: Vec<BankingAccountData>,
}

impl std::fmt::Debug for CompletedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletedLink")
            .field("status", &self.status)
            .field("expires_at", &self.expires_at)
            .field("accounts", &self.accounts.len())
            .finish_non_exhaustive()
    }
}

/// Account as reported by a provider.
#[derive(Debug, Clone)]
pub struct BankingAccountData {
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

impl From<BankingAccountData> for NewBankingAccount {
    fn from(data: BankingAccountData) -> Self {
        NewBankingAccount {
            external_account_id: data.external_account_id,
            iban: data.iban,
            account_number: data.account_number,
            name: data.name,
            currency: data.currency,
            balance: data.balance,
            account_type: data.account_type,
            bank_name: data.bank_name,
            bank_country: data.bank_country,
            account_holder_name: data.account_holder_name,
            status: data.status,
        }
    }
}

/// Transaction as reported by a provider. `amount` is signed.
#[derive(Debug, Clone, PartialEq)]
pub struct BankingTransactionData {
    pub external_transaction_id: String,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub currency: String,
    pub description: Option<String>,
    pub merchant: Option<String>,
    pub status: TransactionStatus,
}

impl BankingTransactionData {
    pub fn magnitude(&self) -> Decimal {
        self.amount.abs()
    }

    pub fn direction(&self) -> TransactionDirection {
        TransactionDirection::from_signed(self.amount)
    }
}

/// Everything one sync cycle needs from the provider for a single account.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub transactions: Vec<BankingTransactionData>,
    pub balance: Decimal,
}

/// Contract every open banking adapter implements.
#[async_trait]
pub trait BankingProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Verify adapter credentials against the provider.
    async fn authenticate(&self) -> Result<(), ProviderError>;

    /// Start the OAuth handshake and return the URL to send the user to.
    async fn initiate_link(&self, request: &LinkRequest) -> Result<LinkSession, ProviderError>;

    /// Exchange the provider's connection id for a secret and the linked accounts.
    async fn complete_link_and_get_accounts(
        &self,
        external_connection_id: &str,
    ) -> Result<CompletedLink, ProviderError>;

    async fn get_accounts(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<Vec<BankingAccountData>, ProviderError>;

    /// Transactions booked within `from..=to`.
    async fn get_transactions(
        &self,
        handle: &ConnectionHandle,
        external_account_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<BankingTransactionData>, ProviderError>;

    async fn get_balance(
        &self,
        handle: &ConnectionHandle,
        external_account_id: &str,
    ) -> Result<Decimal, ProviderError>;

    async fn get_connection_status(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<ConnectionState, ProviderError>;

    /// Ask the provider to renew consent or refetch data.
    async fn refresh_connection(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<ConnectionState, ProviderError>;

    async fn is_connection_valid(&self, handle: &ConnectionHandle) -> Result<bool, ProviderError> {
        let state = self.get_connection_status(handle).await?;
        Ok(state.status == ProviderConnectionStatus::Active)
    }

    async fn revoke_connection(&self, handle: &ConnectionHandle) -> Result<(), ProviderError>;

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
