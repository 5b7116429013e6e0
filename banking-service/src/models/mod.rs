//! Domain models for banking-service.

#![allow(clippy::should_implement_trait)]

pub mod account;
pub mod connection;
pub mod sync_log;
pub mod transaction;

pub use account::{AccountStatus, BankingAccount, NewBankingAccount};
pub use connection::{is_transition_allowed, BankingConnection, ConnectionStatus, ProviderKind};
pub use sync_log::{BankingSyncStatus, SyncLog, SyncLogClose};
pub use transaction::{BankingTransactionRecord, TransactionDirection, TransactionStatus};
