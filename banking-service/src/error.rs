//! Error taxonomy for the banking integration.

use crate::models::ConnectionStatus;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// Why a provider refused a call for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    /// Credentials or consent no longer accepted (401/403).
    Unauthorized,
    /// The provider reports the connection as revoked or disabled.
    Revoked,
    /// Unknown connection, account or customer (404).
    NotFound,
    /// Request rejected as invalid (400/409/422).
    Rejected,
}

impl PermanentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Revoked => "revoked",
            Self::NotFound => "not_found",
            Self::Rejected => "rejected",
        }
    }
}

/// Failure of a single adapter call.
///
/// Messages carry the provider error class and HTTP status only, never the
/// response body, so they are safe to persist in a `SyncLog`.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Provider temporarily unavailable: {0}")]
    Transient(String),

    #[error("Provider rejected request ({}): {message}", kind.as_str())]
    Permanent { kind: PermanentKind, message: String },

    #[error("Request signing failed: {0}")]
    Signing(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn permanent(kind: PermanentKind, message: impl Into<String>) -> Self {
        Self::Permanent {
            kind,
            message: message.into(),
        }
    }

    /// Timeouts, 5xx and rate limiting may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn permanent_kind(&self) -> Option<PermanentKind> {
        match self {
            Self::Permanent { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Stable code recorded on `SyncLog.error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient(_) => "PROVIDER_TRANSIENT",
            Self::Permanent { kind, .. } => match kind {
                PermanentKind::Unauthorized => "PROVIDER_UNAUTHORIZED",
                PermanentKind::Revoked => "PROVIDER_REVOKED",
                PermanentKind::NotFound => "PROVIDER_NOT_FOUND",
                PermanentKind::Rejected => "PROVIDER_REJECTED",
            },
            Self::Signing(_) => "SIGNING_FAILED",
            Self::NotConfigured(_) => "PROVIDER_NOT_CONFIGURED",
            Self::InvalidResponse(_) => "PROVIDER_INVALID_RESPONSE",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            ProviderError::Transient(format!("network error: {}", err.without_url()))
        } else if err.is_decode() {
            ProviderError::InvalidResponse("undecodable response body".to_string())
        } else {
            ProviderError::Transient(format!("http error: {}", err.without_url()))
        }
    }
}

/// Failure to encrypt or decrypt a connection secret.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Ciphertext is malformed: {0}")]
    Malformed(&'static str),

    #[error("Ciphertext failed authentication")]
    Authentication,
}

#[derive(Debug, Error)]
pub enum BankingError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Key path is outside the allowed directories ({allowed})")]
    PathSecurity { allowed: String },

    #[error("Private key file not found")]
    KeyNotFound,

    #[error("Private key is malformed: {0}")]
    MalformedKey(String),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("OAuth callback rejected: {0}")]
    Correlation(String),

    #[error("A sync is already running for account {0}")]
    SyncInProgress(Uuid),

    #[error("Connection cannot move from {from} to {to}")]
    InvalidTransition {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },

    #[error("Connection is {0}, expected AUTHORIZED")]
    ConnectionNotActive(ConnectionStatus),

    #[error("Banking provider {0} is not available")]
    ProviderUnavailable(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl BankingError {
    /// Stable code recorded on `SyncLog.error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION",
            Self::PathSecurity { .. } => "PATH_SECURITY",
            Self::KeyNotFound => "KEY_NOT_FOUND",
            Self::MalformedKey(_) => "MALFORMED_KEY",
            Self::Encryption(_) => "ENCRYPTION",
            Self::Provider(e) => e.code(),
            Self::Correlation(_) => "CORRELATION",
            Self::SyncInProgress(_) => "SYNC_IN_PROGRESS",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ConnectionNotActive(_) => "CONNECTION_NOT_ACTIVE",
            Self::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::Database(_) => "DATABASE",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::Database(_) => true,
            _ => false,
        }
    }

    /// Message fit for a `SyncLog` row or an API response.
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::Database(_) => "database error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<BankingError> for AppError {
    fn from(err: BankingError) -> Self {
        match err {
            BankingError::Correlation(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            BankingError::NotFound(e) => AppError::NotFound(anyhow::anyhow!("{} not found", e)),
            BankingError::Forbidden(e) => AppError::Forbidden(anyhow::anyhow!(e)),
            BankingError::SyncInProgress(id) => {
                AppError::Conflict(anyhow::anyhow!("A sync is already running for account {}", id))
            }
            BankingError::Conflict(e) => AppError::Conflict(anyhow::anyhow!(e)),
            e @ BankingError::InvalidTransition { .. } => {
                AppError::Conflict(anyhow::anyhow!(e.to_string()))
            }
            e @ BankingError::ConnectionNotActive(_) => {
                AppError::Conflict(anyhow::anyhow!(e.to_string()))
            }
            BankingError::ProviderUnavailable(p) => {
                AppError::BadRequest(anyhow::anyhow!("Banking provider {} is not available", p))
            }
            BankingError::Provider(e) => AppError::BadGateway(e.code().to_string()),
            BankingError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            e @ (BankingError::Configuration(_)
            | BankingError::PathSecurity { .. }
            | BankingError::KeyNotFound
            | BankingError::MalformedKey(_)) => AppError::ConfigError(anyhow::anyhow!(e.to_string())),
            e @ BankingError::Encryption(_) => AppError::InternalError(anyhow::anyhow!(e.to_string())),
        }
    }
}

pub type Result<T, E = BankingError> = std::result::Result<T, E>;
