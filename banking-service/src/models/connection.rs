use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Provider
// ============================================================================

/// Open banking aggregators this service knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderKind {
    #[serde(rename = "SALTEDGE")]
    SaltEdge,
    Tink,
    Yapily,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SaltEdge => "SALTEDGE",
            Self::Tink => "TINK",
            Self::Yapily => "YAPILY",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SALTEDGE" => Some(Self::SaltEdge),
            "TINK" => Some(Self::Tink),
            "YAPILY" => Some(Self::Yapily),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Connection status state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Pending,
    InProgress,
    Authorized,
    Revoked,
    Expired,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Authorized => "AUTHORIZED",
            Self::Revoked => "REVOKED",
            Self::Expired => "EXPIRED",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "AUTHORIZED" => Some(Self::Authorized),
            "REVOKED" => Some(Self::Revoked),
            "EXPIRED" => Some(Self::Expired),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// `REVOKED` and `FAILED` never leave; relinking creates a new connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Revoked | Self::Failed)
    }

    /// Whether a provider identifier must be present in this state.
    pub fn requires_external_id(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether an encrypted secret must be present in this state.
    pub fn requires_secret(&self) -> bool {
        !matches!(self, Self::Pending | Self::Failed)
    }

    pub fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        is_transition_allowed(*self, next)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every edge of the connection lifecycle.
pub fn is_transition_allowed(from: ConnectionStatus, to: ConnectionStatus) -> bool {
    use ConnectionStatus::*;
    matches!(
        (from, to),
        (Pending, InProgress)
            | (Pending, Authorized)
            | (Pending, Failed)
            | (InProgress, Authorized)
            | (InProgress, Failed)
            | (InProgress, Revoked)
            | (InProgress, Expired)
            | (Authorized, Expired)
            | (Authorized, Revoked)
            | (Expired, Authorized)
            | (Expired, Revoked)
    )
}

// ============================================================================
// Connection
// ============================================================================

/// One OAuth-authorized link between a user and a provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BankingConnection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: ProviderKind,
    pub status: ConnectionStatus,
    pub external_connection_id: Option<String>,
    #[serde(skip_serializing)]
    pub encrypted_secret: Option<String>,
    pub authorized_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(skip_serializing)]
    pub link_state_hash: Option<String>,
    #[serde(skip_serializing)]
    pub link_state_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BankingConnection {
    /// A fresh `PENDING` connection carrying its link-state record.
    pub fn pending(
        id: Uuid,
        user_id: Uuid,
        provider: ProviderKind,
        link_state_hash: String,
        link_state_expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            provider,
            status: ConnectionStatus::Pending,
            external_connection_id: None,
            encrypted_secret: None,
            authorized_at: None,
            expires_at: None,
            last_error: None,
            link_state_hash: Some(link_state_hash),
            link_state_expires_at: Some(link_state_expires_at),
            created_at: now,
            updated_at: now,
        }
    }

    /// Checks the external-id and secret nullability rules for the current status.
    pub fn satisfies_invariants(&self) -> bool {
        self.external_connection_id.is_some() == self.status.requires_external_id()
            && self.encrypted_secret.is_some() == self.status.requires_secret()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}
