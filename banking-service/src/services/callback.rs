//! OAuth callback correlation.
//!
//! The only way to obtain a [`VerifiedLink`] is through
//! [`OAuthCallbackHandler::handle`], so a connection can leave `PENDING` only
//! after its state token has been matched against the stored record.

use super::connections::ConnectionManager;
use super::metrics::BankingEvent;
use crate::error::{BankingError, PermanentKind, ProviderError, Result};
use crate::models::{BankingConnection, ConnectionStatus};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const MAX_ERROR_CLASS_LEN: usize = 64;

/// Proof that a callback was correlated with its pending connection.
#[derive(Debug)]
pub struct VerifiedLink {
    connection_id: Uuid,
}

impl VerifiedLink {
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }
}

/// Query parameters the provider sends the browser back with.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    #[serde(rename = "connectionId")]
    pub connection_id: Option<String>,
    pub state: Option<String>,
    /// Provider-side connection id.
    #[serde(rename = "connection_id")]
    pub external_connection_id: Option<String>,
    #[serde(rename = "error_class")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct OAuthCallbackHandler {
    manager: ConnectionManager,
}

impl OAuthCallbackHandler {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    #[instrument(skip(self, params))]
    pub async fn handle(&self, params: CallbackParams, now: DateTime<Utc>) -> Result<BankingConnection> {
        let link = self.verify(&params, now).await?;

        match (params.external_connection_id.as_deref(), params.error.as_deref()) {
            (Some(external_id), None) => self.manager.complete_link(link, external_id).await,
            (Some(external_id), Some(error)) => {
                self.manager
                    .fail_link(link, external_id, &sanitize_error_class(error))
                    .await
            }
            (None, Some(error)) => {
                // Without a provider id the connection cannot leave PENDING.
                warn!(connection_id = %link.connection_id(), "Provider returned an error before creating a connection");
                Err(BankingError::Provider(ProviderError::permanent(
                    PermanentKind::Rejected,
                    sanitize_error_class(error),
                )))
            }
            (None, None) => Err(self.reject("missing_connection", "missing provider connection id")),
        }
    }

    /// Check the token and the stored record; yields the only path to a `VerifiedLink`.
    async fn verify(&self, params: &CallbackParams, now: DateTime<Utc>) -> Result<VerifiedLink> {
        let (Some(connection_id), Some(state)) = (params.connection_id.as_deref(), params.state.as_deref())
        else {
            return Err(self.reject("missing_params", "missing connectionId or state"));
        };
        let connection_id = Uuid::parse_str(connection_id)
            .map_err(|_| self.reject("missing_params", "malformed connectionId"))?;

        let claims = self
            .manager
            .link_state()
            .verify(state, now)
            .map_err(|_| self.reject("invalid_state", "invalid or expired state"))?;
        if claims.connection_id != connection_id {
            return Err(self.reject("state_mismatch", "state does not belong to this connection"));
        }

        let connection = match self.manager.get_connection(connection_id).await {
            Ok(connection) => connection,
            Err(BankingError::NotFound(_)) => {
                return Err(self.reject("unknown_connection", "unknown connection"))
            }
            Err(e) => return Err(e),
        };
        if connection.status != ConnectionStatus::Pending {
            return Err(self.reject("already_used", "link already completed"));
        }

        let record_matches = connection
            .link_state_hash
            .as_deref()
            .is_some_and(|hash| claims.matches_record(hash));
        if !record_matches {
            return Err(self.reject("state_mismatch", "state does not match the pending link"));
        }
        if connection.link_state_expires_at.is_some_and(|at| at <= now) {
            return Err(self.reject("expired", "invalid or expired state"));
        }

        info!(connection_id = %connection_id, "OAuth callback correlated");
        Ok(VerifiedLink { connection_id })
    }

    fn reject(&self, reason: &'static str, message: &str) -> BankingError {
        self.manager
            .events()
            .record(&BankingEvent::CallbackRejected { reason });
        warn!(reason, "OAuth callback rejected");
        BankingError::Correlation(message.to_string())
    }
}

/// Keep provider error classes to a short identifier before they are stored.
fn sanitize_error_class(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .take(MAX_ERROR_CLASS_LEN)
        .collect();
    if cleaned.is_empty() {
        "UnknownError".to_string()
    } else {
        cleaned
    }
}
