//! Connection lifecycle: linking, completion, refresh, expiry and revocation.
//!
//! Every status change goes through [`ConnectionManager::transition`], which
//! checks the lifecycle edge and writes with compare-and-set on the status
//! the caller observed.

use super::callback::VerifiedLink;
use super::metrics::{BankingEvent, EventSink};
use super::store::{BankingStore, LinkCompletion, StatusUpdate};
use crate::error::{BankingError, PermanentKind, ProviderError, Result};
use crate::models::{
    is_transition_allowed, BankingAccount, BankingConnection, ConnectionStatus, NewBankingAccount,
    ProviderKind,
};
use crate::providers::{
    ConnectionHandle, ConnectionState, LinkRequest, ProviderConnectionStatus, ProviderRegistry,
};
use crate::security::{LinkStateSigner, SecretCipher};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// What the caller needs to send the user to the provider.
#[derive(Debug, Clone)]
pub struct LinkStart {
    pub connection_id: Uuid,
    pub redirect_url: String,
    pub state_expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    store: Arc<dyn BankingStore>,
    providers: Arc<ProviderRegistry>,
    cipher: Arc<dyn SecretCipher>,
    link_state: LinkStateSigner,
    redirect_uri: String,
    events: Arc<dyn EventSink>,
}

impl ConnectionManager {
    pub fn new(
        store: Arc<dyn BankingStore>,
        providers: Arc<ProviderRegistry>,
        cipher: Arc<dyn SecretCipher>,
        link_state: LinkStateSigner,
        redirect_uri: impl Into<String>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            providers,
            cipher,
            link_state,
            redirect_uri: redirect_uri.into(),
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn BankingStore> {
        &self.store
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn link_state(&self) -> &LinkStateSigner {
        &self.link_state
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Issue a state token, ask the provider for a redirect and persist the
    /// `PENDING` connection. Nothing is stored when the provider refuses.
    #[instrument(skip(self), fields(provider = %provider))]
    pub async fn start_link(&self, user_id: Uuid, provider: ProviderKind) -> Result<LinkStart> {
        let adapter = self.providers.get(provider)?;
        let connection_id = Uuid::new_v4();
        let issued = self.link_state.issue(connection_id)?;

        let separator = if self.redirect_uri.contains('?') { '&' } else { '?' };
        let return_to = format!(
            "{}{}connectionId={}&state={}",
            self.redirect_uri,
            separator,
            connection_id,
            urlencoding::encode(&issued.token)
        );

        let session = adapter
            .initiate_link(&LinkRequest {
                user_id,
                connection_id,
                return_to,
            })
            .await
            .map_err(|e| self.provider_failed(provider, "initiate_link", e))?;

        let connection = BankingConnection::pending(
            connection_id,
            user_id,
            provider,
            issued.nonce_hash,
            issued.expires_at,
        );
        self.store.insert_pending_connection(&connection).await?;

        self.events.record(&BankingEvent::LinkStarted {
            connection_id,
            provider,
        });
        info!(connection_id = %connection_id, "Link started");

        Ok(LinkStart {
            connection_id,
            redirect_url: session.redirect_url,
            state_expires_at: issued.expires_at,
        })
    }

    /// Exchange the provider's connection id and persist the outcome.
    ///
    /// A transient provider failure leaves the connection `PENDING` and is
    /// returned as an error; a permanent one moves it to `FAILED`.
    #[instrument(skip(self, link), fields(connection_id = %link.connection_id()))]
    pub async fn complete_link(
        &self,
        link: VerifiedLink,
        external_connection_id: &str,
    ) -> Result<BankingConnection> {
        let connection = self.require_connection(link.connection_id()).await?;
        if connection.status != ConnectionStatus::Pending {
            return Err(BankingError::InvalidTransition {
                from: connection.status,
                to: ConnectionStatus::Authorized,
            });
        }
        let adapter = self.providers.get(connection.provider)?;

        let completed = match adapter
            .complete_link_and_get_accounts(external_connection_id)
            .await
        {
            Ok(completed) => completed,
            Err(e) if e.is_retryable() => {
                return Err(self.provider_failed(connection.provider, "complete_link", e));
            }
            Err(e) => {
                let e = self.provider_failed(connection.provider, "complete_link", e);
                return self
                    .finish_failed(&connection, external_connection_id, e.sanitized_message())
                    .await;
            }
        };

        let target = completed.status.as_connection_status();
        if !matches!(target, ConnectionStatus::Authorized | ConnectionStatus::InProgress) {
            return self
                .finish_failed(
                    &connection,
                    external_connection_id,
                    format!("provider reported connection as {}", target),
                )
                .await;
        }

        let encrypted = self.cipher.encrypt_secret(&completed.secret).await?;
        let accounts: Vec<NewBankingAccount> = completed
            .accounts
            .into_iter()
            .map(NewBankingAccount::from)
            .collect();

        let completion = LinkCompletion {
            status: target,
            external_connection_id: external_connection_id.to_string(),
            encrypted_secret: Some(encrypted),
            authorized_at: Some(Utc::now()),
            expires_at: completed.expires_at,
            last_error: None,
        };
        let updated = self
            .store
            .complete_link(connection.id, &completion, &accounts)
            .await?;

        self.record_transition(&connection, target);
        info!(status = %target, accounts = accounts.len(), "Link completed");
        Ok(updated)
    }

    /// The provider redirected back with an error instead of a connection.
    #[instrument(skip(self, link), fields(connection_id = %link.connection_id()))]
    pub async fn fail_link(
        &self,
        link: VerifiedLink,
        external_connection_id: &str,
        reason: &str,
    ) -> Result<BankingConnection> {
        let connection = self.require_connection(link.connection_id()).await?;
        self.finish_failed(&connection, external_connection_id, format!("provider error: {}", reason))
            .await
    }

    async fn finish_failed(
        &self,
        connection: &BankingConnection,
        external_connection_id: &str,
        reason: String,
    ) -> Result<BankingConnection> {
        if !is_transition_allowed(connection.status, ConnectionStatus::Failed) {
            return Err(BankingError::InvalidTransition {
                from: connection.status,
                to: ConnectionStatus::Failed,
            });
        }

        let completion = LinkCompletion {
            status: ConnectionStatus::Failed,
            external_connection_id: external_connection_id.to_string(),
            encrypted_secret: None,
            authorized_at: None,
            expires_at: None,
            last_error: Some(reason),
        };
        let updated = self.store.complete_link(connection.id, &completion, &[]).await?;
        self.record_transition(connection, ConnectionStatus::Failed);
        warn!(connection_id = %connection.id, "Link failed");
        Ok(updated)
    }

    /// Ask the provider to refresh the connection and apply what it reports.
    #[instrument(skip(self))]
    pub async fn refresh_status(&self, connection_id: Uuid) -> Result<BankingConnection> {
        let connection = self.require_connection(connection_id).await?;
        if !matches!(
            connection.status,
            ConnectionStatus::Authorized | ConnectionStatus::InProgress | ConnectionStatus::Expired
        ) {
            return Err(BankingError::ConnectionNotActive(connection.status));
        }

        let adapter = self.providers.get(connection.provider)?;
        let handle = self.connection_handle(&connection).await?;

        let state = match adapter.refresh_connection(&handle).await {
            Ok(state) => state,
            Err(e) => match e.permanent_kind() {
                Some(PermanentKind::Unauthorized) => ConnectionState {
                    status: ProviderConnectionStatus::Expired,
                    expires_at: None,
                },
                Some(PermanentKind::Revoked) | Some(PermanentKind::NotFound) => ConnectionState {
                    status: ProviderConnectionStatus::Revoked,
                    expires_at: None,
                },
                _ => return Err(self.provider_failed(connection.provider, "refresh_connection", e)),
            },
        };

        let target = state.status.as_connection_status();
        if target == connection.status {
            return Ok(connection);
        }
        if !is_transition_allowed(connection.status, target) {
            warn!(from = %connection.status, to = %target, "Ignoring provider status without a lifecycle edge");
            return Ok(connection);
        }

        let mut update = StatusUpdate::to(target);
        update.expires_at = state.expires_at;
        if target == ConnectionStatus::Authorized {
            update.authorized_at = Some(Utc::now());
        } else {
            update.last_error = Some(format!("provider reported connection as {}", target));
        }
        self.transition(&connection, update).await
    }

    /// Revoke on the provider (best effort) and always revoke locally.
    #[instrument(skip(self))]
    pub async fn revoke(&self, connection_id: Uuid, user_id: Uuid) -> Result<BankingConnection> {
        let connection = self.require_connection(connection_id).await?;
        if connection.user_id != user_id {
            return Err(BankingError::Forbidden(
                "connection belongs to another user".to_string(),
            ));
        }
        if connection.status == ConnectionStatus::Revoked {
            return Ok(connection);
        }
        if !is_transition_allowed(connection.status, ConnectionStatus::Revoked) {
            return Err(BankingError::InvalidTransition {
                from: connection.status,
                to: ConnectionStatus::Revoked,
            });
        }

        if let Err(e) = self.revoke_remote(&connection).await {
            warn!(code = e.code(), "Provider revoke failed, revoking locally");
        }

        self.transition(
            &connection,
            StatusUpdate::to(ConnectionStatus::Revoked).with_error("revoked by user"),
        )
        .await
    }

    async fn revoke_remote(&self, connection: &BankingConnection) -> Result<()> {
        let adapter = self.providers.get(connection.provider)?;
        let handle = self.connection_handle(connection).await?;
        adapter
            .revoke_connection(&handle)
            .await
            .map_err(|e| self.provider_failed(connection.provider, "revoke_connection", e))
    }

    /// Consent lapsed; sync must stop until the user reauthorizes.
    pub async fn mark_expired(&self, connection_id: Uuid, reason: &str) -> Result<BankingConnection> {
        self.move_to(connection_id, ConnectionStatus::Expired, reason).await
    }

    /// The provider or bank disabled the connection.
    pub async fn mark_revoked(&self, connection_id: Uuid, reason: &str) -> Result<BankingConnection> {
        self.move_to(connection_id, ConnectionStatus::Revoked, reason).await
    }

    async fn move_to(
        &self,
        connection_id: Uuid,
        target: ConnectionStatus,
        reason: &str,
    ) -> Result<BankingConnection> {
        let connection = self.require_connection(connection_id).await?;
        if connection.status == target {
            return Ok(connection);
        }
        self.transition(&connection, StatusUpdate::to(target).with_error(reason))
            .await
    }

    /// Move `AUTHORIZED` connections past their `expires_at` to `EXPIRED`.
    #[instrument(skip(self))]
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;
        for connection in self
            .store
            .list_connections_by_status(ConnectionStatus::Authorized)
            .await?
        {
            if !connection.is_overdue(now) {
                continue;
            }
            match self
                .transition(
                    &connection,
                    StatusUpdate::to(ConnectionStatus::Expired).with_error("consent expired"),
                )
                .await
            {
                Ok(_) => expired += 1,
                Err(BankingError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if expired > 0 {
            info!(expired, "Expired overdue connections");
        }
        Ok(expired)
    }

    pub async fn get_connection(&self, connection_id: Uuid) -> Result<BankingConnection> {
        self.require_connection(connection_id).await
    }

    pub async fn list_connections(&self, user_id: Uuid) -> Result<Vec<BankingConnection>> {
        self.store.list_connections_for_user(user_id).await
    }

    pub async fn list_accounts(&self, connection_id: Uuid) -> Result<Vec<BankingAccount>> {
        self.store.list_accounts(connection_id).await
    }

    /// Provider identity for calls on an established connection.
    pub async fn connection_handle(&self, connection: &BankingConnection) -> Result<ConnectionHandle> {
        let external_id = connection
            .external_connection_id
            .clone()
            .ok_or(BankingError::ConnectionNotActive(connection.status))?;
        let secret = match &connection.encrypted_secret {
            Some(ciphertext) => Some(self.cipher.decrypt_secret(ciphertext).await?),
            None => None,
        };
        Ok(ConnectionHandle::new(external_id, secret))
    }

    async fn transition(
        &self,
        connection: &BankingConnection,
        update: StatusUpdate,
    ) -> Result<BankingConnection> {
        if !is_transition_allowed(connection.status, update.status) {
            return Err(BankingError::InvalidTransition {
                from: connection.status,
                to: update.status,
            });
        }

        let updated = self
            .store
            .update_connection_status(connection.id, connection.status, &update)
            .await?;
        self.record_transition(connection, update.status);
        info!(
            connection_id = %connection.id,
            from = %connection.status,
            to = %update.status,
            "Connection status changed"
        );
        Ok(updated)
    }

    fn record_transition(&self, connection: &BankingConnection, to: ConnectionStatus) {
        self.events.record(&BankingEvent::ConnectionTransition {
            connection_id: connection.id,
            provider: connection.provider,
            from: connection.status,
            to,
        });
    }

    fn provider_failed(&self, provider: ProviderKind, operation: &'static str, error: ProviderError) -> BankingError {
        self.events.record(&BankingEvent::ProviderFailure {
            provider,
            operation,
            code: error.code(),
        });
        BankingError::Provider(error)
    }

    async fn require_connection(&self, connection_id: Uuid) -> Result<BankingConnection> {
        self.store
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| BankingError::NotFound(format!("Connection {}", connection_id)))
    }
}
