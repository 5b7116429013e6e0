//! SaltEdge Account Information API (v5) adapter.
//!
//! Every call is signed with the application's RSA key (see
//! [`RequestSigner`]). Provider error bodies are reduced to their error class
//! and HTTP status before they leave this module.

use super::{
    BankingAccountData, BankingProvider, BankingTransactionData, CompletedLink, ConnectionHandle,
    ConnectionState, LinkRequest, LinkSession, ProviderConnectionStatus,
};
use crate::error::{BankingError, PermanentKind, ProviderError};
use crate::models::{AccountStatus, ProviderKind, TransactionStatus};
use crate::security::{CanonicalRequest, RequestSigner};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use reqwest::{Client, Method, StatusCode, Url};
use rust_decimal::Decimal;
use secrecy::{Secret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Production API root.
pub const SALTEDGE_API_URL: &str = "https://www.saltedge.com/api/v5";

const FETCH_SCOPES: [&str; 3] = ["accounts", "balance", "transactions"];
const CONSENT_SCOPES: [&str; 2] = ["account_details", "transactions_details"];

/// SaltEdge adapter configuration.
#[derive(Clone)]
pub struct SaltEdgeConfig {
    pub api_url: String,
    pub app_id: String,
    pub secret: SecretString,
    /// PEM private key matching the public key registered with SaltEdge.
    pub private_key: SecretString,
    pub request_timeout: Duration,
    pub signature_ttl: Duration,
    /// How far back the consent reaches when a link is created.
    pub consent_lookback_days: i64,
}

impl std::fmt::Debug for SaltEdgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaltEdgeConfig")
            .field("api_url", &self.api_url)
            .field("app_id", &self.app_id)
            .field("request_timeout", &self.request_timeout)
            .field("signature_ttl", &self.signature_ttl)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
    #[serde(default)]
    meta: Option<PageMeta>,
}

#[derive(Debug, Deserialize)]
struct PageMeta {
    next_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    class: String,
}

#[derive(Debug, Deserialize)]
struct SeCustomer {
    id: String,
    identifier: String,
}

#[derive(Debug, Deserialize)]
struct SeConnectSession {
    connect_url: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SeConnection {
    secret: String,
    status: String,
    #[serde(default)]
    last_attempt: Option<SeAttempt>,
    #[serde(default)]
    consent_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SeAttempt {
    #[serde(default)]
    finished: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SeAccount {
    id: String,
    name: Option<String>,
    nature: Option<String>,
    balance: Decimal,
    currency_code: String,
    #[serde(default)]
    extra: SeAccountExtra,
}

#[derive(Debug, Default, Deserialize)]
struct SeAccountExtra {
    iban: Option<String>,
    account_number: Option<String>,
    client_name: Option<String>,
    provider_name: Option<String>,
    country_code: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SeTransaction {
    id: String,
    made_on: NaiveDate,
    amount: Decimal,
    currency_code: String,
    description: Option<String>,
    status: String,
    #[serde(default)]
    extra: SeTransactionExtra,
}

#[derive(Debug, Default, Deserialize)]
struct SeTransactionExtra {
    payee: Option<String>,
    merchant_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CustomerRequest<'a> {
    identifier: &'a str,
}

// ============================================================================
// Mapping helpers
// ============================================================================

/// Map SaltEdge's connection `status` (and last attempt) to a provider state.
fn connection_status(connection: &SeConnection) -> ProviderConnectionStatus {
    match connection.status.as_str() {
        "active" => {
            let pending = connection
                .last_attempt
                .as_ref()
                .and_then(|attempt| attempt.finished)
                == Some(false);
            if pending {
                ProviderConnectionStatus::InProgress
            } else {
                ProviderConnectionStatus::Active
            }
        }
        "disabled" => ProviderConnectionStatus::Revoked,
        _ => ProviderConnectionStatus::Expired,
    }
}

fn account_data(account: SeAccount) -> BankingAccountData {
    let status = match account.extra.status.as_deref() {
        Some(status) => AccountStatus::from_str(status),
        None => AccountStatus::Active,
    };
    BankingAccountData {
        external_account_id: account.id,
        iban: account.extra.iban,
        account_number: account.extra.account_number,
        name: account.name,
        currency: account.currency_code,
        balance: account.balance,
        account_type: account.nature,
        bank_name: account.extra.provider_name,
        bank_country: account.extra.country_code,
        account_holder_name: account.extra.client_name,
        status,
    }
}

fn transaction_data(tx: SeTransaction) -> BankingTransactionData {
    let status = match tx.status.as_str() {
        "posted" => TransactionStatus::Completed,
        "cancelled" | "canceled" => TransactionStatus::Cancelled,
        _ => TransactionStatus::Pending,
    };
    BankingTransactionData {
        external_transaction_id: tx.id,
        date: tx.made_on,
        amount: tx.amount,
        currency: tx.currency_code,
        description: tx.description,
        merchant: tx.extra.payee.or(tx.extra.merchant_id),
        status,
    }
}

/// Classify a non-2xx response from its status and SaltEdge error class.
pub fn classify_error(status: StatusCode, class: Option<&str>) -> ProviderError {
    let label = class.unwrap_or("UnknownError");
    let message = format!("{} ({})", label, status.as_u16());

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return ProviderError::Transient(message);
    }

    match label {
        "ConnectionDisabled" | "ConnectionRevoked" | "ConsentRevoked" => {
            return ProviderError::permanent(PermanentKind::Revoked, message)
        }
        "ConnectionNotFound" | "AccountNotFound" | "CustomerNotFound" => {
            return ProviderError::permanent(PermanentKind::NotFound, message)
        }
        "ConsentExpired" | "InvalidCredentials" | "ConnectionExpired" => {
            return ProviderError::permanent(PermanentKind::Unauthorized, message)
        }
        _ => {}
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::permanent(PermanentKind::Unauthorized, message)
        }
        StatusCode::NOT_FOUND => ProviderError::permanent(PermanentKind::NotFound, message),
        StatusCode::REQUEST_TIMEOUT => ProviderError::Transient(message),
        _ => ProviderError::permanent(PermanentKind::Rejected, message),
    }
}

// ============================================================================
// Adapter
// ============================================================================

pub struct SaltEdgeProvider {
    client: Client,
    base_url: String,
    signer: RequestSigner,
    consent_lookback_days: i64,
    customers: DashMap<Uuid, String>,
}

impl SaltEdgeProvider {
    /// Parse the signing key and build the HTTP client. Fails on a bad key.
    pub fn new(config: SaltEdgeConfig) -> Result<Self, BankingError> {
        let signer = RequestSigner::from_pem(
            &config.private_key,
            config.app_id.clone(),
            config.secret.clone(),
            config.signature_ttl,
        )?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BankingError::Configuration(format!("HTTP client: {}", e)))?;

        info!(api_url = %config.api_url, "SaltEdge provider initialized");

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            signer,
            consent_lookback_days: config.consent_lookback_days,
            customers: DashMap::new(),
        })
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|_| ProviderError::NotConfigured("invalid SaltEdge API URL".to_string()))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Sign and send one request, decoding the `data` envelope.
    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> Result<Envelope<T>, ProviderError> {
        let url = self.url(path, query)?;
        let body = match body {
            Some(value) => serde_json::to_string(&value)
                .map_err(|_| ProviderError::InvalidResponse("unserializable request".to_string()))?,
            None => String::new(),
        };

        let headers = self
            .signer
            .sign(&CanonicalRequest {
                method: method.as_str(),
                url: url.as_str(),
                body: &body,
            })?
            .to_header_map()?;

        debug!(method = %method, path = %path, "SaltEdge request");

        let mut request = self
            .client
            .request(method.clone(), url)
            .headers(headers)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let class = response
                .json::<ErrorEnvelope>()
                .await
                .ok()
                .map(|e| e.error.class);
            let error = classify_error(status, class.as_deref());
            warn!(
                method = %method,
                path = %path,
                status = status.as_u16(),
                code = error.code(),
                "SaltEdge request failed"
            );
            return Err(error);
        }

        response
            .json::<Envelope<T>>()
            .await
            .map_err(|_| ProviderError::InvalidResponse(format!("undecodable {} response", path)))
    }

    /// Collect every page of a list endpoint by following `meta.next_id`.
    async fn list_all<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, ProviderError> {
        let mut items = Vec::new();
        let mut from_id: Option<String> = None;

        loop {
            let mut params: Vec<(&str, &str)> = query.to_vec();
            if let Some(cursor) = from_id.as_deref() {
                params.push(("from_id", cursor));
            }
            let page: Envelope<Vec<T>> = self.send(Method::GET, path, &params, None).await?;
            items.extend(page.data);

            match page.meta.and_then(|m| m.next_id) {
                Some(next) if Some(&next) != from_id.as_ref() => from_id = Some(next),
                _ => break,
            }
        }

        Ok(items)
    }

    /// Create the customer for `user_id`, or find it when it already exists.
    #[instrument(skip(self))]
    async fn ensure_customer(&self, user_id: Uuid) -> Result<String, ProviderError> {
        if let Some(id) = self.customers.get(&user_id) {
            return Ok(id.clone());
        }

        let identifier = user_id.to_string();
        let created = self
            .send::<SeCustomer>(
                Method::POST,
                "/customers",
                &[],
                Some(json!({ "data": CustomerRequest { identifier: &identifier } })),
            )
            .await;

        let customer_id = match created {
            Ok(envelope) => envelope.data.id,
            Err(ProviderError::Permanent {
                kind: PermanentKind::Rejected,
                message,
            }) if message.starts_with("DuplicatedCustomer") => {
                debug!("SaltEdge customer exists, looking it up");
                self.list_all::<SeCustomer>("/customers", &[])
                    .await?
                    .into_iter()
                    .find(|c| c.identifier == identifier)
                    .map(|c| c.id)
                    .ok_or_else(|| {
                        ProviderError::permanent(PermanentKind::NotFound, "CustomerNotFound (404)")
                    })?
            }
            Err(e) => return Err(e),
        };

        self.customers.insert(user_id, customer_id.clone());
        Ok(customer_id)
    }

    async fn fetch_connection(&self, external_connection_id: &str) -> Result<SeConnection, ProviderError> {
        let path = format!("/connections/{}", external_connection_id);
        Ok(self.send::<SeConnection>(Method::GET, &path, &[], None).await?.data)
    }

    async fn fetch_accounts(&self, external_connection_id: &str) -> Result<Vec<SeAccount>, ProviderError> {
        self.list_all("/accounts", &[("connection_id", external_connection_id)])
            .await
    }
}

#[async_trait]
impl BankingProvider for SaltEdgeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SaltEdge
    }

    #[instrument(skip(self))]
    async fn authenticate(&self) -> Result<(), ProviderError> {
        self.send::<serde_json::Value>(Method::GET, "/countries", &[], None)
            .await?;
        info!("SaltEdge credentials verified");
        Ok(())
    }

    #[instrument(skip(self, request), fields(connection_id = %request.connection_id))]
    async fn initiate_link(&self, request: &LinkRequest) -> Result<LinkSession, ProviderError> {
        let customer_id = self.ensure_customer(request.user_id).await?;
        let from_date = (Utc::now() - chrono::Duration::days(self.consent_lookback_days)).date_naive();

        let body = json!({
            "data": {
                "customer_id": customer_id,
                "consent": {
                    "scopes": CONSENT_SCOPES,
                    "from_date": from_date,
                },
                "attempt": {
                    "return_to": request.return_to,
                    "fetch_scopes": FETCH_SCOPES,
                    "from_date": from_date,
                },
            }
        });

        let session = self
            .send::<SeConnectSession>(Method::POST, "/connect_sessions/create", &[], Some(body))
            .await?
            .data;

        Ok(LinkSession {
            redirect_url: session.connect_url,
            provider_reference: Some(customer_id),
            expires_at: session.expires_at,
        })
    }

    #[instrument(skip(self))]
    async fn complete_link_and_get_accounts(
        &self,
        external_connection_id: &str,
    ) -> Result<CompletedLink, ProviderError> {
        let connection = self.fetch_connection(external_connection_id).await?;
        let status = connection_status(&connection);

        let accounts = match status {
            ProviderConnectionStatus::Active | ProviderConnectionStatus::InProgress => self
                .fetch_accounts(external_connection_id)
                .await?
                .into_iter()
                .map(account_data)
                .collect(),
            _ => Vec::new(),
        };

        Ok(CompletedLink {
            status,
            secret: Secret::new(connection.secret),
            expires_at: connection.consent_expires_at,
            accounts,
        })
    }

    #[instrument(skip(self, handle), fields(external_connection_id = %handle.external_connection_id))]
    async fn get_accounts(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<Vec<BankingAccountData>, ProviderError> {
        Ok(self
            .fetch_accounts(&handle.external_connection_id)
            .await?
            .into_iter()
            .map(account_data)
            .collect())
    }

    #[instrument(skip(self, handle), fields(external_connection_id = %handle.external_connection_id))]
    async fn get_transactions(
        &self,
        handle: &ConnectionHandle,
        external_account_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<BankingTransactionData>, ProviderError> {
        let transactions: Vec<SeTransaction> = self
            .list_all(
                "/transactions",
                &[
                    ("connection_id", handle.external_connection_id.as_str()),
                    ("account_id", external_account_id),
                ],
            )
            .await?;

        Ok(transactions
            .into_iter()
            .filter(|tx| tx.made_on >= from && tx.made_on <= to)
            .map(transaction_data)
            .collect())
    }

    #[instrument(skip(self, handle), fields(external_connection_id = %handle.external_connection_id))]
    async fn get_balance(
        &self,
        handle: &ConnectionHandle,
        external_account_id: &str,
    ) -> Result<Decimal, ProviderError> {
        self.fetch_accounts(&handle.external_connection_id)
            .await?
            .into_iter()
            .find(|account| account.id == external_account_id)
            .map(|account| account.balance)
            .ok_or_else(|| ProviderError::permanent(PermanentKind::NotFound, "AccountNotFound (404)"))
    }

    #[instrument(skip(self, handle), fields(external_connection_id = %handle.external_connection_id))]
    async fn get_connection_status(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<ConnectionState, ProviderError> {
        let connection = self.fetch_connection(&handle.external_connection_id).await?;
        Ok(ConnectionState {
            status: connection_status(&connection),
            expires_at: connection.consent_expires_at,
        })
    }

    #[instrument(skip(self, handle), fields(external_connection_id = %handle.external_connection_id))]
    async fn refresh_connection(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<ConnectionState, ProviderError> {
        let path = format!("/connections/{}/refresh", handle.external_connection_id);
        let body = json!({ "data": { "attempt": { "fetch_scopes": FETCH_SCOPES } } });
        let connection = self
            .send::<SeConnection>(Method::PUT, &path, &[], Some(body))
            .await?
            .data;
        Ok(ConnectionState {
            status: connection_status(&connection),
            expires_at: connection.consent_expires_at,
        })
    }

    #[instrument(skip(self, handle), fields(external_connection_id = %handle.external_connection_id))]
    async fn revoke_connection(&self, handle: &ConnectionHandle) -> Result<(), ProviderError> {
        let path = format!("/connections/{}", handle.external_connection_id);
        self.send::<serde_json::Value>(Method::DELETE, &path, &[], None)
            .await?;
        info!("SaltEdge connection removed");
        Ok(())
    }
}
