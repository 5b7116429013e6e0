//! SaltEdge adapter against a mock HTTP server.

use banking_service::error::{PermanentKind, ProviderError};
use banking_service::models::TransactionStatus;
use banking_service::providers::{
    BankingProvider, ConnectionHandle, LinkRequest, ProviderConnectionStatus, SaltEdgeConfig,
    SaltEdgeProvider,
};
use chrono::NaiveDate;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn private_key_pem() -> SecretString {
    static PEM: OnceLock<String> = OnceLock::new();
    let pem = PEM.get_or_init(|| {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string()
    });
    SecretString::new(pem.clone())
}

fn provider(server: &MockServer) -> SaltEdgeProvider {
    SaltEdgeProvider::new(SaltEdgeConfig {
        api_url: server.uri(),
        app_id: "app-123".to_string(),
        secret: SecretString::new("secret-456".to_string()),
        private_key: private_key_pem(),
        request_timeout: Duration::from_secs(5),
        signature_ttl: Duration::from_secs(60),
        consent_lookback_days: 90,
    })
    .unwrap()
}

fn handle(external_id: &str) -> ConnectionHandle {
    ConnectionHandle::new(external_id, Some(SecretString::new("conn-secret".to_string())))
}

fn error_body(class: &str) -> serde_json::Value {
    json!({ "error": { "class": class, "message": "provider detail that must not leak" } })
}

#[tokio::test]
async fn test_requests_carry_signing_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/countries"))
        .and(header("app-id", "app-123"))
        .and(header("secret", "secret-456"))
        .and(header_exists("expires-at"))
        .and(header_exists("signature"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .expect(1)
        .mount(&server)
        .await;

    provider(&server).authenticate().await.unwrap();
}

#[tokio::test]
async fn test_initiate_link_creates_customer_once() {
    let server = MockServer::start().await;
    let user_id = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/customers"))
        .and(body_partial_json(json!({ "data": { "identifier": user_id.to_string() } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "id": "cust-1", "identifier": user_id.to_string() }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/connect_sessions/create"))
        .and(body_partial_json(json!({
            "data": { "customer_id": "cust-1", "attempt": { "return_to": "https://api.example.com/cb?state=x" } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "connect_url": "https://www.saltedge.com/connect/abc", "expires_at": "2030-01-01T00:00:00Z" }
        })))
        .expect(2)
        .mount(&server)
        .await;

    let saltedge = provider(&server);
    let request = LinkRequest {
        user_id,
        connection_id: Uuid::new_v4(),
        return_to: "https://api.example.com/cb?state=x".to_string(),
    };

    let session = saltedge.initiate_link(&request).await.unwrap();
    assert_eq!(session.redirect_url, "https://www.saltedge.com/connect/abc");
    assert_eq!(session.provider_reference.as_deref(), Some("cust-1"));
    assert!(session.expires_at.is_some());

    saltedge.initiate_link(&request).await.unwrap();
}

#[tokio::test]
async fn test_duplicated_customer_is_looked_up() {
    let server = MockServer::start().await;
    let user_id = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/customers"))
        .respond_with(ResponseTemplate::new(409).set_body_json(error_body("DuplicatedCustomer")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/customers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "id": "cust-other", "identifier": "someone-else" },
                { "id": "cust-7", "identifier": user_id.to_string() }
            ],
            "meta": { "next_id": null }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/connect_sessions/create"))
        .and(body_partial_json(json!({ "data": { "customer_id": "cust-7" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "connect_url": "https://www.saltedge.com/connect/def" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = provider(&server)
        .initiate_link(&LinkRequest {
            user_id,
            connection_id: Uuid::new_v4(),
            return_to: "https://api.example.com/cb".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(session.provider_reference.as_deref(), Some("cust-7"));
}

#[tokio::test]
async fn test_complete_link_reads_connection_and_all_account_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/connections/ext-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "id": "ext-1",
                "secret": "conn-secret",
                "status": "active",
                "last_attempt": { "finished": true },
                "consent_expires_at": "2030-06-01T00:00:00Z"
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/accounts"))
        .and(query_param("connection_id", "ext-1"))
        .and(query_param("from_id", "acc-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "id": "acc-2", "name": "Savings", "nature": "savings", "balance": "2500.00", "currency_code": "EUR" }
            ],
            "meta": { "next_id": null }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/accounts"))
        .and(query_param("connection_id", "ext-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {
                    "id": "acc-1",
                    "name": "Checking",
                    "nature": "account",
                    "balance": 100.50,
                    "currency_code": "EUR",
                    "extra": { "iban": "DE89370400440532013000", "client_name": "Jane Doe", "provider_name": "Demo Bank" }
                }
            ],
            "meta": { "next_id": "acc-2" }
        })))
        .mount(&server)
        .await;

    let completed = provider(&server)
        .complete_link_and_get_accounts("ext-1")
        .await
        .unwrap();

    assert_eq!(completed.status, ProviderConnectionStatus::Active);
    assert_eq!(completed.secret.expose_secret(), "conn-secret");
    assert!(completed.expires_at.is_some());
    assert_eq!(completed.accounts.len(), 2);
    let checking = &completed.accounts[0];
    assert_eq!(checking.external_account_id, "acc-1");
    assert_eq!(checking.balance, Decimal::new(10050, 2));
    assert_eq!(checking.iban.as_deref(), Some("DE89370400440532013000"));
    assert_eq!(checking.bank_name.as_deref(), Some("Demo Bank"));
    assert_eq!(completed.accounts[1].external_account_id, "acc-2");
}

#[tokio::test]
async fn test_unfinished_attempt_is_in_progress() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/connections/ext-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "secret": "s", "status": "active", "last_attempt": { "finished": false } }
        })))
        .mount(&server)
        .await;

    let state = provider(&server)
        .get_connection_status(&handle("ext-2"))
        .await
        .unwrap();

    assert_eq!(state.status, ProviderConnectionStatus::InProgress);
}

#[tokio::test]
async fn test_transactions_are_filtered_and_mapped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transactions"))
        .and(query_param("connection_id", "ext-1"))
        .and(query_param("account_id", "acc-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "id": "tx-old", "made_on": "2024-01-01", "amount": -5, "currency_code": "EUR", "status": "posted" },
                { "id": "tx-1", "made_on": "2024-03-10", "amount": -10.25, "currency_code": "EUR",
                  "description": "Coffee", "status": "posted", "extra": { "payee": "Cafe" } },
                { "id": "tx-2", "made_on": "2024-03-11", "amount": 200, "currency_code": "EUR", "status": "pending" }
            ]
        })))
        .mount(&server)
        .await;

    let transactions = provider(&server)
        .get_transactions(
            &handle("ext-1"),
            "acc-1",
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(transactions.len(), 2);
    assert_eq!(transactions[0].external_transaction_id, "tx-1");
    assert_eq!(transactions[0].amount, Decimal::new(-1025, 2));
    assert_eq!(transactions[0].merchant.as_deref(), Some("Cafe"));
    assert_eq!(transactions[0].status, TransactionStatus::Completed);
    assert_eq!(transactions[1].status, TransactionStatus::Pending);
}

#[tokio::test]
async fn test_error_responses_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/connections/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(error_body("ConnectionNotFound")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/connections/disabled"))
        .respond_with(ResponseTemplate::new(406).set_body_json(error_body("ConnectionDisabled")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/connections/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let saltedge = provider(&server);

    let missing = saltedge
        .get_connection_status(&handle("missing"))
        .await
        .unwrap_err();
    assert_eq!(missing.permanent_kind(), Some(PermanentKind::NotFound));
    assert!(!missing.to_string().contains("must not leak"));

    let disabled = saltedge
        .get_connection_status(&handle("disabled"))
        .await
        .unwrap_err();
    assert_eq!(disabled.permanent_kind(), Some(PermanentKind::Revoked));

    let flaky = saltedge
        .get_connection_status(&handle("flaky"))
        .await
        .unwrap_err();
    assert!(matches!(flaky, ProviderError::Transient(_)));
    assert!(flaky.is_retryable());
}

#[tokio::test]
async fn test_revoke_deletes_remote_connection() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/connections/ext-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "id": "ext-1", "removed": true }
        })))
        .expect(1)
        .mount(&server)
        .await;

    provider(&server)
        .revoke_connection(&handle("ext-1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_sync_account_fetches_transactions_and_balance() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transactions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/accounts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [ { "id": "acc-1", "balance": 42, "currency_code": "EUR" } ]
        })))
        .mount(&server)
        .await;

    let snapshot = provider(&server)
        .sync_account(
            &handle("ext-1"),
            "acc-1",
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        )
        .await
        .unwrap();

    assert!(snapshot.transactions.is_empty());
    assert_eq!(snapshot.balance, Decimal::new(42, 0));
}
