//! RSA request signing for providers that require signed API calls.
//!
//! The SaltEdge scheme signs `"{expires_at}|{METHOD}|{url}|{body}"` with
//! RSASSA-PKCS1-v1_5 over SHA-256 and sends the base64 signature alongside
//! the app credentials and the expiry.

use crate::error::{BankingError, ProviderError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

/// Upper bound on signature lifetime.
pub const MAX_SIGNATURE_TTL: Duration = Duration::from_secs(300);

/// Request fields covered by the signature.
#[derive(Debug, Clone, Copy)]
pub struct CanonicalRequest<'a> {
    pub method: &'a str,
    /// Full URL, including the query string.
    pub url: &'a str,
    /// Raw body exactly as sent; empty for bodiless requests.
    pub body: &'a str,
}

impl CanonicalRequest<'_> {
    pub fn signing_string(&self, expires_at: i64) -> String {
        format!(
            "{}|{}|{}|{}",
            expires_at,
            self.method.to_ascii_uppercase(),
            self.url,
            self.body
        )
    }
}

/// Headers attached to one outbound call.
#[derive(Clone)]
pub struct SignedHeaders {
    pub app_id: String,
    pub secret: SecretString,
    pub expires_at: i64,
    pub signature: String,
}

impl std::fmt::Debug for SignedHeaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedHeaders")
            .field("app_id", &self.app_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl SignedHeaders {
    pub fn to_header_map(&self) -> Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        let entries = [
            ("app-id", self.app_id.clone()),
            ("secret", self.secret.expose_secret().clone()),
            ("expires-at", self.expires_at.to_string()),
            ("signature", self.signature.clone()),
        ];
        for (name, value) in entries {
            let mut value = HeaderValue::from_str(&value)
                .map_err(|_| ProviderError::Signing(format!("invalid {} header value", name)))?;
            if name == "secret" || name == "signature" {
                value.set_sensitive(true);
            }
            headers.insert(HeaderName::from_static(name), value);
        }
        Ok(headers)
    }
}

/// Signs requests with a provider private key held in memory.
#[derive(Clone)]
pub struct RequestSigner {
    signing_key: SigningKey<Sha256>,
    app_id: String,
    secret: SecretString,
    ttl: Duration,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("app_id", &self.app_id)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    /// Parse a PKCS#8 or PKCS#1 PEM key.
    pub fn from_pem(
        pem: &SecretString,
        app_id: impl Into<String>,
        secret: SecretString,
        ttl: Duration,
    ) -> Result<Self, BankingError> {
        let pem = pem.expose_secret();
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|_| BankingError::MalformedKey("not an RSA private key".to_string()))?;

        Ok(Self::from_key(key, app_id, secret, ttl))
    }

    pub fn from_key(
        key: RsaPrivateKey,
        app_id: impl Into<String>,
        secret: SecretString,
        ttl: Duration,
    ) -> Self {
        Self {
            signing_key: SigningKey::<Sha256>::new(key),
            app_id: app_id.into(),
            secret,
            ttl: ttl.min(MAX_SIGNATURE_TTL),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign with a fresh expiry of `now + ttl`.
    pub fn sign(&self, request: &CanonicalRequest<'_>) -> Result<SignedHeaders, ProviderError> {
        let expires_at = Utc::now().timestamp() + self.ttl.as_secs() as i64;
        self.sign_with_expiry(request, expires_at)
    }

    /// Deterministic for identical inputs.
    pub fn sign_with_expiry(
        &self,
        request: &CanonicalRequest<'_>,
        expires_at: i64,
    ) -> Result<SignedHeaders, ProviderError> {
        let payload = request.signing_string(expires_at);
        let signature = self
            .signing_key
            .try_sign(payload.as_bytes())
            .map_err(|_| ProviderError::Signing("RSA signature could not be produced".to_string()))?;

        Ok(SignedHeaders {
            app_id: self.app_id.clone(),
            secret: self.secret.clone(),
            expires_at,
            signature: STANDARD.encode(signature.to_bytes()),
        })
    }
}
