//! Correlation tokens for the OAuth `state` parameter.
//!
//! A token is `{connection_id}.{nonce}.{expires_at}.{hmac}`. The HMAC and
//! expiry are checked first; the nonce must then match the SHA-256 hash stored
//! on the pending connection row, which is cleared once the callback is used.
//! A token alone is never enough to complete a link.

use crate::error::{BankingError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use service_core::utils::signature::{sign_payload, verify_payload};
use sha2::{Digest, Sha256};
use std::time::Duration;
use subtle::ConstantTimeEq;
use uuid::Uuid;

const NONCE_BYTES: usize = 32;

/// A freshly minted state token and the record to persist with the connection.
#[derive(Debug, Clone)]
pub struct IssuedLinkState {
    pub token: String,
    pub nonce_hash: String,
    pub expires_at: DateTime<Utc>,
}

/// Contents of a token whose signature and expiry have been checked.
#[derive(Debug, Clone)]
pub struct LinkStateClaims {
    pub connection_id: Uuid,
    nonce: String,
    pub expires_at: DateTime<Utc>,
}

impl LinkStateClaims {
    /// Constant-time comparison against the hash stored on the connection.
    pub fn matches_record(&self, stored_hash: &str) -> bool {
        let presented = hash_nonce(&self.nonce);
        presented.len() == stored_hash.len()
            && bool::from(presented.as_bytes().ct_eq(stored_hash.as_bytes()))
    }
}

#[derive(Clone)]
pub struct LinkStateSigner {
    secret: SecretString,
    ttl: Duration,
}

impl LinkStateSigner {
    pub fn new(secret: SecretString, ttl: Duration) -> Self {
        Self { secret, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, connection_id: Uuid) -> Result<IssuedLinkState> {
        let mut raw = [0u8; NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        let nonce = URL_SAFE_NO_PAD.encode(raw);

        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|_| BankingError::Configuration("link state TTL out of range".to_string()))?;
        let expires_at = Utc::now() + ttl;
        let payload = format!("{}.{}.{}", connection_id, nonce, expires_at.timestamp());
        let signature = sign_payload(self.secret.expose_secret().as_bytes(), &payload)
            .map_err(|e| BankingError::Configuration(e.to_string()))?;

        Ok(IssuedLinkState {
            token: format!("{}.{}", payload, signature),
            nonce_hash: hash_nonce(&nonce),
            expires_at,
        })
    }

    /// Check signature and expiry. Says nothing about the server-side record.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<LinkStateClaims> {
        let parts: Vec<&str> = token.split('.').collect();
        let [connection_id, nonce, expires_at, signature] = parts.as_slice() else {
            return Err(BankingError::Correlation("malformed state".to_string()));
        };

        let payload = format!("{}.{}.{}", connection_id, nonce, expires_at);
        let valid = verify_payload(self.secret.expose_secret().as_bytes(), &payload, signature)
            .map_err(|e| BankingError::Configuration(e.to_string()))?;
        if !valid {
            return Err(BankingError::Correlation("state signature mismatch".to_string()));
        }

        let connection_id = Uuid::parse_str(connection_id)
            .map_err(|_| BankingError::Correlation("malformed state".to_string()))?;
        let expires_at = expires_at
            .parse::<i64>()
            .ok()
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .ok_or_else(|| BankingError::Correlation("malformed state".to_string()))?;

        if expires_at <= now {
            return Err(BankingError::Correlation("state expired".to_string()));
        }

        Ok(LinkStateClaims {
            connection_id,
            nonce: nonce.to_string(),
            expires_at,
        })
    }
}

pub fn hash_nonce(nonce: &str) -> String {
    hex::encode(Sha256::digest(nonce.as_bytes()))
}
