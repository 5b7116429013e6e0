//! Authenticated encryption of connection secrets at rest.

use crate::error::EncryptionError;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use secrecy::{ExposeSecret, Secret, SecretString};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const VERSION_PREFIX: &str = "v1:";

/// Encrypts provider secrets before they reach the store.
///
/// Async so a KMS-backed implementation can stand in for the local cipher.
#[async_trait]
pub trait SecretCipher: Send + Sync {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<String, EncryptionError>;

    async fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, EncryptionError>;

    async fn encrypt_secret(&self, secret: &SecretString) -> Result<String, EncryptionError> {
        self.encrypt(secret.expose_secret().as_bytes()).await
    }

    async fn decrypt_secret(&self, ciphertext: &str) -> Result<SecretString, EncryptionError> {
        let bytes = self.decrypt(ciphertext).await?;
        String::from_utf8(bytes)
            .map(Secret::new)
            .map_err(|_| EncryptionError::Malformed("plaintext is not UTF-8"))
    }
}

/// AES-256-GCM with a random nonce per message.
///
/// Output is `v1:` followed by base64 of `nonce || ciphertext || tag`.
#[derive(Clone)]
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &SecretString) -> Result<Self, EncryptionError> {
        let bytes = STANDARD
            .decode(encoded.expose_secret().trim())
            .map_err(|_| EncryptionError::InvalidKey("key is not valid base64".to_string()))?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            EncryptionError::InvalidKey(format!("key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::new(&key))
    }
}

#[async_trait]
impl SecretCipher for AesGcmCipher {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<String, EncryptionError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| EncryptionError::EncryptFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", VERSION_PREFIX, STANDARD.encode(out)))
    }

    async fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, EncryptionError> {
        let encoded = ciphertext
            .strip_prefix(VERSION_PREFIX)
            .ok_or(EncryptionError::Malformed("unknown ciphertext version"))?;
        let data = STANDARD
            .decode(encoded)
            .map_err(|_| EncryptionError::Malformed("ciphertext is not valid base64"))?;

        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(EncryptionError::Malformed("ciphertext too short"));
        }

        let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| EncryptionError::Authentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> AesGcmCipher {
        AesGcmCipher::new(&[7u8; 32])
    }

    #[tokio::test]
    async fn test_round_trip() {
        let cipher = cipher();
        for plaintext in [&b""[..], &b"token"[..], &[0u8, 255, 1, 254][..], &[42u8; 4096][..]] {
            let sealed = cipher.encrypt(plaintext).await.unwrap();
            assert!(sealed.starts_with("v1:"));
            assert_eq!(cipher.decrypt(&sealed).await.unwrap(), plaintext);
        }
    }

    #[tokio::test]
    async fn test_nonce_is_fresh_per_message() {
        let cipher = cipher();
        let a = cipher.encrypt(b"same").await.unwrap();
        let b = cipher.encrypt(b"same").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_bit_flip_is_detected() {
        let cipher = cipher();
        let sealed = cipher.encrypt(b"provider-secret").await.unwrap();
        let mut raw = STANDARD.decode(&sealed[3..]).unwrap();

        for index in [0, NONCE_LEN, raw.len() - 1] {
            let mut flipped = raw.clone();
            flipped[index] ^= 0x01;
            let tampered = format!("v1:{}", STANDARD.encode(&flipped));
            assert!(matches!(
                cipher.decrypt(&tampered).await,
                Err(EncryptionError::Authentication)
            ));
        }

        raw.truncate(NONCE_LEN + 4);
        let truncated = format!("v1:{}", STANDARD.encode(&raw));
        assert!(matches!(
            cipher.decrypt(&truncated).await,
            Err(EncryptionError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let sealed = cipher().encrypt(b"provider-secret").await.unwrap();
        let other = AesGcmCipher::new(&[8u8; 32]);
        assert!(matches!(
            other.decrypt(&sealed).await,
            Err(EncryptionError::Authentication)
        ));
    }

    #[tokio::test]
    async fn test_unversioned_input_is_rejected() {
        assert!(matches!(
            cipher().decrypt("plain-text-secret").await,
            Err(EncryptionError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_secret_helpers() {
        let cipher = cipher();
        let sealed = cipher
            .encrypt_secret(&Secret::new("conn-secret".to_string()))
            .await
            .unwrap();
        assert!(!sealed.contains("conn-secret"));
        let opened = cipher.decrypt_secret(&sealed).await.unwrap();
        assert_eq!(opened.expose_secret(), "conn-secret");
    }

    #[test]
    fn test_key_parsing() {
        let encoded = Secret::new(STANDARD.encode([1u8; 32]));
        assert!(AesGcmCipher::from_base64_key(&encoded).is_ok());

        let short = Secret::new(STANDARD.encode([1u8; 16]));
        assert!(matches!(
            AesGcmCipher::from_base64_key(&short),
            Err(EncryptionError::InvalidKey(_))
        ));
    }
}
