//! Configuration module for banking-service.

use crate::error::BankingError;
use crate::models::ProviderKind;
use crate::providers::{ProviderConfig, SaltEdgeConfig, SALTEDGE_API_URL};
use crate::security::{AesGcmCipher, KeyLoader, LinkStateSigner};
use crate::services::SyncSettings;
use crate::workers::SchedulerConfig;
use secrecy::SecretString;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BankingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub saltedge: Option<SaltEdgeSettings>,
    /// Serve this provider kind from the in-process mock adapter.
    pub mock_provider: Option<ProviderKind>,
    pub link: LinkConfig,
    pub security: SecurityConfig,
    pub http: HttpClientConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct SaltEdgeSettings {
    pub api_url: String,
    pub app_id: String,
    pub secret: SecretString,
    pub private_key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Where the provider sends the browser back to (our callback route).
    pub redirect_uri: String,
    /// Where the callback route finally redirects the browser.
    pub app_return_url: String,
    pub state_secret: SecretString,
    pub state_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub config_dir: PathBuf,
    pub secrets_dirs: Vec<PathBuf>,
    /// Base64 AES-256 key for provider secrets at rest.
    pub encryption_key: SecretString,
}

impl SecurityConfig {
    /// Directories private keys may be loaded from.
    pub fn key_bases(&self) -> Vec<PathBuf> {
        std::iter::once(self.config_dir.clone())
            .chain(self.secrets_dirs.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub request_timeout: Duration,
    pub signature_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub workers: usize,
    pub max_retries: u32,
    pub lookback_days: i64,
}

impl BankingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let saltedge = if parse_bool("SALTEDGE_ENABLED", false) {
            Some(SaltEdgeSettings {
                api_url: env::var("SALTEDGE_API_URL").unwrap_or_else(|_| SALTEDGE_API_URL.to_string()),
                app_id: required("SALTEDGE_APP_ID")?,
                secret: SecretString::new(required("SALTEDGE_SECRET")?),
                private_key_path: PathBuf::from(required("SALTEDGE_PRIVATE_KEY_PATH")?),
            })
        } else {
            None
        };

        let mock_provider = match env::var("BANKING_MOCK_PROVIDER") {
            Ok(value) if !value.trim().is_empty() => Some(
                ProviderKind::from_str(value.trim())
                    .ok_or_else(|| config_error(format!("unknown BANKING_MOCK_PROVIDER {}", value)))?,
            ),
            _ => None,
        };

        let secrets_dirs = env::var("BANKING_SECRETS_DIRS")
            .map(|dirs| {
                dirs.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_else(|_| vec![PathBuf::from("secrets")]);

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "banking-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: required("DATABASE_URL")?,
                max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_or("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            saltedge,
            mock_provider,
            link: LinkConfig {
                redirect_uri: required("BANKING_REDIRECT_URI")?,
                app_return_url: env::var("BANKING_APP_RETURN_URL").unwrap_or_else(|_| "/".to_string()),
                state_secret: SecretString::new(required("BANKING_STATE_SECRET")?),
                state_ttl: seconds("BANKING_STATE_TTL_SECONDS", 600)?,
            },
            security: SecurityConfig {
                config_dir: PathBuf::from(
                    env::var("BANKING_CONFIG_DIR").unwrap_or_else(|_| "config".to_string()),
                ),
                secrets_dirs,
                encryption_key: SecretString::new(required("BANKING_ENCRYPTION_KEY")?),
            },
            http: HttpClientConfig {
                request_timeout: seconds("BANKING_REQUEST_TIMEOUT_SECONDS", 30)?,
                signature_ttl: seconds("BANKING_SIGNATURE_TTL_SECONDS", 60)?,
            },
            sync: SyncConfig {
                enabled: parse_bool("BANKING_SYNC_ENABLED", true),
                interval: seconds("BANKING_SYNC_INTERVAL_SECONDS", 3600)?,
                workers: parse_or::<usize>("BANKING_SYNC_WORKERS", 4)?.max(1),
                max_retries: parse_or("BANKING_SYNC_MAX_RETRIES", 3)?,
                lookback_days: parse_or("BANKING_SYNC_LOOKBACK_DAYS", 90)?,
            },
        })
    }

    /// Provider adapters to register. Loads the SaltEdge key through the allow-listed loader.
    pub fn provider_configs(&self) -> Result<Vec<ProviderConfig>, BankingError> {
        let mut configs = Vec::new();

        if let Some(saltedge) = &self.saltedge {
            let loader = KeyLoader::from_current_dir(&self.security.key_bases())?;
            let private_key = loader.load_private_key(&saltedge.private_key_path)?;
            configs.push(ProviderConfig::SaltEdge(SaltEdgeConfig {
                api_url: saltedge.api_url.clone(),
                app_id: saltedge.app_id.clone(),
                secret: saltedge.secret.clone(),
                private_key,
                request_timeout: self.http.request_timeout,
                signature_ttl: self.http.signature_ttl,
                consent_lookback_days: self.sync.lookback_days,
            }));
        }

        if let Some(kind) = self.mock_provider {
            if self.saltedge.is_some() && kind == ProviderKind::SaltEdge {
                return Err(BankingError::Configuration(
                    "BANKING_MOCK_PROVIDER cannot replace an enabled SaltEdge adapter".to_string(),
                ));
            }
            configs.push(ProviderConfig::Mock(kind));
        }

        Ok(configs)
    }

    pub fn cipher(&self) -> Result<AesGcmCipher, BankingError> {
        Ok(AesGcmCipher::from_base64_key(&self.security.encryption_key)?)
    }

    pub fn link_state_signer(&self) -> LinkStateSigner {
        LinkStateSigner::new(self.link.state_secret.clone(), self.link.state_ttl)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            lookback_days: self.sync.lookback_days,
            call_timeout: self.http.request_timeout * 2,
            ..SyncSettings::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            enabled: self.sync.enabled,
            interval: self.sync.interval,
            workers: self.sync.workers,
            max_retries: self.sync.max_retries,
            ..SchedulerConfig::default()
        }
    }
}

fn config_error(message: String) -> AppError {
    AppError::ConfigError(anyhow::anyhow!(message))
}

fn required(key: &str) -> Result<String, AppError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(config_error(format!("{} is required", key))),
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| config_error(format!("{} must be a number, got {:?}", key, value))),
        _ => Ok(default),
    }
}

/// A strictly positive duration in whole seconds.
fn seconds(key: &str, default: u64) -> Result<Duration, AppError> {
    match parse_or(key, default)? {
        0 => Err(config_error(format!("{} must be greater than zero", key))),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
