//! Provider construction and lookup.

use super::{BankingProvider, MockBankingProvider, SaltEdgeConfig, SaltEdgeProvider};
use crate::error::{BankingError, ProviderError, Result};
use crate::models::ProviderKind;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Adapter settings, one variant per concrete adapter.
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    SaltEdge(SaltEdgeConfig),
    /// Scripted adapter registered under the given kind.
    Mock(ProviderKind),
}

/// Construct the adapter a config describes.
pub fn build_provider(config: ProviderConfig) -> Result<Arc<dyn BankingProvider>> {
    match config {
        ProviderConfig::SaltEdge(config) => Ok(Arc::new(SaltEdgeProvider::new(config)?)),
        ProviderConfig::Mock(kind) => {
            warn!(provider = %kind, "Using scripted mock banking provider");
            Ok(Arc::new(MockBankingProvider::demo(kind)))
        }
    }
}

/// Adapters available to this process, keyed by provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn BankingProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: Vec<ProviderConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(build_provider(config)?);
        }
        Ok(registry)
    }

    /// Add or replace the adapter for its kind.
    pub fn register(&mut self, provider: Arc<dyn BankingProvider>) {
        let kind = provider.kind();
        info!(provider = %kind, "Registered banking provider");
        self.providers.insert(kind, provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn BankingProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| BankingError::ProviderUnavailable(kind.to_string()))
    }

    pub fn is_available(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    pub fn available(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }

    /// Check every adapter's credentials; failures are reported, not fatal.
    pub async fn authenticate_all(&self) -> Vec<(ProviderKind, std::result::Result<(), ProviderError>)> {
        let mut results = Vec::with_capacity(self.providers.len());
        for kind in self.available() {
            if let Some(provider) = self.providers.get(&kind) {
                let outcome = provider.authenticate().await;
                if let Err(e) = &outcome {
                    warn!(provider = %kind, code = e.code(), "Provider authentication failed");
                }
                results.push((kind, outcome));
            }
        }
        results
    }
}
