//! The external provider registry boundary.

use crate::domain::{Provider, ProviderId, ProviderStatus};
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Client contract against the registry service that owns provider
/// records. All queries are best-effort; failures are transient.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn list_providers(&self) -> Result<Vec<Provider>>;
    async fn get_provider(&self, id: &ProviderId) -> Result<Option<Provider>>;
}

/// HTTP implementation against the registry's JSON API.
pub struct HttpRegistryClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRegistryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Registry {
                message: format!("failed to build registry client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn list_providers(&self) -> Result<Vec<Provider>> {
        let url = format!("{}/providers", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Registry {
                message: format!("list_providers request failed: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(BrokerError::Registry {
                message: format!("list_providers returned {}", response.status()),
            });
        }

        response.json().await.map_err(|e| BrokerError::Registry {
            message: format!("list_providers decode failed: {e}"),
        })
    }

    async fn get_provider(&self, id: &ProviderId) -> Result<Option<Provider>> {
        let url = format!("{}/providers/{}", self.base_url, id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Registry {
                message: format!("get_provider request failed: {e}"),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(BrokerError::Registry {
                message: format!("get_provider returned {}", response.status()),
            });
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| BrokerError::Registry {
                message: format!("get_provider decode failed: {e}"),
            })
    }
}

/// In-memory registry for tests and single-node runs.
#[derive(Default)]
pub struct StaticRegistry {
    providers: RwLock<HashMap<ProviderId, Provider>>,
}

impl StaticRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn upsert(&self, provider: Provider) {
        self.providers
            .write()
            .await
            .insert(provider.id.clone(), provider);
    }

    pub async fn set_status(&self, id: &ProviderId, status: ProviderStatus) {
        if let Some(provider) = self.providers.write().await.get_mut(id) {
            provider.status = status;
        }
    }

    pub async fn set_load(&self, id: &ProviderId, load: u32) {
        if let Some(provider) = self.providers.write().await.get_mut(id) {
            provider.current_load = load;
        }
    }

    pub async fn remove(&self, id: &ProviderId) {
        self.providers.write().await.remove(id);
    }
}

#[async_trait]
impl RegistryClient for StaticRegistry {
    async fn list_providers(&self) -> Result<Vec<Provider>> {
        Ok(self.providers.read().await.values().cloned().collect())
    }

    async fn get_provider(&self, id: &ProviderId) -> Result<Option<Provider>> {
        Ok(self.providers.read().await.get(id).cloned())
    }
}
