//! Read-through view of registered providers.
//!
//! Inventory queries always hit the registry; point lookups are served
//! from a short-TTL cache with transparent refresh on staleness. The
//! directory does no ranking.

pub mod registry;

use crate::domain::{AvailabilityFilter, Provider, ProviderId};
use crate::error::Result;
use lru::LruCache;
use registry::RegistryClient;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const CACHE_CAPACITY: usize = 512;

struct CachedProvider {
    provider: Provider,
    fetched_at: Instant,
}

pub struct ProviderDirectory {
    registry: Arc<dyn RegistryClient>,
    cache: Mutex<LruCache<ProviderId, CachedProvider>>,
    ttl: Duration,
}

impl ProviderDirectory {
    pub fn new(registry: Arc<dyn RegistryClient>, ttl: Duration) -> Self {
        Self {
            registry,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
            ttl,
        }
    }

    /// Providers that are Idle with at least one healthy GPU matching the
    /// filter. Fresh registry lookup per query; the cache is refreshed as
    /// a side effect.
    pub async fn list_available(&self, filter: &AvailabilityFilter) -> Result<Vec<Provider>> {
        let providers = self.registry.list_providers().await?;

        let now = Instant::now();
        {
            let mut cache = self.cache.lock().await;
            for provider in &providers {
                cache.put(
                    provider.id.clone(),
                    CachedProvider {
                        provider: provider.clone(),
                        fetched_at: now,
                    },
                );
            }
        }

        Ok(providers
            .into_iter()
            .filter(|p| p.matches(filter))
            .collect())
    }

    /// Point lookup, served from cache while fresh.
    pub async fn get_by_id(&self, id: &ProviderId) -> Result<Option<Provider>> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(id) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(Some(cached.provider.clone()));
                }
                cache.pop(id);
            }
        }

        let provider = self.registry.get_provider(id).await?;
        if let Some(provider) = &provider {
            self.cache.lock().await.put(
                id.clone(),
                CachedProvider {
                    provider: provider.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        Ok(provider)
    }

    /// Dispatch-failure hint from the scheduler: drop any cached record so
    /// the next lookup refetches.
    pub async fn mark_stale(&self, id: &ProviderId) {
        debug!(provider = %id, "invalidating cached provider record");
        self.cache.lock().await.pop(id);
    }
}
