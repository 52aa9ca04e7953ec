use crate::store::StateStore;
use async_trait::async_trait;
use proccore::{InstanceId, InstanceState, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Read-through cache in front of a [`StateStore`].
///
/// A cache never decides what is true: misses and stale entries fall back
/// to the store, and every successful save refreshes the entry.
#[async_trait]
pub trait InstanceCache: Send + Sync {
    async fn get(&self, id: InstanceId) -> Option<InstanceState>;

    async fn put(&self, state: &InstanceState);

    async fn invalidate(&self, id: InstanceId);
}

/// Process-local cache with a fixed entry lifetime
pub struct MemoryCache {
    entries: RwLock<HashMap<InstanceId, (Instant, InstanceState)>>,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Drop every expired entry
    pub async fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .write()
            .await
            .retain(|_, (stored, _)| stored.elapsed() < ttl);
    }
}

#[async_trait]
impl InstanceCache for MemoryCache {
    async fn get(&self, id: InstanceId) -> Option<InstanceState> {
        {
            let entries = self.entries.read().await;
            match entries.get(&id) {
                Some((stored, state)) if stored.elapsed() < self.ttl => {
                    return Some(state.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: drop it unless a save refreshed it in the meantime.
        let mut entries = self.entries.write().await;
        if entries
            .get(&id)
            .is_some_and(|(stored, _)| stored.elapsed() >= self.ttl)
        {
            entries.remove(&id);
        }
        None
    }

    async fn put(&self, state: &InstanceState) {
        let ttl = self.ttl;
        let mut entries = self.entries.write().await;
        entries.retain(|_, (stored, _)| stored.elapsed() < ttl);
        entries.insert(state.id, (Instant::now(), state.clone()));
    }

    async fn invalidate(&self, id: InstanceId) {
        self.entries.write().await.remove(&id);
    }
}

/// A store that keeps `cache` in step with every save
pub struct CachedStore {
    store: Arc<dyn StateStore>,
    cache: Arc<dyn InstanceCache>,
}

impl CachedStore {
    pub fn new(store: Arc<dyn StateStore>, cache: Arc<dyn InstanceCache>) -> Self {
        Self { store, cache }
    }
}

#[async_trait]
impl StateStore for CachedStore {
    async fn save(&self, state: &InstanceState) -> Result<(), StoreError> {
        match self.store.save(state).await {
            Ok(()) => {
                self.cache.put(state).await;
                Ok(())
            }
            Err(e) => {
                self.cache.invalidate(state.id).await;
                Err(e)
            }
        }
    }

    async fn load(&self, id: InstanceId) -> Result<InstanceState, StoreError> {
        if let Some(state) = self.cache.get(id).await {
            return Ok(state);
        }
        let state = self.store.load(id).await?;
        self.cache.put(&state).await;
        Ok(state)
    }

    async fn list(&self) -> Result<Vec<InstanceId>, StoreError> {
        self.store.list().await
    }
}
