use crate::cache::{CachedStore, InstanceCache, MemoryCache};
use crate::env::InstanceEnv;
use crate::registry::TaskRegistry;
use crate::scheduler::{InstanceHandle, InstanceScheduler, ResumeResult};
use crate::source::{DefinitionSource, InMemoryDefinitions};
use crate::store::{MemoryStore, StateStore};
use crate::EngineConfig;
use chrono::Utc;
use proccore::{
    Context, EventBus, ExecutionEvent, InstanceId, InstanceState, InstanceSummary, ProcError,
    StoreError,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

/// Entry point for creating, driving and controlling process instances.
///
/// Cloning is cheap; clones share the same instances, store and event bus.
#[derive(Clone)]
pub struct ProcessEngine {
    definitions: Arc<dyn DefinitionSource>,
    registry: Arc<TaskRegistry>,
    /// Source of truth used to hydrate instances
    store: Arc<dyn StateStore>,
    /// Write path and status reads; the store behind the cache when one
    /// is configured
    checkpoints: Arc<dyn StateStore>,
    cache: Option<Arc<dyn InstanceCache>>,
    event_bus: Arc<EventBus>,
    config: Arc<EngineConfig>,
    scheduler: Arc<InstanceScheduler>,
    instances: Arc<RwLock<HashMap<InstanceId, Arc<InstanceHandle>>>>,
}

impl ProcessEngine {
    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder::default()
    }

    /// Instantiate `process_type` with `context` as its initial context.
    ///
    /// Every task reference is bound before the instance exists, so an
    /// unknown task fails here rather than mid-run. The new record is
    /// persisted with status Created; nothing runs until the instance is
    /// driven.
    pub async fn create_instance(
        &self,
        process_type: &str,
        context: Context,
    ) -> Result<InstanceId, ProcError> {
        let definition = self.definitions.load(process_type).await?;
        let tasks = self.registry.bind(&definition)?;

        let start = definition.step(definition.start()).id.clone();
        let state = InstanceState::new(process_type, start, context);
        let id = state.id;
        self.checkpoints.save(&state).await?;

        let env = Arc::new(InstanceEnv::new(
            id,
            definition,
            tasks,
            Arc::clone(&self.config),
            Arc::clone(&self.event_bus),
        ));
        self.instances
            .write()
            .await
            .insert(id, Arc::new(InstanceHandle::new(env, state)));

        self.event_bus.emit(ExecutionEvent::InstanceCreated {
            instance_id: id,
            process_type: process_type.to_string(),
            timestamp: Utc::now(),
        });
        tracing::info!(instance_id = %id, process_type, "instance created");
        Ok(id)
    }

    /// Create an instance and drive it until it waits or finishes
    pub async fn start_instance(
        &self,
        process_type: &str,
        context: Context,
    ) -> Result<InstanceSummary, ProcError> {
        let id = self.create_instance(process_type, context).await?;
        self.run_instance(id).await
    }

    /// Drive an instance until it waits or reaches a terminal status.
    ///
    /// Instances not live in this engine are hydrated from the store first,
    /// which makes this the recovery path after a restart or a failed
    /// checkpoint.
    pub async fn run_instance(&self, id: InstanceId) -> Result<InstanceSummary, ProcError> {
        let handle = self.handle(id).await?;
        self.drive(&handle).await
    }

    /// Drive an instance on a background task
    pub fn spawn_instance(&self, id: InstanceId) -> JoinHandle<Result<InstanceSummary, ProcError>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run_instance(id).await })
    }

    /// Current summary, read through the cache. Never takes the instance
    /// lock, so it does not wait for a running tick.
    pub async fn get_status(&self, id: InstanceId) -> Result<InstanceSummary, ProcError> {
        Ok(self.get_state(id).await?.summary())
    }

    /// Full last-checkpointed record, history included
    pub async fn get_state(&self, id: InstanceId) -> Result<InstanceState, ProcError> {
        match self.checkpoints.load(id).await {
            Ok(state) => Ok(state),
            Err(StoreError::NotFound(_)) => Err(ProcError::InstanceNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Deliver the result of the step a waiting instance is blocked on,
    /// then keep driving it.
    pub async fn resume(
        &self,
        id: InstanceId,
        step: &str,
        result: ResumeResult,
    ) -> Result<InstanceSummary, ProcError> {
        let handle = self.handle(id).await?;
        {
            let mut state = handle.lock().await;
            self.scheduler
                .resume(handle.env(), &mut state, step, result)
                .await?;
        }
        self.drive(&handle).await
    }

    /// Request cancellation.
    ///
    /// An attempt already running is allowed to finish; the instance is
    /// marked Cancelled as soon as the current tick releases the lock.
    /// Cancelling a finished instance leaves it untouched.
    pub async fn cancel(&self, id: InstanceId) -> Result<InstanceSummary, ProcError> {
        let handle = self.handle(id).await?;
        handle.env().cancel.cancel();
        let summary = {
            let mut state = handle.lock().await;
            self.scheduler.cancel(handle.env(), &mut state).await?;
            state.summary()
        };
        self.evict(id).await;
        Ok(summary)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn drive(&self, handle: &InstanceHandle) -> Result<InstanceSummary, ProcError> {
        let summary = self.scheduler.drive(handle).await?;
        if summary.status.is_terminal() {
            self.evict(summary.id).await;
        }
        Ok(summary)
    }

    /// Drop a finished instance from the live map and the cache. Later
    /// reads go to the store.
    async fn evict(&self, id: InstanceId) {
        self.instances.write().await.remove(&id);
        if let Some(cache) = &self.cache {
            cache.invalidate(id).await;
        }
    }

    /// Live handle for `id`, hydrated from the store when needed
    async fn handle(&self, id: InstanceId) -> Result<Arc<InstanceHandle>, ProcError> {
        if let Some(handle) = self.instances.read().await.get(&id) {
            return Ok(Arc::clone(handle));
        }

        let state = match self.store.load(id).await {
            Ok(state) => state,
            Err(StoreError::NotFound(_)) => return Err(ProcError::InstanceNotFound(id)),
            Err(e) => return Err(e.into()),
        };
        let definition = self.definitions.load(&state.process_type).await?;
        let tasks = self.registry.bind(&definition)?;
        tracing::info!(
            instance_id = %id,
            process_type = %state.process_type,
            status = %state.status,
            "hydrated instance from store"
        );

        let env = Arc::new(InstanceEnv::new(
            id,
            definition,
            tasks,
            Arc::clone(&self.config),
            Arc::clone(&self.event_bus),
        ));
        let mut instances = self.instances.write().await;
        let handle = instances
            .entry(id)
            .or_insert_with(|| Arc::new(InstanceHandle::new(env, state)));
        Ok(Arc::clone(handle))
    }
}

/// Wires the collaborators of a [`ProcessEngine`].
///
/// Defaults: an empty [`InMemoryDefinitions`], an empty registry, a
/// [`MemoryStore`] and a [`MemoryCache`] using the configured TTL (none when
/// the TTL is zero).
#[derive(Default)]
pub struct ProcessEngineBuilder {
    definitions: Option<Arc<dyn DefinitionSource>>,
    registry: Option<TaskRegistry>,
    store: Option<Arc<dyn StateStore>>,
    cache: Option<Arc<dyn InstanceCache>>,
    without_cache: bool,
    config: Option<EngineConfig>,
}

impl ProcessEngineBuilder {
    pub fn definitions(mut self, definitions: Arc<dyn DefinitionSource>) -> Self {
        self.definitions = Some(definitions);
        self
    }

    pub fn registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn InstanceCache>) -> Self {
        self.cache = Some(cache);
        self.without_cache = false;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self.without_cache = true;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> ProcessEngine {
        let config = Arc::new(self.config.unwrap_or_default());
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn StateStore>);

        let cache = match self.cache {
            Some(cache) => Some(cache),
            None if self.without_cache || config.cache_ttl_ms == 0 => None,
            None => Some(Arc::new(MemoryCache::new(config.cache_ttl())) as Arc<dyn InstanceCache>),
        };
        let checkpoints: Arc<dyn StateStore> = match &cache {
            Some(cache) => Arc::new(CachedStore::new(Arc::clone(&store), Arc::clone(cache))),
            None => Arc::clone(&store),
        };

        ProcessEngine {
            definitions: self
                .definitions
                .unwrap_or_else(|| Arc::new(InMemoryDefinitions::new()) as Arc<dyn DefinitionSource>),
            registry: Arc::new(self.registry.unwrap_or_default()),
            store,
            scheduler: Arc::new(InstanceScheduler::new(
                Arc::clone(&checkpoints),
                Arc::clone(&event_bus),
            )),
            checkpoints,
            cache,
            event_bus,
            config,
            instances: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}
