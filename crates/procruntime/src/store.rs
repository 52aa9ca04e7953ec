use async_trait::async_trait;
use proccore::{InstanceId, InstanceState, StoreError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Durable home of instance records.
///
/// `save` overwrites the previous checkpoint for the same id. Implementations
/// must make a save atomic: after a failed save, `load` still returns the
/// last successful checkpoint.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, state: &InstanceState) -> Result<(), StoreError>;

    async fn load(&self, id: InstanceId) -> Result<InstanceState, StoreError>;

    /// Ids of every stored instance
    async fn list(&self) -> Result<Vec<InstanceId>, StoreError>;
}

/// In-process store, lost on restart
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<InstanceId, InstanceState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, state: &InstanceState) -> Result<(), StoreError> {
        self.records.write().await.insert(state.id, state.clone());
        Ok(())
    }

    async fn load(&self, id: InstanceId) -> Result<InstanceState, StoreError> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list(&self) -> Result<Vec<InstanceId>, StoreError> {
        Ok(self.records.read().await.keys().copied().collect())
    }
}

/// One JSON file per instance under a directory.
///
/// Records are written to `<id>.json.tmp` and renamed over `<id>.json`, so a
/// crash mid-write leaves the previous checkpoint intact.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            StoreError::Unavailable(format!("cannot create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: InstanceId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn save(&self, state: &InstanceState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let target = self.path_for(state.id);
        let staging = self.dir.join(format!("{}.json.tmp", state.id));

        tokio::fs::write(&staging, &bytes)
            .await
            .map_err(|e| StoreError::Unavailable(format!("write {}: {}", staging.display(), e)))?;
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|e| StoreError::Unavailable(format!("rename {}: {}", target.display(), e)))?;

        tracing::trace!(instance_id = %state.id, path = %target.display(), "checkpoint written");
        Ok(())
    }

    async fn load(&self, id: InstanceId) -> Result<InstanceState, StoreError> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id))
            }
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    async fn list(&self) -> Result<Vec<InstanceId>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
        {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(id) = stem.parse::<InstanceId>() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
