use async_trait::async_trait;
use proccore::{DefinitionError, DefinitionSpec, ProcessDefinition};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Resolves a process type to its validated, shared definition
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    async fn load(&self, process_type: &str) -> Result<Arc<ProcessDefinition>, DefinitionError>;
}

/// Definitions registered in code
#[derive(Default)]
pub struct InMemoryDefinitions {
    definitions: RwLock<HashMap<String, Arc<ProcessDefinition>>>,
}

impl InMemoryDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `spec` and make it available under its id, replacing any
    /// earlier definition of the same type.
    pub async fn register(
        &self,
        spec: DefinitionSpec,
    ) -> Result<Arc<ProcessDefinition>, DefinitionError> {
        let definition = Arc::new(ProcessDefinition::from_spec(spec)?);
        tracing::debug!(process_type = %definition.id(), "registered process definition");
        self.definitions
            .write()
            .await
            .insert(definition.id().to_string(), Arc::clone(&definition));
        Ok(definition)
    }

    pub async fn process_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}

#[async_trait]
impl DefinitionSource for InMemoryDefinitions {
    async fn load(&self, process_type: &str) -> Result<Arc<ProcessDefinition>, DefinitionError> {
        self.definitions
            .read()
            .await
            .get(process_type)
            .cloned()
            .ok_or_else(|| DefinitionError::NotFound(process_type.to_string()))
    }
}

/// Reads `<dir>/<process_type>.json` on first use and keeps the parsed
/// definition for the life of the source.
pub struct DirectoryDefinitions {
    dir: PathBuf,
    loaded: RwLock<HashMap<String, Arc<ProcessDefinition>>>,
}

impl DirectoryDefinitions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            loaded: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read(&self, process_type: &str) -> Result<ProcessDefinition, DefinitionError> {
        if process_type.is_empty()
            || process_type.contains(['/', '\\'])
            || process_type.contains("..")
        {
            return Err(DefinitionError::NotFound(process_type.to_string()));
        }

        let path = self.dir.join(format!("{}.json", process_type));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DefinitionError::NotFound(process_type.to_string()))
            }
            Err(e) => {
                return Err(DefinitionError::Load(format!("{}: {}", path.display(), e)))
            }
        };
        let spec: DefinitionSpec = serde_json::from_str(&text)
            .map_err(|e| DefinitionError::Load(format!("{}: {}", path.display(), e)))?;
        if spec.id != process_type {
            return Err(DefinitionError::Invalid(format!(
                "{} declares id '{}'",
                path.display(),
                spec.id
            )));
        }
        ProcessDefinition::from_spec(spec)
    }
}

#[async_trait]
impl DefinitionSource for DirectoryDefinitions {
    async fn load(&self, process_type: &str) -> Result<Arc<ProcessDefinition>, DefinitionError> {
        if let Some(definition) = self.loaded.read().await.get(process_type) {
            return Ok(Arc::clone(definition));
        }

        let definition = Arc::new(self.read(process_type).await?);
        tracing::info!(
            process_type,
            steps = definition.len(),
            dir = %self.dir.display(),
            "loaded process definition"
        );
        let mut loaded = self.loaded.write().await;
        let entry = loaded
            .entry(process_type.to_string())
            .or_insert_with(|| Arc::clone(&definition));
        Ok(Arc::clone(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proccore::StepSpec;

    fn linear(id: &str) -> DefinitionSpec {
        let mut spec = DefinitionSpec::new(id, "a");
        spec.add_step(StepSpec::new("a"));
        spec.add_step(StepSpec::new("b"));
        spec.connect("a", "b");
        spec
    }

    #[tokio::test]
    async fn registered_definitions_are_shared() {
        let source = InMemoryDefinitions::new();
        source.register(linear("order")).await.unwrap();

        let first = source.load("order").await.unwrap();
        let second = source.load("order").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            source.load("missing").await.unwrap_err(),
            DefinitionError::NotFound("missing".into())
        );
    }

    #[tokio::test]
    async fn directory_source_loads_once() {
        let dir = tempfile::tempdir().unwrap();
        let text = serde_json::to_string(&linear("order")).unwrap();
        std::fs::write(dir.path().join("order.json"), text).unwrap();

        let source = DirectoryDefinitions::new(dir.path());
        let first = source.load("order").await.unwrap();
        std::fs::remove_file(dir.path().join("order.json")).unwrap();
        let second = source.load("order").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn directory_source_rejects_paths_and_mismatched_ids() {
        let dir = tempfile::tempdir().unwrap();
        let text = serde_json::to_string(&linear("other")).unwrap();
        std::fs::write(dir.path().join("order.json"), text).unwrap();

        let source = DirectoryDefinitions::new(dir.path());
        assert!(matches!(
            source.load("../order").await,
            Err(DefinitionError::NotFound(_))
        ));
        assert!(matches!(
            source.load("order").await,
            Err(DefinitionError::Invalid(_))
        ));
    }
}
