use proccore::{DefinitionError, ProcessDefinition, Task, TaskError, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Factory trait for creating task instances
pub trait TaskFactory: Send + Sync {
    /// Create a task for one step from that step's configuration
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Arc<dyn Task>, TaskError>;

    /// Get task type identifier
    fn task_type(&self) -> &str;

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata::default()
    }
}

/// Metadata about a task type
#[derive(Debug, Clone)]
pub struct TaskMetadata {
    pub description: String,
    pub category: String,
}

impl Default for TaskMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// Factory handing out one pre-built task for every step that names it
struct SharedTaskFactory {
    task_type: String,
    task: Arc<dyn Task>,
}

impl TaskFactory for SharedTaskFactory {
    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Arc<dyn Task>, TaskError> {
        Ok(self.task.clone())
    }

    fn task_type(&self) -> &str {
        &self.task_type
    }
}

/// Registry mapping task references to executable units
pub struct TaskRegistry {
    factories: HashMap<String, Arc<dyn TaskFactory>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn TaskFactory>) {
        let task_type = factory.task_type().to_string();
        tracing::debug!(task_type = %task_type, "registering task type");
        self.factories.insert(task_type, factory);
    }

    /// Register a ready-made task under `task_type`; every step that
    /// references it shares the same instance.
    pub fn register_task(&mut self, task_type: impl Into<String>, task: Arc<dyn Task>) {
        let task_type = task_type.into();
        self.register(Arc::new(SharedTaskFactory { task_type, task }));
    }

    /// Resolve every step's task reference for a new instance.
    ///
    /// Unknown references and rejected configurations are definition
    /// errors surfaced here, before anything runs.
    pub fn bind(&self, definition: &ProcessDefinition) -> Result<BoundTasks, DefinitionError> {
        let mut tasks = Vec::with_capacity(definition.len());
        for step in definition.steps() {
            let task = match &step.task {
                None => None,
                Some(task_type) => {
                    let factory = self.factories.get(task_type).ok_or_else(|| {
                        DefinitionError::UnknownTask {
                            step: step.id.clone(),
                            task: task_type.clone(),
                        }
                    })?;
                    let task = factory.create(&step.config).map_err(|e| {
                        DefinitionError::InvalidTaskConfig {
                            step: step.id.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    Some(task)
                }
            };
            tasks.push(task);
        }
        Ok(BoundTasks(Arc::new(tasks)))
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.factories.contains_key(task_type)
    }

    /// Registered task types, sorted
    pub fn list_task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, task_type: &str) -> Option<TaskMetadata> {
        self.factories.get(task_type).map(|f| f.metadata())
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Tasks bound to the steps of one definition, indexed like its steps
#[derive(Clone)]
pub struct BoundTasks(Arc<Vec<Option<Arc<dyn Task>>>>);

impl BoundTasks {
    pub fn get(&self, step: usize) -> Option<&Arc<dyn Task>> {
        self.0.get(step).and_then(Option::as_ref)
    }
}
