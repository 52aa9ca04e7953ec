use async_trait::async_trait;
use proccore::{Context, Task, TaskContext, TaskError, TaskOutcome, Value};
use procruntime::{TaskFactory, TaskMetadata};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Deep-merges a fixed object into the context
pub struct SetValuesTask {
    values: Context,
}

impl SetValuesTask {
    pub fn new(values: Context) -> Self {
        Self { values }
    }
}

#[async_trait]
impl Task for SetValuesTask {
    fn task_type(&self) -> &str {
        "context.set"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        let mut context = ctx.into_context();
        context.deep_merge(self.values.clone());
        TaskOutcome::Success(context)
    }
}

pub struct SetValuesFactory;

impl TaskFactory for SetValuesFactory {
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Arc<dyn Task>, TaskError> {
        let values = match config.get("values") {
            Some(Value::Object(values)) => Context::from(values.clone()),
            Some(other) => {
                return Err(TaskError::Configuration(format!(
                    "'values' must be an object, got {}",
                    other.type_name()
                )))
            }
            None => return Err(TaskError::Configuration("Missing config: values".into())),
        };
        Ok(Arc::new(SetValuesTask::new(values)))
    }

    fn task_type(&self) -> &str {
        "context.set"
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Merge fixed values into the context".to_string(),
            category: "context".to_string(),
        }
    }
}
