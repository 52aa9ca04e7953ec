use async_trait::async_trait;
use proccore::{Task, TaskContext, TaskError, TaskOutcome, Value};
use procruntime::{TaskFactory, TaskMetadata};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Logs a message and the current context, then passes it through
pub struct LogTask {
    message: Option<String>,
}

impl LogTask {
    pub fn new(message: Option<String>) -> Self {
        Self { message }
    }
}

#[async_trait]
impl Task for LogTask {
    fn task_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        let message = self.message.as_deref().unwrap_or("(no message)");
        tracing::info!(instance_id = %ctx.instance_id, step = %ctx.step_id, "{}", message);
        ctx.events.info(format!("DEBUG: {}", message));

        for (key, value) in ctx.context.iter() {
            ctx.events.info(format!("  {}: {}", key, value.to_json()));
        }

        TaskOutcome::Success(ctx.into_context())
    }
}

pub struct LogFactory;

impl TaskFactory for LogFactory {
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Arc<dyn Task>, TaskError> {
        Ok(Arc::new(LogTask::new(crate::config_str(config, "message")?)))
    }

    fn task_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Logs a message and the context for debugging".to_string(),
            category: "debug".to_string(),
        }
    }
}
