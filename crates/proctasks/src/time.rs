use async_trait::async_trait;
use proccore::{Task, TaskContext, TaskError, TaskOutcome, Value};
use procruntime::{TaskFactory, TaskMetadata};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Waits for a fixed duration, then passes the context through.
/// Stops early with `Cancelled` when the attempt is cancelled.
pub struct DelayTask {
    delay: Duration,
}

impl DelayTask {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Task for DelayTask {
    fn task_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        ctx.events
            .info(format!("Delaying for {}ms", self.delay.as_millis()));

        let cancel = ctx.cancellation.clone();
        tokio::select! {
            _ = cancel.cancelled() => TaskOutcome::Failure(TaskError::Cancelled),
            _ = sleep(self.delay) => TaskOutcome::Success(ctx.into_context()),
        }
    }
}

pub struct DelayFactory;

impl TaskFactory for DelayFactory {
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Arc<dyn Task>, TaskError> {
        // Default to 1 second if not specified
        let delay_ms = crate::config_u64(config, "delay_ms")?.unwrap_or(1000);
        Ok(Arc::new(DelayTask::new(Duration::from_millis(delay_ms))))
    }

    fn task_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
        }
    }
}
