use async_trait::async_trait;
use proccore::{Task, TaskContext, TaskError, TaskOutcome, Value};
use procruntime::{TaskFactory, TaskMetadata};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Fails with a fixed message.
///
/// With `times` set, only the first `times` executions fail; later ones
/// pass the context through. Useful for exercising retry policies and
/// failure transitions.
pub struct FailTask {
    message: String,
    times: Option<u64>,
    calls: AtomicU64,
}

impl FailTask {
    pub fn new(message: impl Into<String>, times: Option<u64>) -> Self {
        Self {
            message: message.into(),
            times,
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Task for FailTask {
    fn task_type(&self) -> &str {
        "control.fail"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.times {
            Some(times) if call > times => TaskOutcome::Success(ctx.into_context()),
            _ => {
                ctx.events.warn(format!("failing on purpose (call {})", call));
                TaskOutcome::failed(self.message.clone())
            }
        }
    }
}

pub struct FailFactory;

impl TaskFactory for FailFactory {
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Arc<dyn Task>, TaskError> {
        let message = crate::config_str(config, "message")?
            .unwrap_or_else(|| "step failed".to_string());
        let times = crate::config_u64(config, "times")?;
        Ok(Arc::new(FailTask::new(message, times)))
    }

    fn task_type(&self) -> &str {
        "control.fail"
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Fail with a configured message".to_string(),
            category: "control".to_string(),
        }
    }
}

/// Suspends the instance until it is resumed from outside
pub struct WaitTask {
    reason: String,
}

impl WaitTask {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Task for WaitTask {
    fn task_type(&self) -> &str {
        "control.wait"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        ctx.events.info(format!("waiting: {}", self.reason));
        TaskOutcome::suspend(self.reason.clone())
    }
}

pub struct WaitFactory;

impl TaskFactory for WaitFactory {
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Arc<dyn Task>, TaskError> {
        let reason = crate::config_str(config, "reason")?
            .unwrap_or_else(|| "external event".to_string());
        Ok(Arc::new(WaitTask::new(reason)))
    }

    fn task_type(&self) -> &str {
        "control.wait"
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Suspend the instance until an external resume".to_string(),
            category: "control".to_string(),
        }
    }
}
