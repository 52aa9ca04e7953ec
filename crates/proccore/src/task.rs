use crate::{events::EventEmitter, Context, InstanceId, StepId, TaskError, Value};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Unit of work behind a step
#[async_trait]
pub trait Task: Send + Sync {
    /// Type identifier the registry knows the task by (e.g. "debug.log")
    fn task_type(&self) -> &str;

    /// Run against an owned copy of the instance context and return the
    /// context to keep, a failure, or a request to suspend the instance.
    async fn execute(&self, ctx: TaskContext) -> TaskOutcome;
}

/// Result of one task attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(Context),
    Failure(TaskError),
    Timeout,
    /// Blocked on an external event; the instance waits for a resume call
    Suspend { reason: String },
}

impl TaskOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskOutcome::Failure(TaskError::ExecutionFailed(message.into()))
    }

    pub fn suspend(reason: impl Into<String>) -> Self {
        TaskOutcome::Suspend {
            reason: reason.into(),
        }
    }
}

impl From<Result<Context, TaskError>> for TaskOutcome {
    fn from(result: Result<Context, TaskError>) -> Self {
        match result {
            Ok(context) => TaskOutcome::Success(context),
            Err(TaskError::Timeout { .. }) => TaskOutcome::Timeout,
            Err(e) => TaskOutcome::Failure(e),
        }
    }
}

/// Execution context passed to each task attempt
#[derive(Clone)]
pub struct TaskContext {
    pub instance_id: InstanceId,
    pub step_id: StepId,
    /// 1-based attempt number
    pub attempt: u32,

    /// Owned copy of the instance context
    pub context: Context,

    /// Static configuration from the step definition
    pub config: BTreeMap<String, Value>,

    pub events: EventEmitter,

    /// Cancelled when the instance is cancelled or the attempt times out
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(instance_id: InstanceId, step_id: impl Into<StepId>, events: EventEmitter) -> Self {
        Self {
            instance_id,
            step_id: step_id.into(),
            attempt: 1,
            context: Context::new(),
            config: BTreeMap::new(),
            events,
            cancellation: CancellationToken::new(),
        }
    }

    /// Get a required context value or return error
    pub fn require(&self, key: &str) -> Result<&Value, TaskError> {
        self.context
            .get_path(key)
            .ok_or_else(|| TaskError::MissingInput(key.to_string()))
    }

    pub fn require_config(&self, name: &str) -> Result<&Value, TaskError> {
        self.config
            .get(name)
            .ok_or_else(|| TaskError::Configuration(format!("Missing config: {}", name)))
    }

    pub fn config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }

    pub fn into_context(self) -> Context {
        self.context
    }
}
