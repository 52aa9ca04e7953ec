use crate::executor::{ExecutionPolicy, StepRun, TaskExecutor};
use crate::registry::BoundTasks;
use crate::EngineConfig;
use proccore::{
    Context, EventBus, InstanceId, ProcessDefinition, Step, StepId, TaskError, Value,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a line of execution needs to run the steps of one instance:
/// the shared definition, the tasks bound to it, the executor and the
/// instance's cancellation flag.
pub struct InstanceEnv {
    pub instance_id: InstanceId,
    pub definition: Arc<ProcessDefinition>,
    pub tasks: BoundTasks,
    pub executor: TaskExecutor,
    pub config: Arc<EngineConfig>,
    pub events: Arc<EventBus>,
    pub cancel: CancellationToken,
}

impl InstanceEnv {
    pub fn new(
        instance_id: InstanceId,
        definition: Arc<ProcessDefinition>,
        tasks: BoundTasks,
        config: Arc<EngineConfig>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            instance_id,
            definition,
            tasks,
            executor: TaskExecutor::new(Arc::clone(&events)),
            config,
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn step_id(&self, index: usize) -> StepId {
        self.definition.step(index).id.clone()
    }

    /// Run the step at `index` with its effective policy.
    pub async fn run_step(
        &self,
        index: usize,
        context: &Context,
        cancel: &CancellationToken,
    ) -> StepRun {
        let step = self.definition.step(index);
        let policy = ExecutionPolicy::for_step(step, &self.config);
        self.executor
            .execute(
                self.instance_id,
                step,
                self.tasks.get(index),
                context,
                &policy,
                cancel,
            )
            .await
    }

    /// Write the failure a failure-transition is about to handle.
    pub fn record_failure(&self, context: &mut Context, step: &Step, error: &TaskError) {
        let mut detail = BTreeMap::new();
        detail.insert("step".to_string(), Value::from(step.id.as_str()));
        detail.insert("message".to_string(), Value::from(error.to_string()));
        context.insert(self.config.failure_context_key.clone(), Value::Object(detail));
    }
}
