use crate::EngineConfig;
use chrono::Utc;
use proccore::{
    Context, EventBus, ExecutionEvent, HistoryEntry, InstanceId, Outcome, RetryPolicy, Step, Task,
    TaskContext, TaskError, TaskOutcome,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Timeout and retry settings applied to one step
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPolicy {
    pub retry: RetryPolicy,
    /// Per-attempt deadline; `None` is unbounded
    pub timeout: Option<Duration>,
}

impl ExecutionPolicy {
    /// Step overrides win over the engine defaults.
    pub fn for_step(step: &Step, config: &EngineConfig) -> Self {
        Self {
            retry: step
                .retry
                .clone()
                .unwrap_or_else(|| config.default_retry.clone()),
            timeout: step
                .timeout_ms
                .map(Duration::from_millis)
                .or_else(|| config.default_timeout()),
        }
    }
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::none(),
            timeout: None,
        }
    }
}

/// Final result of running a step with its policy
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(Context),
    /// Retries exhausted; carries the last error
    Failure(TaskError),
    Suspended { reason: String },
}

#[derive(Debug, Clone)]
pub struct StepRun {
    pub outcome: StepOutcome,
    /// One entry per attempt, in order
    pub attempts: Vec<HistoryEntry>,
}

/// Runs a step's task with timeout and retry handling
#[derive(Clone)]
pub struct TaskExecutor {
    event_bus: Arc<EventBus>,
}

impl TaskExecutor {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self { event_bus }
    }

    /// Execute `step` against a copy of `context`.
    ///
    /// Failures and timeouts are retried per `policy`; success and
    /// suspension end the step immediately. Once `cancel` fires no further
    /// attempt starts, though an attempt already running is left to finish.
    pub async fn execute(
        &self,
        instance_id: InstanceId,
        step: &Step,
        task: Option<&Arc<dyn Task>>,
        context: &Context,
        policy: &ExecutionPolicy,
        cancel: &CancellationToken,
    ) -> StepRun {
        let max_attempts = policy.retry.attempts();
        let mut attempts = Vec::new();
        let mut last_error = TaskError::Cancelled;

        for attempt in 1..=max_attempts {
            self.event_bus.emit(ExecutionEvent::StepStarted {
                instance_id,
                step: step.id.clone(),
                attempt,
                timestamp: Utc::now(),
            });
            tracing::debug!(instance_id = %instance_id, step = %step.id, attempt, "running step");

            let started = Instant::now();
            let outcome = self
                .attempt(instance_id, step, task, context, attempt, policy, cancel)
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let error = match outcome {
                TaskOutcome::Success(context) => {
                    attempts.push(HistoryEntry::new(step.id.clone(), attempt, Outcome::Success));
                    self.event_bus.emit(ExecutionEvent::StepCompleted {
                        instance_id,
                        step: step.id.clone(),
                        attempt,
                        duration_ms,
                        timestamp: Utc::now(),
                    });
                    return StepRun {
                        outcome: StepOutcome::Success(context),
                        attempts,
                    };
                }
                TaskOutcome::Suspend { reason } => {
                    attempts.push(HistoryEntry::new(
                        step.id.clone(),
                        attempt,
                        Outcome::Suspended(reason.clone()),
                    ));
                    self.event_bus.emit(ExecutionEvent::StepSuspended {
                        instance_id,
                        step: step.id.clone(),
                        reason: reason.clone(),
                        timestamp: Utc::now(),
                    });
                    return StepRun {
                        outcome: StepOutcome::Suspended { reason },
                        attempts,
                    };
                }
                TaskOutcome::Failure(error) => {
                    attempts.push(HistoryEntry::new(
                        step.id.clone(),
                        attempt,
                        Outcome::Failure(error.to_string()),
                    ));
                    error
                }
                TaskOutcome::Timeout => {
                    attempts.push(HistoryEntry::new(step.id.clone(), attempt, Outcome::Timeout));
                    TaskError::Timeout {
                        millis: policy.timeout.map_or(0, |t| t.as_millis() as u64),
                    }
                }
            };

            let will_retry = attempt < max_attempts && !cancel.is_cancelled();
            tracing::warn!(
                instance_id = %instance_id,
                step = %step.id,
                attempt,
                max_attempts,
                will_retry,
                error = %error,
                "step attempt failed"
            );
            self.event_bus.emit(ExecutionEvent::StepFailed {
                instance_id,
                step: step.id.clone(),
                attempt,
                error: error.to_string(),
                will_retry,
                timestamp: Utc::now(),
            });
            last_error = error;

            if !will_retry {
                break;
            }
            let delay = policy.retry.delay_after(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        StepRun {
            outcome: StepOutcome::Failure(last_error),
            attempts,
        }
    }

    /// One attempt. The task runs on its own tokio task so an expired
    /// deadline only detaches it; the attempt token is cancelled to ask it
    /// to stop.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        instance_id: InstanceId,
        step: &Step,
        task: Option<&Arc<dyn Task>>,
        context: &Context,
        attempt: u32,
        policy: &ExecutionPolicy,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        // Steps without a task pass the context through.
        let Some(task) = task else {
            return TaskOutcome::Success(context.clone());
        };

        let attempt_token = cancel.child_token();
        let ctx = TaskContext {
            instance_id,
            step_id: step.id.clone(),
            attempt,
            context: context.clone(),
            config: step.config.clone(),
            events: self.event_bus.create_emitter(instance_id, step.id.clone()),
            cancellation: attempt_token.clone(),
        };
        let task = Arc::clone(task);
        let handle = tokio::spawn(async move { task.execute(ctx).await });

        let joined = match policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    attempt_token.cancel();
                    return TaskOutcome::Timeout;
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(outcome) => outcome,
            Err(e) => TaskOutcome::Failure(TaskError::ExecutionFailed(format!(
                "task did not run to completion: {}",
                e
            ))),
        }
    }
}
