//! Per-instance tick loop.
//!
//! A tick takes the instance lock, works on a copy of the record, persists
//! the copy and only then commits it to memory. A failed save therefore
//! leaves both the store and the in-memory record at the last checkpoint.

use crate::coordinator::{fork, ForkResult};
use crate::env::InstanceEnv;
use crate::executor::StepOutcome;
use crate::resolver::{resolve, NextSteps};
use crate::store::StateStore;
use chrono::Utc;
use proccore::{
    Context, EventBus, ExecutionEvent, HistoryEntry, InstanceId, InstanceState, InstanceStatus,
    InstanceSummary, Outcome, ParallelRegion, ProcError, TaskError,
};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Completion result delivered for a waiting step
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeResult {
    /// Merged into the instance context before the next step is resolved
    Success(Context),
    Failure(String),
}

/// Live instance: its record behind the instance lock, plus what is
/// needed to run it.
pub struct InstanceHandle {
    env: Arc<InstanceEnv>,
    state: Mutex<InstanceState>,
}

impl InstanceHandle {
    pub fn new(env: Arc<InstanceEnv>, state: InstanceState) -> Self {
        Self {
            env,
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.env.instance_id
    }

    pub fn env(&self) -> &Arc<InstanceEnv> {
        &self.env
    }

    pub async fn lock(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().await
    }
}

/// Record under construction during one tick, with the status changes to
/// announce once it is committed.
struct Pending {
    state: InstanceState,
    changes: Vec<(InstanceStatus, InstanceStatus)>,
}

impl Pending {
    fn new(state: InstanceState) -> Self {
        Self {
            state,
            changes: Vec::new(),
        }
    }

    fn set(&mut self, status: InstanceStatus) -> Result<(), ProcError> {
        let from = self.state.transition_to(status)?;
        self.changes.push((from, status));
        Ok(())
    }
}

pub struct InstanceScheduler {
    checkpoints: Arc<dyn StateStore>,
    events: Arc<EventBus>,
}

impl InstanceScheduler {
    pub fn new(checkpoints: Arc<dyn StateStore>, events: Arc<EventBus>) -> Self {
        Self {
            checkpoints,
            events,
        }
    }

    /// Tick until the instance waits or reaches a terminal status.
    ///
    /// The lock is released between ticks so resume, cancel and status
    /// reads can interleave with a long run.
    pub async fn drive(&self, handle: &InstanceHandle) -> Result<InstanceSummary, ProcError> {
        loop {
            let mut state = handle.lock().await;
            if state.is_terminal() || state.status == InstanceStatus::Waiting {
                return Ok(state.summary());
            }
            self.tick(handle.env(), &mut state).await?;
        }
    }

    /// One scheduling step: run the active step (or the open parallel
    /// region), resolve what comes next and checkpoint.
    pub async fn tick(
        &self,
        env: &Arc<InstanceEnv>,
        state: &mut InstanceState,
    ) -> Result<(), ProcError> {
        if state.is_terminal() || state.status == InstanceStatus::Waiting {
            return Ok(());
        }

        let mut pending = Pending::new(state.clone());
        if env.cancel.is_cancelled() {
            pending.set(InstanceStatus::Cancelled)?;
            return self.commit(env, state, pending).await;
        }
        if pending.state.status == InstanceStatus::Created {
            pending.set(InstanceStatus::Running)?;
        }

        pending.state.ticks += 1;
        tracing::debug!(
            instance_id = %env.instance_id,
            tick = pending.state.ticks,
            active = ?pending.state.active,
            "tick"
        );

        // An open region runs through the coordinator even when only one
        // branch was taken.
        let result = match pending.state.region.clone() {
            Some(region) => run_region(env, &mut pending, region).await,
            None => run_single(env, &mut pending).await,
        };
        if let Err(error) = result {
            fail(env, &mut pending, error)?;
        }
        if env.cancel.is_cancelled() && !pending.state.is_terminal() {
            pending.set(InstanceStatus::Cancelled)?;
        }

        self.commit(env, state, pending).await
    }

    /// Deliver the completion result of the step a waiting instance is
    /// blocked on. Does not drive the instance further.
    pub async fn resume(
        &self,
        env: &Arc<InstanceEnv>,
        state: &mut InstanceState,
        step: &str,
        result: ResumeResult,
    ) -> Result<(), ProcError> {
        if state.status != InstanceStatus::Waiting {
            return Err(ProcError::InvalidState {
                id: state.id,
                status: state.status,
                operation: "resume",
            });
        }
        let expected = state.waiting_on.clone().unwrap_or_default();
        if expected != step {
            return Err(ProcError::StepMismatch {
                id: state.id,
                expected,
                actual: step.to_string(),
            });
        }
        let current = index_of(env, step)?;

        let mut pending = Pending::new(state.clone());
        pending.set(InstanceStatus::Running)?;
        pending.state.waiting_on = None;
        let attempt = pending
            .state
            .history
            .iter()
            .rev()
            .find(|entry| entry.step == step)
            .map_or(1, |entry| entry.attempt);

        let outcome = match result {
            ResumeResult::Success(data) => {
                tracing::info!(instance_id = %env.instance_id, step, "resumed");
                pending.state.context.deep_merge(data);
                pending
                    .state
                    .history
                    .push(HistoryEntry::new(step, attempt, Outcome::Resumed));
                advance(env, &mut pending, current)
            }
            ResumeResult::Failure(message) => {
                tracing::warn!(instance_id = %env.instance_id, step, message = %message, "resumed with failure");
                pending.state.history.push(HistoryEntry::new(
                    step,
                    attempt,
                    Outcome::ResumedFailure(message.clone()),
                ));
                fail_step(env, &mut pending, current, TaskError::ExecutionFailed(message))
            }
        };
        if let Err(error) = outcome {
            fail(env, &mut pending, error)?;
        }

        self.commit(env, state, pending).await
    }

    /// Move a live instance to Cancelled. Terminal instances are left as
    /// they are.
    pub async fn cancel(
        &self,
        env: &Arc<InstanceEnv>,
        state: &mut InstanceState,
    ) -> Result<(), ProcError> {
        env.cancel.cancel();
        if state.is_terminal() {
            return Ok(());
        }
        let mut pending = Pending::new(state.clone());
        pending.set(InstanceStatus::Cancelled)?;
        tracing::info!(instance_id = %env.instance_id, "instance cancelled");
        self.commit(env, state, pending).await
    }

    async fn commit(
        &self,
        env: &InstanceEnv,
        state: &mut InstanceState,
        mut pending: Pending,
    ) -> Result<(), ProcError> {
        pending.state.updated_at = Utc::now();
        if let Err(e) = self.checkpoints.save(&pending.state).await {
            tracing::error!(
                instance_id = %env.instance_id,
                error = %e,
                "checkpoint failed, keeping last persisted state"
            );
            return Err(ProcError::Store(e));
        }

        *state = pending.state;
        for (from, to) in pending.changes {
            self.events.emit(ExecutionEvent::StatusChanged {
                instance_id: env.instance_id,
                from,
                to,
                timestamp: Utc::now(),
            });
        }
        if state.is_terminal() {
            tracing::info!(
                instance_id = %env.instance_id,
                status = %state.status,
                ticks = state.ticks,
                "instance finished"
            );
        }
        Ok(())
    }
}

async fn run_single(env: &Arc<InstanceEnv>, pending: &mut Pending) -> Result<(), ProcError> {
    let active = pending.state.active.first().cloned().ok_or_else(|| {
        ProcError::Execution(format!("instance {} has no active step", env.instance_id))
    })?;
    let current = index_of(env, &active)?;
    if env.definition.is_terminal(current) {
        return pending.set(InstanceStatus::Completed);
    }

    let run = env.run_step(current, &pending.state.context, &env.cancel).await;
    pending.state.history.extend(run.attempts);

    match run.outcome {
        StepOutcome::Success(context) => {
            pending.state.context = context;
            advance(env, pending, current)
        }
        StepOutcome::Suspended { reason } => {
            tracing::info!(
                instance_id = %env.instance_id,
                step = %active,
                reason = %reason,
                "instance waiting on external event"
            );
            pending.state.waiting_on = Some(active);
            pending.set(InstanceStatus::Waiting)
        }
        // Cancellation during retries is not a step failure.
        StepOutcome::Failure(_) if env.cancel.is_cancelled() => Ok(()),
        StepOutcome::Failure(error) => fail_step(env, pending, current, error),
    }
}

async fn run_region(
    env: &Arc<InstanceEnv>,
    pending: &mut Pending,
    region: ParallelRegion,
) -> Result<(), ProcError> {
    let split = index_of(env, &region.split)?;
    let branches = pending
        .state
        .active
        .iter()
        .map(|id| index_of(env, id))
        .collect::<Result<Vec<_>, _>>()?;

    let report = fork(env, split, &branches, &pending.state.context, &env.cancel).await;
    pending.state.history.extend(report.history);

    match report.result {
        ForkResult::Joined { context, terminals } => {
            pending.state.context = context;
            pending.state.region = None;
            match env.definition.join_for(split) {
                Some(join) => enter(env, pending, join),
                None => {
                    pending.state.active = terminals.into_iter().map(|t| env.step_id(t)).collect();
                    pending.set(InstanceStatus::Completed)
                }
            }
        }
        ForkResult::Failed { branch, error } => {
            tracing::warn!(
                instance_id = %env.instance_id,
                split = %region.split,
                branch = %branch,
                "parallel region failed, branch contexts discarded"
            );
            pending.state.region = None;
            Err(error)
        }
        ForkResult::Cancelled => Ok(()),
    }
}

/// Resolve the successors of `current` and make them active.
fn advance(env: &InstanceEnv, pending: &mut Pending, current: usize) -> Result<(), ProcError> {
    match resolve(&env.definition, current, &pending.state.context)? {
        NextSteps::Terminal => pending.set(InstanceStatus::Completed),
        NextSteps::Single(next) => enter(env, pending, next),
        NextSteps::Fork(branches) => {
            pending.state.active = branches.iter().map(|&b| env.step_id(b)).collect();
            pending.state.region = Some(ParallelRegion {
                split: env.step_id(current),
                join: env.definition.join_for(current).map(|j| env.step_id(j)),
            });
            Ok(())
        }
    }
}

fn enter(env: &InstanceEnv, pending: &mut Pending, index: usize) -> Result<(), ProcError> {
    pending.state.active = vec![env.step_id(index)];
    if env.definition.is_terminal(index) {
        pending.set(InstanceStatus::Completed)?;
    }
    Ok(())
}

/// Hand an exhausted step failure to its failure-transition, or report it.
fn fail_step(
    env: &InstanceEnv,
    pending: &mut Pending,
    current: usize,
    error: TaskError,
) -> Result<(), ProcError> {
    let step = env.definition.step(current);
    match step.on_failure {
        Some(target) => {
            tracing::info!(
                instance_id = %env.instance_id,
                step = %step.id,
                target = %env.step_id(target),
                error = %error,
                "following failure transition"
            );
            env.record_failure(&mut pending.state.context, step, &error);
            enter(env, pending, target)
        }
        None => Err(ProcError::Task {
            step: step.id.clone(),
            source: error,
        }),
    }
}

fn fail(env: &InstanceEnv, pending: &mut Pending, error: ProcError) -> Result<(), ProcError> {
    tracing::error!(
        instance_id = %env.instance_id,
        process_type = %pending.state.process_type,
        active = ?pending.state.active,
        context = ?pending.state.context,
        error = %error,
        "instance failed"
    );
    pending.state.error = Some(error.to_string());
    pending.set(InstanceStatus::Failed)
}

fn index_of(env: &InstanceEnv, id: &str) -> Result<usize, ProcError> {
    env.definition.step_index(id).ok_or_else(|| {
        ProcError::Execution(format!(
            "instance {} references step '{}' missing from '{}'",
            env.instance_id,
            id,
            env.definition.id()
        ))
    })
}
