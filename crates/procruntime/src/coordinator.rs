//! Parallel fan-out and fan-in.
//!
//! Each branch of a split runs as its own tokio task on a private copy of
//! the originating context. Branches never see each other's writes; the
//! coordinator waits for every branch and only then merges, so a failed
//! fork never yields a partially merged context.
//!
//! Merge precedence is by declared branch order, not by arrival: keys
//! written by one branch are taken as-is, and where several branches wrote
//! the same key the branch declared later wins (objects are merged key by
//! key with the same rule).

use crate::env::InstanceEnv;
use crate::executor::StepOutcome;
use crate::resolver::{resolve, NextSteps};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use proccore::{Context, ExecutionEvent, HistoryEntry, ProcError, StepId, TaskError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// What a fork produced, plus the attempt history of every branch in
/// declared branch order (kept even when the fork fails).
#[derive(Debug)]
pub struct ForkReport {
    pub history: Vec<HistoryEntry>,
    pub result: ForkResult,
}

#[derive(Debug)]
pub enum ForkResult {
    /// All branches reached the join (or a terminal step)
    Joined {
        context: Context,
        /// Terminal steps reached by branches that did not join
        terminals: Vec<usize>,
    },
    /// First failed branch in declared order
    Failed { branch: StepId, error: ProcError },
    Cancelled,
}

#[derive(Debug)]
struct BranchReport {
    context: Context,
    history: Vec<HistoryEntry>,
    end: BranchEnd,
}

#[derive(Debug)]
enum BranchEnd {
    Joined,
    Finished(Vec<usize>),
    Failed(ProcError),
    Stopped,
}

/// Run `branches` of `split` concurrently and wait for all of them.
///
/// A failing branch stops its siblings from scheduling further steps, but
/// work they already completed is not undone.
pub async fn fork(
    env: &Arc<InstanceEnv>,
    split: usize,
    branches: &[usize],
    origin: &Context,
    parent: &CancellationToken,
) -> ForkReport {
    let definition = &env.definition;
    let join = definition.join_for(split);
    let split_id = definition.step(split).id.clone();
    let labels: Vec<StepId> = branches.iter().map(|&b| env.step_id(b)).collect();

    env.events.emit(ExecutionEvent::ForkOpened {
        instance_id: env.instance_id,
        split: split_id.clone(),
        branches: labels.clone(),
        timestamp: Utc::now(),
    });
    tracing::debug!(
        instance_id = %env.instance_id,
        split = %split_id,
        branches = ?labels,
        "fork opened"
    );

    let started = Instant::now();
    let token = parent.child_token();
    let mut running = FuturesUnordered::new();
    for (order, (&start, label)) in branches.iter().zip(&labels).enumerate() {
        let line = run_branch(
            Arc::clone(env),
            label.clone(),
            start,
            join,
            origin.clone(),
            token.clone(),
        );
        running.push(tokio::spawn(async move { (order, line.await) }));
    }

    let mut reports: Vec<Option<BranchReport>> = branches.iter().map(|_| None).collect();
    let mut lost = None;
    while let Some(joined) = running.next().await {
        match joined {
            Ok((order, report)) => {
                if let BranchEnd::Failed(error) = &report.end {
                    tracing::warn!(
                        instance_id = %env.instance_id,
                        branch = %labels[order],
                        error = %error,
                        "branch failed, stopping siblings"
                    );
                    token.cancel();
                }
                reports[order] = Some(report);
            }
            Err(e) => {
                token.cancel();
                lost.get_or_insert_with(|| format!("branch task did not complete: {}", e));
            }
        }
        if parent.is_cancelled() {
            tracing::debug!(split = %split_id, "cancellation observed between branch completions");
        }
    }

    let mut history = Vec::new();
    let mut contexts = Vec::with_capacity(branches.len());
    let mut terminals = BTreeSet::new();
    let mut failure = None;
    let mut stopped = false;
    for (label, report) in labels.iter().zip(reports) {
        let Some(report) = report else { continue };
        history.extend(report.history);
        match report.end {
            BranchEnd::Joined => contexts.push(report.context),
            BranchEnd::Finished(reached) => {
                terminals.extend(reached);
                contexts.push(report.context);
            }
            BranchEnd::Failed(error) => {
                if failure.is_none() {
                    failure = Some((label.clone(), error));
                }
            }
            BranchEnd::Stopped => stopped = true,
        }
    }

    let result = if let Some((branch, error)) = failure {
        ForkResult::Failed { branch, error }
    } else if let Some(message) = lost {
        ForkResult::Failed {
            branch: split_id.clone(),
            error: ProcError::Execution(message),
        }
    } else if stopped {
        ForkResult::Cancelled
    } else {
        env.events.emit(ExecutionEvent::ForkJoined {
            instance_id: env.instance_id,
            split: split_id.clone(),
            join: join.map(|j| env.step_id(j)),
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
        ForkResult::Joined {
            context: merge_contexts(origin, &contexts),
            terminals: terminals.into_iter().collect(),
        }
    };

    ForkReport { history, result }
}

/// Merge branch contexts onto `origin`, applying each branch's writes in
/// the order given.
pub fn merge_contexts(origin: &Context, branches: &[Context]) -> Context {
    let mut merged = origin.clone();
    for branch in branches {
        merged.deep_merge(branch.changes_since(origin));
    }
    merged
}

/// One execution line: run steps from `start` until the join, a terminal
/// step, a failure, or cancellation. Nested splits fork recursively.
fn run_branch(
    env: Arc<InstanceEnv>,
    label: StepId,
    start: usize,
    join: Option<usize>,
    context: Context,
    token: CancellationToken,
) -> BoxFuture<'static, BranchReport> {
    async move {
        let definition = Arc::clone(&env.definition);
        let mut current = start;
        let mut context = context;
        let mut history = Vec::new();

        let end = loop {
            if Some(current) == join {
                break BranchEnd::Joined;
            }
            if definition.is_terminal(current) {
                break BranchEnd::Finished(vec![current]);
            }
            if token.is_cancelled() {
                break BranchEnd::Stopped;
            }

            let step = definition.step(current);
            let run = env.run_step(current, &context, &token).await;
            history.extend(run.attempts.into_iter().map(|e| e.in_branch(label.clone())));

            match run.outcome {
                StepOutcome::Success(next) => context = next,
                StepOutcome::Suspended { .. } => {
                    break BranchEnd::Failed(ProcError::Task {
                        step: step.id.clone(),
                        source: TaskError::Unsupported(
                            "suspension inside a parallel branch".to_string(),
                        ),
                    });
                }
                StepOutcome::Failure(error) => match step.on_failure {
                    Some(target) => {
                        env.record_failure(&mut context, step, &error);
                        current = target;
                        continue;
                    }
                    None => {
                        break BranchEnd::Failed(ProcError::Task {
                            step: step.id.clone(),
                            source: error,
                        });
                    }
                },
            }

            match resolve(&definition, current, &context) {
                Ok(NextSteps::Single(next)) => current = next,
                Ok(NextSteps::Terminal) => break BranchEnd::Finished(vec![current]),
                Ok(NextSteps::Fork(nested)) => {
                    let report = fork(&env, current, &nested, &context, &token).await;
                    history.extend(report.history);
                    match report.result {
                        ForkResult::Joined {
                            context: merged,
                            terminals,
                        } => {
                            context = merged;
                            match definition.join_for(current) {
                                Some(inner) => current = inner,
                                None => break BranchEnd::Finished(terminals),
                            }
                        }
                        ForkResult::Failed { error, .. } => break BranchEnd::Failed(error),
                        ForkResult::Cancelled => break BranchEnd::Stopped,
                    }
                }
                Err(error) => {
                    tracing::error!(
                        instance_id = %env.instance_id,
                        branch = %label,
                        step = %step.id,
                        context = ?context,
                        error = %error,
                        "transition resolution failed inside branch"
                    );
                    break BranchEnd::Failed(error);
                }
            }
        };

        BranchReport {
            context,
            history,
            end,
        }
    }
    .boxed()
}
