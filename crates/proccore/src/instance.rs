use crate::{Context, ProcError, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type InstanceId = Uuid;

/// Lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Created,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Completed, Failed and Cancelled instances are read-only.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Cancelled)
                | (Running, Waiting)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Waiting, Running)
                | (Waiting, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Created => "created",
            InstanceStatus::Running => "running",
            InstanceStatus::Waiting => "waiting",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded for one attempt (or one external resume) of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure(String),
    Timeout,
    Suspended(String),
    Resumed,
    ResumedFailure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::Resumed)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::Failure(_) | Outcome::Timeout | Outcome::ResumedFailure(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: StepId,
    pub attempt: u32,
    pub outcome: Outcome,
    /// First step of the parallel branch that produced this entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<StepId>,
    pub at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(step: impl Into<StepId>, attempt: u32, outcome: Outcome) -> Self {
        Self {
            step: step.into(),
            attempt,
            outcome,
            branch: None,
            at: Utc::now(),
        }
    }

    pub fn in_branch(mut self, branch: impl Into<StepId>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

/// Open parallel region: the split that fanned out and the join its
/// branches wait at (none when they end at terminal steps).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelRegion {
    pub split: StepId,
    pub join: Option<StepId>,
}

/// Persisted per-instance record.
///
/// The owning reference to the shared definition lives next to this record
/// in the runtime; the record itself carries the process type so it can be
/// re-attached after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub id: InstanceId,
    pub process_type: String,
    pub status: InstanceStatus,
    /// Current step, or the branch steps while a parallel region is open
    pub active: Vec<StepId>,
    #[serde(default)]
    pub region: Option<ParallelRegion>,
    #[serde(default)]
    pub waiting_on: Option<StepId>,
    pub context: Context,
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub error: Option<String>,
    pub ticks: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceState {
    pub fn new(process_type: impl Into<String>, start: impl Into<StepId>, context: Context) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            process_type: process_type.into(),
            status: InstanceStatus::Created,
            active: vec![start.into()],
            region: None,
            waiting_on: None,
            context,
            history: Vec::new(),
            error: None,
            ticks: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, rejecting edges the lifecycle does not allow.
    pub fn transition_to(&mut self, next: InstanceStatus) -> Result<InstanceStatus, ProcError> {
        if !self.status.can_transition_to(next) {
            return Err(ProcError::InvalidState {
                id: self.id,
                status: self.status,
                operation: "change status",
            });
        }
        let previous = self.status;
        self.status = next;
        self.updated_at = Utc::now();
        Ok(previous)
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id,
            process_type: self.process_type.clone(),
            status: self.status,
            active: self.active.clone(),
            waiting_on: self.waiting_on.clone(),
            error: self.error.clone(),
            history_len: self.history.len(),
            ticks: self.ticks,
            context: self.context.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view returned by status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub process_type: String,
    pub status: InstanceStatus,
    pub active: Vec<StepId>,
    pub waiting_on: Option<StepId>,
    pub error: Option<String>,
    pub history_len: usize,
    pub ticks: u64,
    pub context: Context,
    pub updated_at: DateTime<Utc>,
}
