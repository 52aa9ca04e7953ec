use crate::{InstanceId, InstanceStatus, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while instances execute
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    InstanceCreated {
        instance_id: InstanceId,
        process_type: String,
        timestamp: DateTime<Utc>,
    },
    StatusChanged {
        instance_id: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        instance_id: InstanceId,
        step: StepId,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        instance_id: InstanceId,
        step: StepId,
        attempt: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        instance_id: InstanceId,
        step: StepId,
        attempt: u32,
        error: String,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    StepSuspended {
        instance_id: InstanceId,
        step: StepId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    ForkOpened {
        instance_id: InstanceId,
        split: StepId,
        branches: Vec<StepId>,
        timestamp: DateTime<Utc>,
    },
    ForkJoined {
        instance_id: InstanceId,
        split: StepId,
        join: Option<StepId>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    Task {
        instance_id: InstanceId,
        step: StepId,
        event: TaskEvent,
        timestamp: DateTime<Utc>,
    },
}

/// Events a task reports about its own progress
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum TaskEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Event emitter handed to a running task
#[derive(Clone)]
pub struct EventEmitter {
    instance_id: InstanceId,
    step: StepId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        instance_id: InstanceId,
        step: impl Into<StepId>,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            instance_id,
            step: step.into(),
            sender,
        }
    }

    pub fn emit(&self, event: TaskEvent) {
        let _ = self.sender.send(ExecutionEvent::Task {
            instance_id: self.instance_id,
            step: self.step.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(TaskEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(TaskEvent::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(TaskEvent::Progress { percent, message });
    }
}

/// Process-wide event bus. Sends never block and never fail the caller;
/// events without subscribers are dropped.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, instance_id: InstanceId, step: impl Into<StepId>) -> EventEmitter {
        EventEmitter::new(instance_id, step, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
