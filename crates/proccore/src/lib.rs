//! Core abstractions for the process engine
//!
//! This crate provides the definition model, the per-instance record and the
//! task capability that the runtime drives. It carries no scheduling policy.

mod context;
mod definition;
mod error;
pub mod events;
mod instance;
mod task;
mod value;

pub use context::Context;
pub use definition::{
    Backoff, Condition, DefinitionSpec, ProcessDefinition, RetryPolicy, Step, StepId, StepKind,
    StepSpec, Transition, TransitionSpec,
};
pub use error::{DefinitionError, ProcError, StoreError, TaskError};
pub use events::{EventBus, EventEmitter, ExecutionEvent, TaskEvent};
pub use instance::{
    HistoryEntry, InstanceId, InstanceState, InstanceStatus, InstanceSummary, Outcome,
    ParallelRegion,
};
pub use task::{Task, TaskContext, TaskOutcome};
pub use value::Value;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, ProcError>;
