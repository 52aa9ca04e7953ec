use crate::instance::{InstanceId, InstanceStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcError {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Step '{step}' failed: {source}")]
    Task {
        step: String,
        #[source]
        source: TaskError,
    },

    #[error("No viable transition out of step '{step}'")]
    NoViableTransition { step: String },

    #[error("Ambiguous transitions out of step '{step}': {targets:?}")]
    AmbiguousTransition { step: String, targets: Vec<String> },

    #[error("Persistence error: {0}")]
    Store(#[from] StoreError),

    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Instance {id} is {status}, cannot {operation}")]
    InvalidState {
        id: InstanceId,
        status: InstanceStatus,
        operation: &'static str,
    },

    #[error("Instance {id} is waiting on step '{expected}', not '{actual}'")]
    StepMismatch {
        id: InstanceId,
        expected: String,
        actual: String,
    },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Process definition not found: {0}")]
    NotFound(String),

    #[error("Invalid definition: {0}")]
    Invalid(String),

    #[error("Failed to load definition: {0}")]
    Load(String),

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Unknown start step: {0}")]
    UnknownStart(String),

    #[error("Step '{0}' is unreachable from the start step")]
    UnreachableStep(String),

    #[error("Step '{0}' has no path to a terminal step")]
    DeadEnd(String),

    #[error("Cycle through {0:?} contains no step marked re-entrant")]
    UnmarkedCycle(Vec<String>),

    #[error("Transitions {step} -> {first} and {step} -> {second} can match together on a non-split step")]
    OverlappingConditions {
        step: String,
        first: String,
        second: String,
    },

    #[error("Terminal step '{0}' declares a task; terminal steps are end markers")]
    TerminalTask(String),

    #[error("Split '{0}' has no outgoing transitions")]
    SplitWithoutBranches(String),

    #[error("Branches of split '{split}' converge on different joins: {joins:?}")]
    MismatchedJoin { split: String, joins: Vec<String> },

    #[error("Join '{0}' is not the join of any split")]
    OrphanJoin(String),

    #[error("Unknown task '{task}' referenced by step '{step}'")]
    UnknownTask { step: String, task: String },

    #[error("Task for step '{step}' rejected its configuration: {message}")]
    InvalidTaskConfig { step: String, message: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Instance record not found: {0}")]
    NotFound(InstanceId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Record serialization failed: {0}")]
    Serialization(String),
}
