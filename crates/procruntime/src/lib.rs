//! Process execution runtime
//!
//! This crate drives process instances: it binds tasks from the registry,
//! runs steps with timeout and retry handling, resolves transitions, fans
//! out parallel regions and checkpoints every tick to a state store.

mod cache;
mod config;
mod coordinator;
mod engine;
mod env;
mod executor;
mod registry;
mod resolver;
mod scheduler;
mod source;
mod store;

pub use cache::{CachedStore, InstanceCache, MemoryCache};
pub use config::EngineConfig;
pub use coordinator::{fork, merge_contexts, ForkReport, ForkResult};
pub use engine::{ProcessEngine, ProcessEngineBuilder};
pub use env::InstanceEnv;
pub use executor::{ExecutionPolicy, StepOutcome, StepRun, TaskExecutor};
pub use registry::{BoundTasks, TaskFactory, TaskMetadata, TaskRegistry};
pub use resolver::{resolve, NextSteps};
pub use scheduler::{InstanceHandle, InstanceScheduler, ResumeResult};
pub use source::{DefinitionSource, DirectoryDefinitions, InMemoryDefinitions};
pub use store::{FileStore, MemoryStore, StateStore};
