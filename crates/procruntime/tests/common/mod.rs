#![allow(dead_code)]

use async_trait::async_trait;
use proccore::{
    Context, DefinitionSpec, InstanceId, InstanceState, StepSpec, StoreError, Task, TaskContext,
    TaskOutcome, Value,
};
use procruntime::{InMemoryDefinitions, MemoryStore, ProcessEngine, StateStore, TaskRegistry};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Returns the context untouched
pub struct Noop;

#[async_trait]
impl Task for Noop {
    fn task_type(&self) -> &str {
        "test.noop"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        TaskOutcome::Success(ctx.into_context())
    }
}

/// Writes fixed values after an optional delay
pub struct SetValues {
    values: Vec<(String, Value)>,
    delay: Duration,
}

impl SetValues {
    pub fn new<V: Into<Value>>(values: impl IntoIterator<Item = (&'static str, V)>) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into()))
                .collect(),
            delay: Duration::ZERO,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Task for SetValues {
    fn task_type(&self) -> &str {
        "test.set"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut context = ctx.into_context();
        for (key, value) in &self.values {
            context.insert(key.clone(), value.clone());
        }
        TaskOutcome::Success(context)
    }
}

/// Fails the first `failures` calls, then succeeds
pub struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

impl Flaky {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn always() -> Self {
        Self::new(u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for Flaky {
    fn task_type(&self) -> &str {
        "test.flaky"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            TaskOutcome::failed(format!("call {} failed", call))
        } else {
            TaskOutcome::Success(ctx.into_context())
        }
    }
}

/// Sleeps longer than any test deadline
pub struct Sleeper(pub Duration);

#[async_trait]
impl Task for Sleeper {
    fn task_type(&self) -> &str {
        "test.sleep"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        tokio::time::sleep(self.0).await;
        TaskOutcome::Success(ctx.into_context())
    }
}

pub struct Suspender;

#[async_trait]
impl Task for Suspender {
    fn task_type(&self) -> &str {
        "test.suspend"
    }

    async fn execute(&self, _ctx: TaskContext) -> TaskOutcome {
        TaskOutcome::suspend("waiting for approval")
    }
}

/// Adds one to an integer context key
pub struct Increment(pub &'static str);

#[async_trait]
impl Task for Increment {
    fn task_type(&self) -> &str {
        "test.increment"
    }

    async fn execute(&self, ctx: TaskContext) -> TaskOutcome {
        let current = ctx.context.get(self.0).and_then(Value::as_i64).unwrap_or(0);
        let mut context = ctx.into_context();
        context.insert(self.0, current + 1);
        TaskOutcome::Success(context)
    }
}

/// Memory store whose saves can be switched off
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn save(&self, state: &InstanceState) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk full".into()));
        }
        self.inner.save(state).await
    }

    async fn load(&self, id: InstanceId) -> Result<InstanceState, StoreError> {
        self.inner.load(id).await
    }

    async fn list(&self) -> Result<Vec<InstanceId>, StoreError> {
        self.inner.list().await
    }
}

/// `ids[0] -> ids[1] -> ...`, every step but the last running `task`
pub fn linear(process_type: &str, ids: &[&str], task: &str) -> DefinitionSpec {
    let mut spec = DefinitionSpec::new(process_type, ids[0]);
    for (i, id) in ids.iter().enumerate() {
        let step = StepSpec::new(*id);
        let step = if i + 1 < ids.len() { step.with_task(task) } else { step };
        spec.add_step(step);
    }
    for pair in ids.windows(2) {
        spec.connect(pair[0], pair[1]);
    }
    spec
}

/// `s` splits into `x` and `y`, joined at `j`, ending at `end`
pub fn fork_spec(process_type: &str, x_task: &str, y_task: &str) -> DefinitionSpec {
    let mut spec = DefinitionSpec::new(process_type, "s");
    spec.add_step(StepSpec::new("s").split());
    spec.add_step(StepSpec::new("x").with_task(x_task));
    spec.add_step(StepSpec::new("y").with_task(y_task));
    spec.add_step(StepSpec::new("j").join());
    spec.add_step(StepSpec::new("end"));
    spec.connect("s", "x");
    spec.connect("s", "y");
    spec.connect("x", "j");
    spec.connect("y", "j");
    spec.connect("j", "end");
    spec
}

pub async fn engine(specs: Vec<DefinitionSpec>, registry: TaskRegistry) -> ProcessEngine {
    let definitions = Arc::new(InMemoryDefinitions::new());
    for spec in specs {
        definitions.register(spec).await.unwrap();
    }
    ProcessEngine::builder()
        .definitions(definitions)
        .registry(registry)
        .build()
}

pub fn context(json: serde_json::Value) -> Context {
    Context::from_json(json).unwrap()
}
