// crates/procruntime/tests/engine_test.rs

mod common;

use common::{
    context, engine, fork_spec, init_tracing, linear, Flaky, FlakyStore, Increment, Noop,
    SetValues, Sleeper, Suspender,
};
use proccore::{
    Condition, Context, DefinitionError, DefinitionSpec, EventBus, ExecutionEvent, InstanceState,
    InstanceStatus, Outcome, ProcError, RetryPolicy, StepSpec, Value,
};
use procruntime::{
    EngineConfig, FileStore, InMemoryDefinitions, InstanceEnv, InstanceScheduler, MemoryCache,
    MemoryStore, ProcessEngine, ResumeResult, StateStore, TaskRegistry,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn noop_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register_task("noop", Arc::new(Noop));
    registry
}

fn approval_spec() -> DefinitionSpec {
    let mut spec = DefinitionSpec::new("approval", "request");
    spec.add_step(StepSpec::new("request").with_task("wait"));
    spec.add_step(StepSpec::new("notify").with_task("noop"));
    spec.add_step(StepSpec::new("done"));
    spec.connect("request", "notify");
    spec.connect("notify", "done");
    spec
}

fn approval_registry() -> TaskRegistry {
    let mut registry = noop_registry();
    registry.register_task("wait", Arc::new(Suspender));
    registry
}

#[tokio::test]
async fn test_linear_process_completes_in_two_ticks() {
    init_tracing();
    let engine = engine(vec![linear("chain", &["a", "b", "c"], "noop")], noop_registry()).await;
    let input = context(json!({"order": 17}));

    let summary = engine.start_instance("chain", input.clone()).await.unwrap();

    assert_eq!(summary.status, InstanceStatus::Completed);
    assert_eq!(summary.ticks, 2);
    assert_eq!(summary.history_len, 2);
    assert_eq!(summary.context, input);
    assert_eq!(summary.active, vec!["c".to_string()]);
}

#[tokio::test]
async fn test_created_instance_does_not_run_until_driven() {
    let engine = engine(vec![linear("chain", &["a", "b"], "noop")], noop_registry()).await;

    let id = engine.create_instance("chain", Context::new()).await.unwrap();
    let summary = engine.get_status(id).await.unwrap();

    assert_eq!(summary.status, InstanceStatus::Created);
    assert_eq!(summary.ticks, 0);
    assert_eq!(summary.active, vec!["a".to_string()]);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_instance() {
    let mut spec = linear("retrying", &["a", "b"], "flaky");
    spec.steps[0] = StepSpec::new("a")
        .with_task("flaky")
        .with_retry(RetryPolicy::fixed(3, 1));
    let mut registry = TaskRegistry::new();
    registry.register_task("flaky", Arc::new(Flaky::always()));
    let engine = engine(vec![spec], registry).await;

    let summary = engine.start_instance("retrying", Context::new()).await.unwrap();
    let state = engine.get_state(summary.id).await.unwrap();

    assert_eq!(summary.status, InstanceStatus::Failed);
    assert_eq!(state.history.len(), 3);
    assert!(state.history.iter().all(|e| e.outcome.is_failure()));
    assert!(summary.error.unwrap().contains("Step 'a' failed"));
}

#[tokio::test]
async fn test_engine_default_retry_applies_to_steps_without_policy() {
    let mut registry = TaskRegistry::new();
    registry.register_task("flaky", Arc::new(Flaky::new(1)));
    let definitions = Arc::new(InMemoryDefinitions::new());
    definitions
        .register(linear("chain", &["a", "b"], "flaky"))
        .await
        .unwrap();
    let engine = ProcessEngine::builder()
        .definitions(definitions)
        .registry(registry)
        .config(procruntime::EngineConfig {
            default_retry: RetryPolicy::fixed(2, 0),
            ..Default::default()
        })
        .build();

    let summary = engine.start_instance("chain", Context::new()).await.unwrap();
    assert_eq!(summary.status, InstanceStatus::Completed);
    assert_eq!(summary.history_len, 2);
}

#[tokio::test]
async fn test_terminal_state_is_immutable() {
    let engine = engine(vec![linear("chain", &["a", "b"], "noop")], noop_registry()).await;
    let done = engine.start_instance("chain", Context::new()).await.unwrap();

    let first = engine.get_status(done.id).await.unwrap();
    let again = engine.run_instance(done.id).await.unwrap();
    let cancelled = engine.cancel(done.id).await.unwrap();
    let resumed = engine
        .resume(done.id, "a", ResumeResult::Success(Context::new()))
        .await;
    let second = engine.get_status(done.id).await.unwrap();

    assert_eq!(first, done);
    assert_eq!(again, done);
    assert_eq!(cancelled, done);
    assert!(matches!(
        resumed,
        Err(ProcError::InvalidState {
            status: InstanceStatus::Completed,
            ..
        })
    ));
    assert_eq!(second, done);
}

#[tokio::test]
async fn test_ambiguous_transition_fails_the_instance() {
    let mut spec = DefinitionSpec::new("routing", "a");
    spec.add_step(StepSpec::new("a").with_task("noop"));
    spec.add_step(StepSpec::new("b"));
    spec.add_step(StepSpec::new("c"));
    spec.connect_when("a", "b", Condition::greater_than("amount", 10.0));
    spec.connect_when("a", "c", Condition::greater_than("amount", 100.0));
    let engine = engine(vec![spec], noop_registry()).await;

    let summary = engine
        .start_instance("routing", context(json!({"amount": 500})))
        .await
        .unwrap();

    assert_eq!(summary.status, InstanceStatus::Failed);
    assert!(summary.error.unwrap().contains("Ambiguous"));
}

#[tokio::test]
async fn test_no_viable_transition_fails_the_instance() {
    let mut spec = DefinitionSpec::new("routing", "a");
    spec.add_step(StepSpec::new("a").with_task("noop"));
    spec.add_step(StepSpec::new("b"));
    spec.connect_when("a", "b", Condition::exists("approved"));
    let engine = engine(vec![spec], noop_registry()).await;

    let summary = engine.start_instance("routing", Context::new()).await.unwrap();

    assert_eq!(summary.status, InstanceStatus::Failed);
    assert_eq!(summary.active, vec!["a".to_string()]);
}

#[tokio::test]
async fn test_unknown_task_is_rejected_at_creation() {
    let engine = engine(vec![linear("chain", &["a", "b"], "missing.task")], noop_registry()).await;

    let err = engine.create_instance("chain", Context::new()).await.unwrap_err();

    assert!(matches!(
        err,
        ProcError::Definition(DefinitionError::UnknownTask { ref step, ref task })
            if step == "a" && task == "missing.task"
    ));
}

#[tokio::test]
async fn test_unknown_process_type_is_a_definition_error() {
    let engine = engine(vec![], noop_registry()).await;
    let err = engine.create_instance("nope", Context::new()).await.unwrap_err();
    assert!(matches!(
        err,
        ProcError::Definition(DefinitionError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_failure_transition_records_the_error() {
    let mut spec = DefinitionSpec::new("guarded", "charge");
    spec.add_step(StepSpec::new("charge").with_task("flaky").on_failure("refund"));
    spec.add_step(StepSpec::new("ship").with_task("noop"));
    spec.add_step(StepSpec::new("refund").with_task("noop"));
    spec.add_step(StepSpec::new("end"));
    spec.connect("charge", "ship");
    spec.connect("ship", "end");
    spec.connect("refund", "end");
    let mut registry = noop_registry();
    registry.register_task("flaky", Arc::new(Flaky::always()));
    let engine = engine(vec![spec], registry).await;

    let summary = engine.start_instance("guarded", Context::new()).await.unwrap();
    let state = engine.get_state(summary.id).await.unwrap();

    assert_eq!(summary.status, InstanceStatus::Completed);
    let steps: Vec<_> = state.history.iter().map(|e| e.step.as_str()).collect();
    assert_eq!(steps, vec!["charge", "refund"]);
    assert_eq!(
        summary.context.get_path("error.step"),
        Some(&Value::from("charge"))
    );
    assert!(summary.context.get_path("error.message").is_some());
}

#[tokio::test]
async fn test_suspended_instance_resumes_with_result() {
    let engine = engine(vec![approval_spec()], approval_registry()).await;

    let waiting = engine
        .start_instance("approval", context(json!({"amount": 20})))
        .await
        .unwrap();
    assert_eq!(waiting.status, InstanceStatus::Waiting);
    assert_eq!(waiting.waiting_on.as_deref(), Some("request"));

    let wrong = engine
        .resume(waiting.id, "notify", ResumeResult::Success(Context::new()))
        .await;
    assert!(matches!(wrong, Err(ProcError::StepMismatch { .. })));

    let done = engine
        .resume(
            waiting.id,
            "request",
            ResumeResult::Success(context(json!({"approved": true}))),
        )
        .await
        .unwrap();
    let state = engine.get_state(done.id).await.unwrap();

    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.context, context(json!({"amount": 20, "approved": true})));
    let outcomes: Vec<_> = state.history.iter().map(|e| e.outcome.clone()).collect();
    assert!(matches!(outcomes[0], Outcome::Suspended(_)));
    assert_eq!(outcomes[1], Outcome::Resumed);
    assert_eq!(outcomes[2], Outcome::Success);
}

#[tokio::test]
async fn test_resume_with_failure_fails_the_instance() {
    let engine = engine(vec![approval_spec()], approval_registry()).await;
    let waiting = engine.start_instance("approval", Context::new()).await.unwrap();

    let failed = engine
        .resume(
            waiting.id,
            "request",
            ResumeResult::Failure("rejected by reviewer".into()),
        )
        .await
        .unwrap();

    assert_eq!(failed.status, InstanceStatus::Failed);
    assert!(failed.error.unwrap().contains("rejected by reviewer"));
}

#[tokio::test]
async fn test_cancel_waiting_instance() {
    let engine = engine(vec![approval_spec()], approval_registry()).await;
    let waiting = engine.start_instance("approval", Context::new()).await.unwrap();

    let cancelled = engine.cancel(waiting.id).await.unwrap();
    assert_eq!(cancelled.status, InstanceStatus::Cancelled);

    let resumed = engine
        .resume(waiting.id, "request", ResumeResult::Success(Context::new()))
        .await;
    assert!(matches!(resumed, Err(ProcError::InvalidState { .. })));
    assert_eq!(
        engine.get_status(waiting.id).await.unwrap().status,
        InstanceStatus::Cancelled
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_takes_effect_at_tick_boundary() {
    let mut registry = noop_registry();
    registry.register_task("slow", Arc::new(Sleeper(Duration::from_millis(200))));
    let engine = engine(vec![linear("slow", &["a", "b", "c"], "slow")], registry).await;
    let id = engine.create_instance("slow", Context::new()).await.unwrap();

    let run = engine.spawn_instance(id);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let cancelled = engine.cancel(id).await.unwrap();
    let finished = run.await.unwrap().unwrap();
    let state = engine.get_state(id).await.unwrap();

    assert_eq!(cancelled.status, InstanceStatus::Cancelled);
    assert_eq!(finished.status, InstanceStatus::Cancelled);
    // the attempt in flight finished; nothing after it was scheduled
    assert_eq!(state.history.len(), 1);
    assert_eq!(state.history[0].outcome, Outcome::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_region_merges_at_join() {
    let mut registry = TaskRegistry::new();
    registry.register_task("x", Arc::new(SetValues::new([("a", 1)]).after(Duration::from_millis(30))));
    registry.register_task("y", Arc::new(SetValues::new([("a", 2), ("b", 1)])));
    let engine = engine(vec![fork_spec("fanout", "x", "y")], registry).await;

    let summary = engine
        .start_instance("fanout", context(json!({"seed": 0})))
        .await
        .unwrap();
    let state = engine.get_state(summary.id).await.unwrap();

    assert_eq!(summary.status, InstanceStatus::Completed);
    assert_eq!(summary.context, context(json!({"seed": 0, "a": 2, "b": 1})));
    assert_eq!(summary.ticks, 3);
    assert!(state.region.is_none());
    let branches: Vec<_> = state.history.iter().filter_map(|e| e.branch.clone()).collect();
    assert_eq!(branches, vec!["x".to_string(), "y".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_branch_fails_without_partial_merge() {
    let mut registry = TaskRegistry::new();
    registry.register_task("x", Arc::new(SetValues::new([("a", 1)])));
    registry.register_task("y", Arc::new(Flaky::always()));
    let engine = engine(vec![fork_spec("fanout", "x", "y")], registry).await;

    let summary = engine
        .start_instance("fanout", context(json!({"seed": 0})))
        .await
        .unwrap();

    assert_eq!(summary.status, InstanceStatus::Failed);
    assert_eq!(summary.context, context(json!({"seed": 0})));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_suspension_inside_branch_is_a_failure() {
    let mut registry = noop_registry();
    registry.register_task("wait", Arc::new(Suspender));
    let engine = engine(vec![fork_spec("fanout", "noop", "wait")], registry).await;

    let summary = engine.start_instance("fanout", Context::new()).await.unwrap();

    assert_eq!(summary.status, InstanceStatus::Failed);
    assert!(summary.error.unwrap().contains("parallel branch"));
}

/// Split whose branches are each taken only when their flag is set
fn choice_spec() -> DefinitionSpec {
    let mut spec = DefinitionSpec::new("choice", "s");
    spec.add_step(StepSpec::new("s").split());
    spec.add_step(StepSpec::new("x").with_task("x"));
    spec.add_step(StepSpec::new("y").with_task("noop"));
    spec.add_step(StepSpec::new("j").join());
    spec.add_step(StepSpec::new("end"));
    spec.connect_when("s", "x", Condition::truthy("go_x"));
    spec.connect_when("s", "y", Condition::truthy("go_y"));
    spec.connect("x", "j");
    spec.connect("y", "j");
    spec.connect("j", "end");
    spec
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_taken_branch_still_runs_as_a_region() {
    let mut registry = noop_registry();
    registry.register_task("x", Arc::new(SetValues::new([("a", 1)])));
    let engine = engine(vec![choice_spec()], registry).await;

    let summary = engine
        .start_instance("choice", context(json!({"go_x": true})))
        .await
        .unwrap();
    let state = engine.get_state(summary.id).await.unwrap();

    assert_eq!(summary.status, InstanceStatus::Completed);
    assert_eq!(summary.context.get("a"), Some(&Value::Integer(1)));
    assert_eq!(summary.ticks, 3);
    assert!(state.region.is_none());
    let branches: Vec<_> = state.history.iter().filter_map(|e| e.branch.clone()).collect();
    assert_eq!(branches, vec!["x".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_taken_branch_cannot_suspend() {
    let mut registry = noop_registry();
    registry.register_task("x", Arc::new(Suspender));
    let engine = engine(vec![choice_spec()], registry).await;

    let summary = engine
        .start_instance("choice", context(json!({"go_x": true})))
        .await
        .unwrap();
    let state = engine.get_state(summary.id).await.unwrap();

    assert_eq!(summary.status, InstanceStatus::Failed);
    assert!(summary.error.unwrap().contains("parallel branch"));
    assert!(state.region.is_none());
    assert!(state.waiting_on.is_none());
    let suspended: Vec<_> = state
        .history
        .iter()
        .filter(|e| matches!(e.outcome, Outcome::Suspended(_)))
        .collect();
    assert_eq!(suspended.len(), 1);
    assert_eq!(suspended[0].branch.as_deref(), Some("x"));
}

#[tokio::test]
async fn test_finished_instances_leave_the_cache() {
    let cache = Arc::new(MemoryCache::new(Duration::from_secs(60)));
    let definitions = Arc::new(InMemoryDefinitions::new());
    definitions
        .register(linear("chain", &["a", "b"], "noop"))
        .await
        .unwrap();
    definitions.register(approval_spec()).await.unwrap();
    let engine = ProcessEngine::builder()
        .definitions(definitions)
        .registry(approval_registry())
        .cache(cache.clone())
        .build();

    for _ in 0..20 {
        let summary = engine.start_instance("chain", Context::new()).await.unwrap();
        assert_eq!(summary.status, InstanceStatus::Completed);
    }
    assert_eq!(cache.len().await, 0);

    let waiting = engine.start_instance("approval", Context::new()).await.unwrap();
    assert_eq!(cache.len().await, 1);

    engine
        .resume(waiting.id, "request", ResumeResult::Success(Context::new()))
        .await
        .unwrap();
    assert_eq!(cache.len().await, 0);
    assert_eq!(
        engine.get_status(waiting.id).await.unwrap().status,
        InstanceStatus::Completed
    );
}

#[tokio::test]
async fn test_cancel_before_first_tick_never_reports_running() {
    let definition = linear("chain", &["a", "b"], "noop").validate().unwrap();
    let tasks = noop_registry().bind(&definition).unwrap();
    let events = Arc::new(EventBus::default());
    let mut state = InstanceState::new("chain", "a", Context::new());
    let env = Arc::new(InstanceEnv::new(
        state.id,
        Arc::new(definition),
        tasks,
        Arc::new(EngineConfig::default()),
        Arc::clone(&events),
    ));
    let scheduler = InstanceScheduler::new(Arc::new(MemoryStore::new()), Arc::clone(&events));
    let mut received = events.subscribe();

    env.cancel.cancel();
    scheduler.tick(&env, &mut state).await.unwrap();

    assert_eq!(state.status, InstanceStatus::Cancelled);
    assert!(state.history.is_empty());
    let mut changes = Vec::new();
    while let Ok(event) = received.try_recv() {
        if let ExecutionEvent::StatusChanged { from, to, .. } = event {
            changes.push((from, to));
        }
    }
    assert_eq!(
        changes,
        vec![(InstanceStatus::Created, InstanceStatus::Cancelled)]
    );
}

#[tokio::test]
async fn test_reentrant_loop_runs_until_condition_flips() {
    let mut spec = DefinitionSpec::new("counter", "count");
    spec.add_step(StepSpec::new("count").with_task("inc").reentrant());
    spec.add_step(StepSpec::new("end"));
    spec.connect_when("count", "count", Condition::less_than("n", 3.0));
    spec.connect_when("count", "end", Condition::negate(Condition::less_than("n", 3.0)));
    let mut registry = TaskRegistry::new();
    registry.register_task("inc", Arc::new(Increment("n")));
    let engine = engine(vec![spec], registry).await;

    let summary = engine.start_instance("counter", Context::new()).await.unwrap();

    assert_eq!(summary.status, InstanceStatus::Completed);
    assert_eq!(summary.context.get("n"), Some(&Value::Integer(3)));
    assert_eq!(summary.ticks, 3);
}

#[tokio::test]
async fn test_failed_checkpoint_keeps_last_persisted_state() {
    let store = Arc::new(FlakyStore::default());
    let definitions = Arc::new(InMemoryDefinitions::new());
    definitions
        .register(linear("chain", &["a", "b", "c"], "noop"))
        .await
        .unwrap();
    let engine = ProcessEngine::builder()
        .definitions(definitions)
        .registry(noop_registry())
        .store(store.clone())
        .build();

    let id = engine.create_instance("chain", Context::new()).await.unwrap();
    store.set_failing(true);
    let err = engine.run_instance(id).await.unwrap_err();
    assert!(matches!(err, ProcError::Store(_)));

    let stored = store.load(id).await.unwrap();
    assert_eq!(stored.status, InstanceStatus::Created);
    assert_eq!(
        engine.get_status(id).await.unwrap().status,
        InstanceStatus::Created
    );

    store.set_failing(false);
    let summary = engine.run_instance(id).await.unwrap();
    assert_eq!(summary.status, InstanceStatus::Completed);
    assert_eq!(summary.ticks, 2);
}

#[tokio::test]
async fn test_file_store_survives_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let build = |store: FileStore| async move {
        let definitions = Arc::new(InMemoryDefinitions::new());
        definitions.register(approval_spec()).await.unwrap();
        ProcessEngine::builder()
            .definitions(definitions)
            .registry(approval_registry())
            .store(Arc::new(store))
            .build()
    };

    let first = build(FileStore::open(dir.path()).await.unwrap()).await;
    let waiting = first.start_instance("approval", Context::new()).await.unwrap();
    let pending = first.create_instance("approval", Context::new()).await.unwrap();
    drop(first);

    let second = build(FileStore::open(dir.path()).await.unwrap()).await;
    assert_eq!(
        second.get_status(waiting.id).await.unwrap().status,
        InstanceStatus::Waiting
    );
    let done = second
        .resume(waiting.id, "request", ResumeResult::Success(Context::new()))
        .await
        .unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);

    let recovered = second.run_instance(pending).await.unwrap();
    assert_eq!(recovered.status, InstanceStatus::Waiting);
}

#[tokio::test]
async fn test_unknown_instance_is_not_found() {
    let engine = engine(vec![], noop_registry()).await;
    let id = uuid::Uuid::new_v4();

    assert!(matches!(
        engine.get_status(id).await,
        Err(ProcError::InstanceNotFound(got)) if got == id
    ));
    assert!(matches!(
        engine.cancel(id).await,
        Err(ProcError::InstanceNotFound(_))
    ));
}

#[tokio::test]
async fn test_status_changes_are_published() {
    let engine = engine(vec![linear("chain", &["a", "b"], "noop")], noop_registry()).await;
    let mut events = engine.subscribe_events();

    engine.start_instance("chain", Context::new()).await.unwrap();

    let mut changes = Vec::new();
    let mut created = false;
    while let Ok(event) = events.try_recv() {
        match event {
            ExecutionEvent::InstanceCreated { .. } => created = true,
            ExecutionEvent::StatusChanged { from, to, .. } => changes.push((from, to)),
            _ => {}
        }
    }
    assert!(created);
    assert_eq!(
        changes,
        vec![
            (InstanceStatus::Created, InstanceStatus::Running),
            (InstanceStatus::Running, InstanceStatus::Completed),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_instances_run_independently() {
    let mut registry = noop_registry();
    registry.register_task("slow", Arc::new(Sleeper(Duration::from_millis(100))));
    let engine = engine(vec![linear("slow", &["a", "b"], "slow")], registry).await;

    let mut runs = Vec::new();
    for _ in 0..8 {
        let id = engine.create_instance("slow", Context::new()).await.unwrap();
        runs.push(engine.spawn_instance(id));
    }
    let started = std::time::Instant::now();
    for run in runs {
        assert_eq!(run.await.unwrap().unwrap().status, InstanceStatus::Completed);
    }
    assert!(started.elapsed() < Duration::from_millis(700));
}
