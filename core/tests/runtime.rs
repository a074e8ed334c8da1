//! Factory runtime integration tests: spawn validation, depth limiting,
//! cancellation composition, and concurrency groups.

#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use factory_core::Factory;
use factory_core::FactoryConfig;
use factory_core::FactoryError;
use factory_core::JoinInput;
use factory_core::JoinOutcome;
use factory_core::RunRegistry;
use factory_core::RunStore;
use factory_core::SpawnInput;
use pretty_assertions::assert_eq;

/// Branches on the agent role argument (`--agent <role>`), so one config
/// can drive mixed-outcome fan-outs.
const ROLE_SCRIPT: &str = r#"
case "$4" in
  ok)
    printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"fine"}]}}'
    ;;
  bad)
    printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"broken"}]}}'
    exit 1
    ;;
  slow)
    sleep 5
    ;;
esac
"#;

struct Harness {
    factory: Arc<Factory>,
    store: Arc<RunStore>,
    registry: Arc<RunRegistry>,
    _dir: tempfile::TempDir,
}

fn config(runs_root: &Path, depth: u32, max_depth: u32) -> Arc<FactoryConfig> {
    Arc::new(FactoryConfig {
        runs_root: runs_root.to_path_buf(),
        agent_program: PathBuf::from("/bin/sh"),
        agent_args: vec!["-c".to_string(), ROLE_SCRIPT.to_string(), "factory-agent".to_string()],
        model: "test-model".to_string(),
        max_depth,
        poll_interval: Duration::from_millis(25),
        grace_period: Duration::from_millis(400),
        persist_transcripts: false,
        depth,
    })
}

async fn harness_at_depth(depth: u32, max_depth: u32) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(RunStore::new(dir.path()));
    let registry = RunRegistry::new(store.clone());
    let shutdown = registry.begin_run("run-test").await;
    let factory = Factory::new(
        "run-test",
        config(dir.path(), depth, max_depth),
        store.clone(),
        registry.clone(),
        shutdown,
    );
    Harness {
        factory,
        store,
        registry,
        _dir: dir,
    }
}

async fn harness() -> Harness {
    harness_at_depth(0, 3).await
}

fn spawn_input(agent: &str) -> SpawnInput {
    SpawnInput {
        agent: agent.to_string(),
        task: "carry out the assignment".to_string(),
        ..SpawnInput::default()
    }
}

#[tokio::test]
async fn spawn_rejects_empty_task() {
    let h = harness().await;
    let mut input = spawn_input("ok");
    input.task = "   ".to_string();
    let err = h.factory.spawn(input).await.expect_err("must reject");
    assert!(matches!(err, FactoryError::InvalidInput(_)));
}

#[tokio::test]
async fn spawn_rejects_empty_model() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(RunStore::new(dir.path()));
    let registry = RunRegistry::new(store.clone());
    let shutdown = registry.begin_run("run-test").await;
    let mut no_model = config(dir.path(), 0, 3);
    Arc::get_mut(&mut no_model).expect("sole owner").model = String::new();
    let factory = Factory::new("run-test", no_model, store, registry, shutdown);

    let err = factory
        .spawn(spawn_input("ok"))
        .await
        .expect_err("must reject");
    assert!(matches!(err, FactoryError::InvalidInput(_)));
}

#[tokio::test]
async fn task_ids_are_sequential_within_the_run() {
    let h = harness().await;
    let first = h.factory.spawn(spawn_input("ok")).await.expect("spawn");
    let second = h.factory.spawn(spawn_input("ok")).await.expect("spawn");
    assert_eq!(first.task_id(), 1);
    assert_eq!(second.task_id(), 2);
    h.factory.shutdown(false).await;
}

#[tokio::test]
async fn depth_is_refused_past_the_maximum_and_allowed_at_it() {
    // A factory one level below the maximum may still spawn: its
    // children sit at exactly the maximum depth.
    let at_limit = harness_at_depth(2, 3).await;
    let handle = at_limit
        .factory
        .spawn(spawn_input("ok"))
        .await
        .expect("spawn at the boundary");
    let result = handle.wait().await;
    assert_eq!(result.exit_code, 0);

    // A factory already at the maximum must refuse.
    let past_limit = harness_at_depth(3, 3).await;
    let err = past_limit
        .factory
        .spawn(spawn_input("ok"))
        .await
        .expect_err("must refuse");
    assert!(matches!(
        err,
        FactoryError::DepthExceeded { depth: 4, max: 3 }
    ));
}

#[tokio::test]
async fn double_join_returns_the_same_cached_result() {
    let h = harness().await;
    let handle = h.factory.spawn(spawn_input("ok")).await.expect("spawn");

    let (first, second) = tokio::join!(handle.wait(), handle.wait());
    assert_eq!(first.exit_code, second.exit_code);
    assert_eq!(first.text, second.text);
    let third = handle.wait().await;
    assert_eq!(third.text, "fine");
}

#[tokio::test]
async fn fan_out_settled_returns_every_result_in_order() {
    let h = harness().await;
    let ok = h.factory.spawn(spawn_input("ok")).await.expect("spawn ok");
    let bad = h.factory.spawn(spawn_input("bad")).await.expect("spawn bad");

    let outcomes = h
        .factory
        .join_all_settled(vec![JoinInput::from(ok), JoinInput::from(bad)])
        .await;
    assert_eq!(outcomes.len(), 2);
    let first = outcomes[0].as_task().expect("task outcome");
    let second = outcomes[1].as_task().expect("task outcome");
    assert_eq!(first.exit_code, 0);
    assert_eq!(second.exit_code, 1);
    assert_eq!(second.text, "broken");

    // The mixed group is visible to observability.
    let events = h.store.read_events("run-test").await;
    let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
    assert!(messages.contains(&"group:start"));
    assert!(messages.contains(&"group:failed"));
}

#[tokio::test]
async fn join_all_escalates_on_a_failed_member() {
    let h = harness().await;
    let bad = h.factory.spawn(spawn_input("bad")).await.expect("spawn");
    let err = h
        .factory
        .join_all(vec![JoinInput::from(bad)])
        .await
        .expect_err("must escalate");
    assert!(matches!(err, FactoryError::TaskFailed { task_id: 1, .. }));
}

#[tokio::test]
async fn waits_with_no_task_handles_are_transparent() {
    let h = harness().await;
    let values = vec![
        JoinInput::from(serde_json::json!(1)),
        JoinInput::from(serde_json::json!({"k": "v"})),
    ];
    let outcomes = h.factory.join_all(values).await.expect("plain values");
    match (&outcomes[0], &outcomes[1]) {
        (JoinOutcome::Value(a), JoinOutcome::Value(b)) => {
            assert_eq!(a, &serde_json::json!(1));
            assert_eq!(b, &serde_json::json!({"k": "v"}));
        }
        other => panic!("expected plain values, got {other:?}"),
    }

    // No group events: the instrumentation stayed out of the way.
    let events = h.store.read_events("run-test").await;
    assert!(events.iter().all(|e| !e.message.starts_with("group:")));
}

#[tokio::test]
async fn shutdown_with_cancel_signals_all_active_tasks_and_waits() {
    let h = harness().await;
    h.factory.spawn(spawn_input("slow")).await.expect("spawn");
    h.factory.spawn(spawn_input("slow")).await.expect("spawn");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.factory.active_count().await, 2);

    let started = Instant::now();
    let results = tokio::time::timeout(Duration::from_secs(3), h.factory.shutdown(true))
        .await
        .expect("shutdown must not hang");
    assert_eq!(results.len(), 2);
    for result in &results {
        assert!(result.is_resolved(), "no task may be abandoned mid-flight");
        assert_eq!(result.stop_reason.as_deref(), Some("cancelled"));
    }
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(h.factory.active_count().await, 0);
}

#[tokio::test]
async fn caller_signal_cancels_only_its_own_task() {
    let h = harness().await;
    let signal = tokio_util::sync::CancellationToken::new();
    let mut doomed = spawn_input("slow");
    doomed.cancel = Some(signal.clone());
    let doomed = h.factory.spawn(doomed).await.expect("spawn doomed");
    let sibling = h.factory.spawn(spawn_input("ok")).await.expect("spawn sibling");

    signal.cancel();
    let doomed_result = tokio::time::timeout(Duration::from_secs(3), doomed.wait())
        .await
        .expect("cancelled task settles");
    assert_eq!(doomed_result.stop_reason.as_deref(), Some("cancelled"));

    let sibling_result = tokio::time::timeout(Duration::from_secs(3), sibling.wait())
        .await
        .expect("sibling settles");
    assert_eq!(sibling_result.exit_code, 0, "siblings are unaffected");
}

#[tokio::test]
async fn task_handles_render_a_useful_debug_shape() {
    let h = harness().await;
    let handle = h.factory.spawn(spawn_input("ok")).await.expect("spawn");
    let rendered = format!("{handle:?}");
    assert!(rendered.contains("TaskHandle"));
    assert!(rendered.contains("task_id: 1"));

    handle.wait().await;
    let rendered = format!("{handle:?}");
    assert!(rendered.contains("settled: true"));
}

#[tokio::test]
async fn caller_token_relay_ends_once_the_task_settles() {
    let h = harness().await;
    let metrics = tokio::runtime::Handle::current().metrics();
    let baseline = metrics.num_alive_tasks();

    let signal = tokio_util::sync::CancellationToken::new();
    let mut input = spawn_input("ok");
    input.cancel = Some(signal.clone());
    let handle = h.factory.spawn(input).await.expect("spawn");
    handle.wait().await;

    // An uncancelled caller token must not pin a background task alive.
    let deadline = Instant::now() + Duration::from_secs(2);
    while metrics.num_alive_tasks() > baseline {
        assert!(Instant::now() < deadline, "relay task outlived its launch");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn results_are_recorded_on_the_run_registry() {
    let h = harness().await;
    let handle = h.factory.spawn(spawn_input("ok")).await.expect("spawn");
    handle.wait().await;

    let record = h.registry.get("run-test").await.expect("record");
    assert_eq!(record.results.len(), 1);
    assert_eq!(record.results[0].task_id, 1);
}
