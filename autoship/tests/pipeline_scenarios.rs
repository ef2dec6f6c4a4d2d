//! End-to-end scenarios: store actor → dispatch → execution pipeline → result
//! applied back to the store.
//!
//! The dispatcher records requests instead of sending them, and each test
//! feeds the recorded request to an in-process execution agent, then applies
//! the result the way the store's `complete` endpoint does.

use std::sync::Arc;
use std::time::Duration;

use autoship::core::types::ExecutionRequest;
use autoship::execution::{ExecutionAgent, NO_CHANGES_ERROR};
use autoship::io::ledger_store::LedgerStore;
use autoship::store::{DispatchOptions, ProjectSettings, StoreHandle};
use autoship::test_support::{
    RecordingDispatcher, ScriptedAgent, ScriptedQualityGate, TestOrigin, agent_config, task,
};

struct Harness {
    origin: TestOrigin,
    _data: tempfile::TempDir,
    workspace: tempfile::TempDir,
    dispatcher: Arc<RecordingDispatcher>,
    store: StoreHandle,
}

impl Harness {
    fn new() -> Self {
        let origin = TestOrigin::new().expect("origin");
        let data = tempfile::tempdir().expect("data dir");
        let workspace = tempfile::tempdir().expect("workspace");
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let store = StoreHandle::spawn(
            ProjectSettings {
                name: "web".to_string(),
                repo_url: origin.url().to_string(),
                base_branch: "main".to_string(),
                max_iterations: 2,
                callback_url: "http://127.0.0.1:9/projects/web/complete".to_string(),
            },
            // Timer effectively off: cycles are driven explicitly.
            DispatchOptions {
                delay: Duration::from_secs(3600),
                timeout: Duration::from_secs(3600),
                max_in_flight: 1,
                max_attempts: 3,
            },
            LedgerStore::new(data.path(), "web"),
            dispatcher.clone(),
        )
        .expect("spawn store");
        Self {
            origin,
            _data: data,
            workspace,
            dispatcher,
            store,
        }
    }

    fn agent(&self, agent: ScriptedAgent, gate: ScriptedQualityGate) -> ExecutionAgent {
        ExecutionAgent::new(
            agent_config(self.workspace.path()),
            Arc::new(agent),
            Arc::new(gate),
        )
    }

    /// Run one dispatch cycle and return the request it produced.
    async fn dispatch_one(&self) -> ExecutionRequest {
        let before = self.dispatcher.requests().len();
        self.store
            .dispatch()
            .await
            .expect("dispatch")
            .expect("a task was dispatched");
        let requests = self
            .dispatcher
            .wait_for(before + 1, Duration::from_secs(5))
            .await;
        requests.last().cloned().expect("recorded request")
    }
}

#[tokio::test]
async fn failing_tests_consume_one_attempt_and_task_stays_eligible() {
    let h = Harness::new();
    h.store.enqueue(task("t1")).await.expect("enqueue");

    let request = h.dispatch_one().await;
    assert_eq!(request.branch_name, "task/t1");
    let ledger = h.store.ledger().await.expect("ledger");
    assert_eq!(ledger.tasks["t1"].attempts, 1);

    let agent = h.agent(
        ScriptedAgent::completing().writing("src/t1.ts", "export const t1 = 1;\n"),
        ScriptedQualityGate::failing_tests("expected 2, got 1"),
    );
    let (_, result) = agent.run(request).await;
    assert!(!result.success);
    assert!(!result.tests_pass);
    assert!(!h.origin.has_branch("task/t1"));

    let entry = h.store.complete(result).await.expect("apply result");
    assert!(!entry.passes);
    assert_eq!(entry.attempts, 1);
    assert!(
        entry
            .error
            .as_deref()
            .is_some_and(|e| e.contains("expected 2, got 1"))
    );

    let (next, _) = h.store.next_task().await.expect("next").expect("eligible");
    assert_eq!(next, "t1");

    let version_before = h.store.ledger().await.expect("ledger").version;
    let retry = h.dispatch_one().await;
    assert_eq!(retry.task_id, "t1");
    let ledger = h.store.ledger().await.expect("ledger");
    assert_eq!(ledger.tasks["t1"].attempts, 2);
    assert!(ledger.tasks["t1"].in_flight);
    assert_eq!(ledger.version, version_before + 1);
}

#[tokio::test]
async fn successful_task_is_never_dispatched_again() {
    let h = Harness::new();
    h.store.enqueue(task("t2")).await.expect("enqueue");
    let request = h.dispatch_one().await;

    let agent = h.agent(
        ScriptedAgent::completing()
            .writing("src/t2.ts", "export const t2 = 2;\n")
            .saying("Note: components are registered in src/index.ts"),
        ScriptedQualityGate::passing(),
    );
    let (_, result) = agent.run(request).await;
    assert!(result.success, "{:?}", result.error);
    assert!(h.origin.has_branch("task/t2"));
    assert_eq!(
        h.origin.author_of("task/t2").expect("author"),
        "autoship-bot <autoship-bot@users.noreply.github.com>"
    );

    let entry = h.store.complete(result).await.expect("apply result");
    assert!(entry.passes);
    assert_eq!(entry.attempts, 1);
    let progress = h.store.progress().await.expect("progress");
    assert!(progress.contains("components are registered in src/index.ts"));
    assert!(progress.contains("src/t2.ts"));

    h.store.enqueue(task("t3")).await.expect("enqueue t3");
    let (next, _) = h.store.next_task().await.expect("next").expect("eligible");
    assert_eq!(next, "t3");
    let request = h.dispatch_one().await;
    assert_eq!(request.task_id, "t3");
    assert!(request.progress_log.contains("components are registered"));
    assert!(h.store.dispatch().await.expect("dispatch").is_none());
}

#[tokio::test]
async fn no_diff_fails_without_commit_or_push() {
    let h = Harness::new();
    h.store.enqueue(task("t1")).await.expect("enqueue");
    let request = h.dispatch_one().await;

    let gate = Arc::new(ScriptedQualityGate::passing());
    let agent = ExecutionAgent::new(
        agent_config(h.workspace.path()),
        Arc::new(ScriptedAgent::completing()),
        gate.clone(),
    );
    let (_, result) = agent.run(request).await;

    assert_eq!(gate.runs(), 1);
    assert!(!result.success);
    assert!(result.tests_pass);
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|e| e.contains(NO_CHANGES_ERROR))
    );
    assert!(!h.origin.has_branch("task/t1"));

    let entry = h.store.complete(result).await.expect("apply result");
    assert_eq!(entry.attempts, 1);
    assert!(!entry.passes);
}

#[tokio::test]
async fn agent_without_completion_marker_still_reaches_quality_gate() {
    let h = Harness::new();
    h.store.enqueue(task("t1")).await.expect("enqueue");
    let request = h.dispatch_one().await;
    assert_eq!(request.max_iterations, 2);

    let backend = Arc::new(ScriptedAgent::silent().writing("src/t1.ts", "export const t1 = 1;\n"));
    let gate = Arc::new(ScriptedQualityGate::passing());
    let agent = ExecutionAgent::new(
        agent_config(h.workspace.path()),
        backend.clone(),
        gate.clone(),
    );
    let (_, result) = agent.run(request.clone()).await;

    assert_eq!(backend.calls(), 2);
    assert_eq!(gate.runs(), 1);
    assert!(result.success, "{:?}", result.error);
    assert!(result.logs.contains("agent did not report completion"));
    assert_eq!(result.dispatch_id, request.dispatch_id);
    assert!(h.origin.has_branch("task/t1"));

    let entry = h.store.complete(result).await.expect("apply result");
    assert!(entry.passes);
}

#[tokio::test]
async fn exhausted_task_is_never_selected() {
    let h = Harness::new();
    h.store.enqueue(task("t1")).await.expect("enqueue");
    for attempt in 1..=3 {
        let request = h.dispatch_one().await;
        assert_eq!(request.task_id, "t1");
        let entry = h
            .store
            .fail(
                "t1",
                request.dispatch_id.as_deref(),
                &format!("attempt {attempt} failed"),
            )
            .await
            .expect("fail");
        assert_eq!(entry.attempts, attempt);
    }

    assert!(h.store.next_task().await.expect("next").is_none());
    assert!(h.store.dispatch().await.expect("dispatch").is_none());
    let ledger = h.store.ledger().await.expect("ledger");
    assert_eq!(ledger.tasks["t1"].attempts, 3);
    assert_eq!(h.dispatcher.requests().len(), 3);
}

#[tokio::test]
async fn agent_error_is_reported_not_raised() {
    let h = Harness::new();
    h.store.enqueue(task("t1")).await.expect("enqueue");
    let request = h.dispatch_one().await;

    let agent = h.agent(
        ScriptedAgent::failing("coding agent timed out after 1800s"),
        ScriptedQualityGate::passing(),
    );
    let (id, result) = agent.run(request).await;
    assert!(!result.success);
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("timed out"))
    );
    let state = agent.status(&id).expect("state");
    assert!(!state.worktree_path.expect("worktree path").exists());
}
