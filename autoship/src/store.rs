//! Task State Store: one single-writer actor per project.
//!
//! Every ledger mutation goes through the actor's mailbox, so handlers never
//! interleave on the same ledger. Mutations are applied to a copy, persisted,
//! and only then swapped in; readers always get whole snapshots.
//!
//! Dispatch is driven by a self-rearming timer. Each firing reclaims stale
//! in-flight entries, dispatches at most one task when capacity allows, and
//! re-arms while the ledger still has eligible or in-flight work.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::ledger::{Callback, Completion, Ledger, LedgerEntry, ProgressEntry};
use crate::core::selector::{is_exhausted, next_eligible};
use crate::core::types::{DEFAULT_MAX_ITERATIONS, ExecutionRequest, ExecutionResult, TaskRecord};
use crate::error::StoreError;
use crate::io::config::StoreConfig;
use crate::io::http::{RetryPolicy, post_json_with_retry};
use crate::io::ledger_store::LedgerStore;

const MAILBOX_CAPACITY: usize = 64;

/// Sends execution requests to an execution agent.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: ExecutionRequest) -> Result<()>;
}

/// Dispatcher that POSTs to `<agent_url>/execute`.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    execute_url: String,
    token: Option<String>,
    policy: RetryPolicy,
}

impl HttpDispatcher {
    pub fn new(agent_url: &str, token: Option<String>, policy: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            execute_url: format!("{}/execute", agent_url.trim_end_matches('/')),
            token,
            policy,
        }
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, request: ExecutionRequest) -> Result<()> {
        post_json_with_retry(
            &self.client,
            &self.execute_url,
            self.token.as_deref(),
            &request,
            &self.policy,
        )
        .await
    }
}

/// What a project's execution requests are built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSettings {
    pub name: String,
    pub repo_url: String,
    pub base_branch: String,
    pub max_iterations: u32,
    pub callback_url: String,
}

/// Runtime knobs of the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOptions {
    pub delay: Duration,
    pub timeout: Duration,
    pub max_in_flight: usize,
    pub max_attempts: u32,
}

impl DispatchOptions {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            delay: Duration::from_millis(config.dispatch_delay_ms),
            timeout: Duration::from_secs(config.dispatch_timeout_secs),
            max_in_flight: config.max_in_flight,
            max_attempts: config.max_attempts,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

enum StoreCommand {
    Enqueue {
        task: TaskRecord,
        reply: Reply<LedgerEntry>,
    },
    Complete {
        result: ExecutionResult,
        reply: Reply<LedgerEntry>,
    },
    Fail {
        task_id: String,
        dispatch_id: Option<String>,
        error: String,
        reply: Reply<LedgerEntry>,
    },
    NextTask {
        reply: Reply<Option<(String, LedgerEntry)>>,
    },
    Ledger {
        reply: Reply<Ledger>,
    },
    Progress {
        reply: Reply<String>,
    },
    AppendProgress {
        entry: ProgressEntry,
        reply: Reply<()>,
    },
    /// `reply` is `None` when the timer fired.
    Dispatch {
        reply: Option<Reply<Option<String>>>,
    },
}

/// Cloneable address of one project actor.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    project: String,
    tx: mpsc::Sender<StoreCommand>,
}

impl std::fmt::Debug for StoreCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Enqueue { .. } => "Enqueue",
            Self::Complete { .. } => "Complete",
            Self::Fail { .. } => "Fail",
            Self::NextTask { .. } => "NextTask",
            Self::Ledger { .. } => "Ledger",
            Self::Progress { .. } => "Progress",
            Self::AppendProgress { .. } => "AppendProgress",
            Self::Dispatch { .. } => "Dispatch",
        };
        f.write_str(name)
    }
}

impl StoreHandle {
    /// Load persisted state and start the actor on the current runtime.
    ///
    /// The timer is armed right away when the reloaded ledger has pending work.
    pub fn spawn(
        settings: ProjectSettings,
        options: DispatchOptions,
        storage: LedgerStore,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<StoreHandle> {
        let ledger = storage.load_ledger()?;
        let progress = storage.load_progress()?;
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = StoreHandle {
            project: settings.name.clone(),
            tx: tx.clone(),
        };
        let mut actor = StoreActor {
            settings,
            options,
            storage,
            dispatcher,
            ledger,
            progress,
            timer_armed: false,
            tx: tx.downgrade(),
        };
        info!(
            project = %actor.settings.name,
            tasks = actor.ledger.tasks.len(),
            version = actor.ledger.version,
            "store actor started"
        );
        if actor.ledger.has_pending_work(actor.options.max_attempts) {
            actor.arm_timer();
        }
        tokio::spawn(actor.run(rx));
        Ok(handle)
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Insert or reset a task and arm the dispatch timer.
    pub async fn enqueue(&self, task: TaskRecord) -> Result<LedgerEntry, StoreError> {
        self.request(|reply| StoreCommand::Enqueue { task, reply })
            .await
    }

    /// Apply an execution result: `success=false` is recorded as a failure.
    ///
    /// A result whose `dispatch_id` no longer matches the entry is ignored and
    /// the current entry is returned unchanged.
    pub async fn complete(&self, result: ExecutionResult) -> Result<LedgerEntry, StoreError> {
        self.request(|reply| StoreCommand::Complete { result, reply })
            .await
    }

    /// Record a failure, either for a specific dispatch or, with no
    /// `dispatch_id`, unconditionally.
    pub async fn fail(
        &self,
        task_id: &str,
        dispatch_id: Option<&str>,
        error: &str,
    ) -> Result<LedgerEntry, StoreError> {
        let task_id = task_id.to_string();
        let dispatch_id = dispatch_id.map(str::to_string);
        let error = error.to_string();
        self.request(|reply| StoreCommand::Fail {
            task_id,
            dispatch_id,
            error,
            reply,
        })
        .await
    }

    /// Peek at the task the next dispatch would pick.
    pub async fn next_task(&self) -> Result<Option<(String, LedgerEntry)>, StoreError> {
        self.request(|reply| StoreCommand::NextTask { reply }).await
    }

    pub async fn ledger(&self) -> Result<Ledger, StoreError> {
        self.request(|reply| StoreCommand::Ledger { reply }).await
    }

    pub async fn progress(&self) -> Result<String, StoreError> {
        self.request(|reply| StoreCommand::Progress { reply }).await
    }

    pub async fn append_progress(&self, entry: ProgressEntry) -> Result<(), StoreError> {
        self.request(|reply| StoreCommand::AppendProgress { entry, reply })
            .await
    }

    /// Run one dispatch cycle now. Returns the dispatched task id, if any.
    pub async fn dispatch(&self) -> Result<Option<String>, StoreError> {
        self.request(|reply| StoreCommand::Dispatch { reply: Some(reply) })
            .await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> StoreCommand,
    ) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| StoreError::ActorClosed(self.project.clone()))?;
        rx.await
            .map_err(|_| StoreError::ActorClosed(self.project.clone()))?
    }
}

struct StoreActor {
    settings: ProjectSettings,
    options: DispatchOptions,
    storage: LedgerStore,
    dispatcher: Arc<dyn Dispatcher>,
    ledger: Ledger,
    progress: String,
    timer_armed: bool,
    tx: mpsc::WeakSender<StoreCommand>,
}

impl StoreActor {
    async fn run(mut self, mut rx: mpsc::Receiver<StoreCommand>) {
        while let Some(command) = rx.recv().await {
            debug!(project = %self.settings.name, ?command, "handling command");
            self.handle(command);
        }
        debug!(project = %self.settings.name, "store actor stopped");
    }

    fn handle(&mut self, command: StoreCommand) {
        match command {
            StoreCommand::Enqueue { task, reply } => {
                let result = self.enqueue(&task);
                let _ = reply.send(result);
            }
            StoreCommand::Complete { result, reply } => {
                let outcome = self.complete(&result);
                let _ = reply.send(outcome);
            }
            StoreCommand::Fail {
                task_id,
                dispatch_id,
                error,
                reply,
            } => {
                let outcome = self.fail(&task_id, dispatch_id.as_deref(), &error);
                let _ = reply.send(outcome);
            }
            StoreCommand::NextTask { reply } => {
                let next = next_eligible(&self.ledger, self.options.max_attempts)
                    .map(|(id, entry)| (id.to_string(), entry.clone()));
                let _ = reply.send(Ok(next));
            }
            StoreCommand::Ledger { reply } => {
                let _ = reply.send(Ok(self.ledger.clone()));
            }
            StoreCommand::Progress { reply } => {
                let _ = reply.send(Ok(self.progress.clone()));
            }
            StoreCommand::AppendProgress { entry, reply } => {
                let _ = reply.send(self.append_progress(&entry));
            }
            StoreCommand::Dispatch { reply } => {
                let from_timer = reply.is_none();
                if from_timer {
                    self.timer_armed = false;
                }
                let outcome = self.dispatch();
                if self.ledger.has_pending_work(self.options.max_attempts) {
                    self.arm_timer();
                }
                match reply {
                    Some(reply) => {
                        let _ = reply.send(outcome);
                    }
                    None => {
                        if let Err(err) = outcome {
                            warn!(project = %self.settings.name, err = %err, "timer dispatch failed");
                        }
                    }
                }
            }
        }
    }

    /// Apply `op` to a copy of the ledger, persist it, then swap it in.
    fn mutate<T>(
        &mut self,
        op: impl FnOnce(&mut Ledger) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut next = self.ledger.clone();
        let out = op(&mut next)?;
        self.storage.save_ledger(&next)?;
        self.ledger = next;
        Ok(out)
    }

    fn entry(&self, task_id: &str) -> Result<LedgerEntry, StoreError> {
        self.ledger
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))
    }

    #[instrument(skip_all, fields(project = %self.settings.name, task_id = %task.id))]
    fn enqueue(&mut self, task: &TaskRecord) -> Result<LedgerEntry, StoreError> {
        self.mutate(|ledger| {
            ledger.enqueue(task, Utc::now());
            Ok(())
        })?;
        info!(version = self.ledger.version, "task enqueued");
        self.arm_timer();
        self.entry(&task.id)
    }

    #[instrument(skip_all, fields(project = %self.settings.name, task_id = %result.task_id, success = result.success))]
    fn complete(&mut self, result: &ExecutionResult) -> Result<LedgerEntry, StoreError> {
        let dispatch_id = result.dispatch_id.as_deref();
        if !result.success {
            let error = result
                .error
                .clone()
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| "execution failed".to_string());
            return self.fail(&result.task_id, dispatch_id, &error);
        }

        let completion = Completion {
            success: true,
            pr_url: result.pr_url.clone(),
            learnings: result.learnings.clone(),
            files_changed: result.files_changed.clone(),
        };
        let mut next = self.ledger.clone();
        let progress =
            match next.complete(&result.task_id, dispatch_id, &completion, Utc::now())? {
                Callback::Applied(progress) => progress,
                Callback::Superseded => {
                    warn!(dispatch_id = ?dispatch_id, "ignoring result of a superseded dispatch");
                    return self.entry(&result.task_id);
                }
            };
        // Progress first: a failed append leaves the ledger untouched, so the
        // caller can retry the whole callback.
        if let Some(entry) = progress {
            self.append_progress(&entry)?;
        }
        self.storage.save_ledger(&next)?;
        self.ledger = next;
        info!(version = self.ledger.version, "task completed");
        if self.ledger.has_pending_work(self.options.max_attempts) {
            self.arm_timer();
        }
        self.entry(&result.task_id)
    }

    #[instrument(skip_all, fields(project = %self.settings.name, task_id))]
    fn fail(
        &mut self,
        task_id: &str,
        dispatch_id: Option<&str>,
        error: &str,
    ) -> Result<LedgerEntry, StoreError> {
        let mut next = self.ledger.clone();
        if let Callback::Superseded = next.fail(task_id, dispatch_id, error, Utc::now())? {
            warn!(dispatch_id = ?dispatch_id, error, "ignoring failure of a superseded dispatch");
            return self.entry(task_id);
        }
        self.storage.save_ledger(&next)?;
        self.ledger = next;
        let entry = self.entry(task_id)?;
        if is_exhausted(&entry, self.options.max_attempts) {
            warn!(attempts = entry.attempts, error, "task exhausted its attempts");
        } else {
            info!(attempts = entry.attempts, error, "task failed, will retry");
        }
        if self.ledger.has_pending_work(self.options.max_attempts) {
            self.arm_timer();
        }
        Ok(entry)
    }

    fn append_progress(&mut self, entry: &ProgressEntry) -> Result<(), StoreError> {
        let mut next = self.progress.clone();
        next.push_str(&entry.render());
        self.storage.save_progress(&next)?;
        self.progress = next;
        debug!(task_id = %entry.task_id, "progress appended");
        Ok(())
    }

    /// Reclaim stale in-flight entries, then dispatch at most one task.
    #[instrument(skip_all, fields(project = %self.settings.name))]
    fn dispatch(&mut self) -> Result<Option<String>, StoreError> {
        let timeout = chrono::Duration::from_std(self.options.timeout)
            .map_err(|err| StoreError::Other(anyhow::anyhow!("dispatch timeout: {err}")))?;
        let now = Utc::now();
        let has_stale = self.ledger.tasks.values().any(|e| {
            e.in_flight && e.dispatched_at.is_some_and(|at| at + timeout <= now)
        });
        if has_stale {
            let reclaimed = self.mutate(|ledger| Ok(ledger.reclaim_stale(timeout, now)))?;
            for task_id in &reclaimed {
                warn!(task_id = %task_id, "dispatch timed out without callback, released");
            }
        }

        let in_flight = self.ledger.in_flight_count();
        if in_flight >= self.options.max_in_flight {
            debug!(in_flight, "at capacity, not dispatching");
            return Ok(None);
        }
        let max_attempts = self.options.max_attempts;
        if next_eligible(&self.ledger, max_attempts).is_none() {
            debug!("nothing eligible to dispatch");
            return Ok(None);
        }
        let dispatch_id = Uuid::new_v4().to_string();
        let Some(dispatched) =
            self.mutate(|ledger| Ok(ledger.begin_dispatch(max_attempts, &dispatch_id, Utc::now())))?
        else {
            return Ok(None);
        };

        let request = ExecutionRequest {
            task_id: dispatched.task_id.clone(),
            repo_url: self.settings.repo_url.clone(),
            base_branch: self.settings.base_branch.clone(),
            branch_name: dispatched.entry.branch_name.clone(),
            prompt: dispatched.entry.description.clone(),
            max_iterations: self.settings.max_iterations,
            callback_url: self.settings.callback_url.clone(),
            progress_log: self.progress.clone(),
            dispatch_id: Some(dispatch_id.clone()),
        };
        info!(
            task_id = %dispatched.task_id,
            dispatch_id = %dispatch_id,
            attempts = dispatched.entry.attempts,
            "dispatching task"
        );
        self.send_detached(request);
        Ok(Some(dispatched.task_id))
    }

    /// Fire-and-forget delivery. A request that cannot be delivered at all is
    /// recorded as a failure of its own dispatch, so it cannot land on a later one.
    fn send_detached(&self, request: ExecutionRequest) {
        let dispatcher = self.dispatcher.clone();
        let tx = self.tx.clone();
        let project = self.settings.name.clone();
        tokio::spawn(async move {
            let task_id = request.task_id.clone();
            let dispatch_id = request.dispatch_id.clone();
            let Err(err) = dispatcher.dispatch(request).await else {
                return;
            };
            warn!(project = %project, task_id = %task_id, err = %err, "dispatch delivery failed");
            let Some(tx) = tx.upgrade() else {
                return;
            };
            let (reply, _) = oneshot::channel();
            let _ = tx
                .send(StoreCommand::Fail {
                    task_id,
                    dispatch_id,
                    error: format!("dispatch failed: {err:#}"),
                    reply,
                })
                .await;
        });
    }

    fn arm_timer(&mut self) {
        if self.timer_armed {
            return;
        }
        self.timer_armed = true;
        let tx = self.tx.clone();
        let delay = self.options.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(StoreCommand::Dispatch { reply: None }).await;
            }
        });
    }
}

/// All configured project actors, addressed by project name.
#[derive(Debug, Clone, Default)]
pub struct ProjectRegistry {
    projects: BTreeMap<String, StoreHandle>,
}

impl ProjectRegistry {
    /// Start one actor per configured project.
    pub fn spawn(config: &StoreConfig, dispatcher: Arc<dyn Dispatcher>) -> Result<Self> {
        let options = DispatchOptions::from_config(config);
        let mut projects = BTreeMap::new();
        for (name, project) in &config.projects {
            let settings = ProjectSettings {
                name: name.clone(),
                repo_url: project.repo_url.clone(),
                base_branch: project.base_branch.clone(),
                max_iterations: project.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
                callback_url: config.callback_url(name),
            };
            let storage = LedgerStore::new(&config.data_dir, name);
            let handle = StoreHandle::spawn(settings, options.clone(), storage, dispatcher.clone())?;
            projects.insert(name.clone(), handle);
        }
        Ok(Self { projects })
    }

    pub fn get(&self, project: &str) -> Result<&StoreHandle, StoreError> {
        self.projects
            .get(project)
            .ok_or_else(|| StoreError::UnknownProject(project.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.projects.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::ProjectConfig;
    use crate::test_support::{RecordingDispatcher, UnreachableDispatcher, task};

    fn settings() -> ProjectSettings {
        ProjectSettings {
            name: "web".to_string(),
            repo_url: "https://example.com/acme/web.git".to_string(),
            base_branch: "main".to_string(),
            max_iterations: 4,
            callback_url: "http://store/projects/web/complete".to_string(),
        }
    }

    fn manual() -> DispatchOptions {
        DispatchOptions {
            delay: Duration::from_secs(3600),
            timeout: Duration::from_secs(3600),
            max_in_flight: 1,
            max_attempts: 3,
        }
    }

    fn spawn(
        dir: &std::path::Path,
        options: DispatchOptions,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> StoreHandle {
        StoreHandle::spawn(
            settings(),
            options,
            LedgerStore::new(dir, "web"),
            dispatcher,
        )
        .expect("spawn")
    }

    fn failure(task_id: &str, error: &str) -> ExecutionResult {
        ExecutionResult {
            task_id: task_id.to_string(),
            success: false,
            pr_url: None,
            error: Some(error.to_string()),
            logs: String::new(),
            learnings: Vec::new(),
            tests_pass: false,
            typecheck_pass: true,
            duration: 10,
            files_changed: Vec::new(),
            dispatch_id: None,
        }
    }

    #[tokio::test]
    async fn re_enqueue_resets_attempts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let store = spawn(temp.path(), manual(), dispatcher.clone());

        store.enqueue(task("t1")).await.expect("enqueue");
        store.dispatch().await.expect("dispatch");
        store.fail("t1", None, "boom").await.expect("fail");
        assert_eq!(store.ledger().await.expect("ledger").tasks["t1"].attempts, 1);

        let entry = store.enqueue(task("t1")).await.expect("re-enqueue");
        assert_eq!(entry.attempts, 0);
        assert!(!entry.passes);
        assert!(entry.error.is_none());
    }

    #[tokio::test]
    async fn dispatch_marks_in_flight_and_sends_one_request() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let store = spawn(temp.path(), manual(), dispatcher.clone());

        store.enqueue(task("t1")).await.expect("enqueue");
        assert_eq!(store.dispatch().await.expect("dispatch"), Some("t1".to_string()));
        // In flight: a second cycle must not pick it again.
        assert_eq!(store.dispatch().await.expect("dispatch"), None);

        let requests = dispatcher.wait_for(1, Duration::from_secs(5)).await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].task_id, "t1");
        assert_eq!(requests[0].branch_name, "task/t1");
        assert_eq!(requests[0].max_iterations, 4);

        let ledger = store.ledger().await.expect("ledger");
        assert_eq!(ledger.tasks["t1"].attempts, 1);
        assert!(ledger.tasks["t1"].in_flight);
        assert!(store.next_task().await.expect("next").is_none());
    }

    #[tokio::test]
    async fn capacity_limits_concurrent_dispatches() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let options = DispatchOptions {
            max_in_flight: 2,
            ..manual()
        };
        let store = spawn(temp.path(), options, dispatcher.clone());
        for id in ["a", "b", "c"] {
            store.enqueue(task(id)).await.expect("enqueue");
        }

        assert_eq!(store.dispatch().await.expect("1"), Some("a".to_string()));
        assert_eq!(store.dispatch().await.expect("2"), Some("b".to_string()));
        assert_eq!(store.dispatch().await.expect("3"), None);
        assert_eq!(store.ledger().await.expect("ledger").in_flight_count(), 2);
    }

    #[tokio::test]
    async fn stale_dispatch_is_reclaimed_and_consumes_the_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let options = DispatchOptions {
            timeout: Duration::from_millis(50),
            ..manual()
        };
        let store = spawn(temp.path(), options, dispatcher.clone());
        store.enqueue(task("t1")).await.expect("enqueue");
        store.dispatch().await.expect("dispatch");

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Reclaim frees the slot; the same cycle dispatches the task again.
        assert_eq!(store.dispatch().await.expect("dispatch"), Some("t1".to_string()));
        let entry = &store.ledger().await.expect("ledger").tasks["t1"];
        assert_eq!(entry.attempts, 2);
        assert_eq!(
            entry.error.as_deref(),
            Some(crate::core::ledger::DISPATCH_TIMEOUT_ERROR)
        );
    }

    #[tokio::test]
    async fn late_callback_from_reclaimed_dispatch_is_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let options = DispatchOptions {
            timeout: Duration::from_millis(300),
            ..manual()
        };
        let store = spawn(temp.path(), options, dispatcher.clone());
        store.enqueue(task("t1")).await.expect("enqueue");
        store.dispatch().await.expect("first dispatch");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.dispatch().await.expect("redispatch"), Some("t1".to_string()));

        let requests = dispatcher.wait_for(2, Duration::from_secs(5)).await;
        assert_eq!(requests.len(), 2);
        let first = requests[0].dispatch_id.clone().expect("first dispatch id");
        let second = requests[1].dispatch_id.clone().expect("second dispatch id");
        assert_ne!(first, second);

        let entry = store
            .fail("t1", Some(&first), "first run failed late")
            .await
            .expect("late fail");
        assert!(entry.in_flight);
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.dispatch_id.as_deref(), Some(second.as_str()));

        let mut late = failure("t1", "");
        late.success = true;
        late.error = None;
        late.dispatch_id = Some(first);
        let entry = store.complete(late).await.expect("late complete");
        assert!(!entry.passes);
        assert!(entry.in_flight);

        // The second run is still in flight, so nothing else may start.
        assert_eq!(store.dispatch().await.expect("dispatch"), None);
        assert_eq!(dispatcher.requests().len(), 2);

        let mut current = failure("t1", "");
        current.success = true;
        current.error = None;
        current.dispatch_id = Some(second);
        let entry = store.complete(current).await.expect("complete");
        assert!(entry.passes);
        assert!(!entry.in_flight);
    }

    #[tokio::test]
    async fn undeliverable_dispatch_fails_its_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = spawn(temp.path(), manual(), Arc::new(UnreachableDispatcher));
        store.enqueue(task("t1")).await.expect("enqueue");
        assert_eq!(store.dispatch().await.expect("dispatch"), Some("t1".to_string()));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let entry = loop {
            let entry = store.ledger().await.expect("ledger").tasks["t1"].clone();
            if !entry.in_flight || std::time::Instant::now() >= deadline {
                break entry;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(!entry.in_flight);
        assert_eq!(entry.attempts, 1);
        assert!(
            entry
                .error
                .as_deref()
                .is_some_and(|e| e.starts_with("dispatch failed:")),
            "{:?}",
            entry.error
        );
        assert!(store.next_task().await.expect("next").is_some());
    }

    #[tokio::test]
    async fn progress_write_failure_leaves_ledger_untouched() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = spawn(temp.path(), manual(), Arc::new(RecordingDispatcher::default()));
        store.enqueue(task("t1")).await.expect("enqueue");
        let blocker = temp.path().join("web").join("progress.md");
        std::fs::create_dir_all(blocker.join("occupied")).expect("block progress file");

        let mut result = failure("t1", "");
        result.success = true;
        result.error = None;
        result.learnings = vec!["x".to_string()];
        assert!(store.complete(result.clone()).await.is_err());
        let ledger = store.ledger().await.expect("ledger");
        assert!(!ledger.tasks["t1"].passes);
        assert_eq!(ledger.version, 1);

        std::fs::remove_dir_all(&blocker).expect("unblock");
        let entry = store.complete(result).await.expect("retry");
        assert!(entry.passes);
        assert_eq!(store.progress().await.expect("progress").matches("- x").count(), 1);
    }

    #[tokio::test]
    async fn complete_appends_progress_only_with_learnings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let store = spawn(temp.path(), manual(), dispatcher);
        store.enqueue(task("a")).await.expect("enqueue");
        store.enqueue(task("b")).await.expect("enqueue");

        let mut result = failure("a", "");
        result.success = true;
        result.error = None;
        store.complete(result.clone()).await.expect("complete a");
        assert_eq!(store.progress().await.expect("progress"), "");

        result.task_id = "b".to_string();
        result.learnings = vec!["x".to_string()];
        result.files_changed = vec!["src/b.ts".to_string()];
        let entry = store.complete(result).await.expect("complete b");
        assert!(entry.passes);
        let progress = store.progress().await.expect("progress");
        assert_eq!(progress.matches("\n---\n").count(), 1);
        assert!(progress.contains("- x"));
        assert!(progress.contains("src/b.ts"));
    }

    #[tokio::test]
    async fn unsuccessful_result_is_recorded_as_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let store = spawn(temp.path(), manual(), dispatcher);
        store.enqueue(task("t1")).await.expect("enqueue");
        store.dispatch().await.expect("dispatch");

        let entry = store
            .complete(failure("t1", "tests failed"))
            .await
            .expect("complete");
        assert!(!entry.passes);
        assert!(!entry.in_flight);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.error.as_deref(), Some("tests failed"));
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = spawn(temp.path(), manual(), Arc::new(RecordingDispatcher::default()));
        let err = store.fail("missing", None, "boom").await.unwrap_err();
        assert!(matches!(err, StoreError::TaskNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn timer_dispatches_after_enqueue() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let options = DispatchOptions {
            delay: Duration::from_millis(10),
            ..manual()
        };
        let store = spawn(temp.path(), options, dispatcher.clone());
        store.enqueue(task("t1")).await.expect("enqueue");

        let requests = dispatcher.wait_for(1, Duration::from_secs(5)).await;
        assert_eq!(requests.len(), 1);
        // Still only one while the first is in flight.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn state_survives_actor_restart() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let store = spawn(temp.path(), manual(), Arc::new(RecordingDispatcher::default()));
            store.enqueue(task("t1")).await.expect("enqueue");
            store.dispatch().await.expect("dispatch");
        }
        let store = spawn(temp.path(), manual(), Arc::new(RecordingDispatcher::default()));
        let ledger = store.ledger().await.expect("ledger");
        assert_eq!(ledger.tasks["t1"].attempts, 1);
        assert!(ledger.tasks["t1"].in_flight);
    }

    #[tokio::test]
    async fn registry_rejects_unknown_projects() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = StoreConfig {
            data_dir: temp.path().to_path_buf(),
            ..StoreConfig::default()
        };
        config.projects.insert(
            "web".to_string(),
            ProjectConfig {
                repo_url: "https://example.com/acme/web.git".to_string(),
                ..ProjectConfig::default()
            },
        );
        let registry =
            ProjectRegistry::spawn(&config, Arc::new(RecordingDispatcher::default())).expect("spawn");
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["web"]);
        assert!(registry.get("web").is_ok());
        assert!(matches!(
            registry.get("api"),
            Err(StoreError::UnknownProject(_))
        ));
    }
}
