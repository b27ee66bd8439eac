//! Work-stealing graph executor.
//!
//! Each worker owns a deque. Workers pop from the head of their own queue
//! and steal from the tail of a randomly chosen victim when it runs dry.
//! Finishing a task pushes its newly ready dependents onto the local queue
//! of the worker that finished it. The run ends when no task is left
//! pending, ready or running.

mod retry;
mod worker;

pub use retry::RetryPolicy;

use crate::audit::Emitter;
use crate::graph::TaskGraph;
use crate::metrics::Metrics;
use crate::policy::{AllowAll, TaskValidator};
use crate::types::{ExecutionResult, TaskError, TaskStatus};
use chrono::Utc;
use parking_lot::Mutex;
use plexus_core::{ActionRegistry, OrchestrationEvent, PlexusResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;
use worker::{run_worker, RunState, Shared};

/// How many workers a run uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One worker; tasks run one at a time.
    Sequential,
    /// The full pool from the start.
    Parallel,
    /// One worker until the backlog exceeds the threshold, then the full pool.
    #[default]
    Adaptive,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::Parallel => write!(f, "parallel"),
            ExecutionMode::Adaptive => write!(f, "adaptive"),
        }
    }
}

/// Tuning knobs of an [`Executor`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorOptions {
    pub mode: ExecutionMode,
    /// Pool size for parallel and adaptive modes.
    pub workers: usize,
    pub adaptive_threshold: usize,
    /// Per-attempt timeout for tasks that do not set their own.
    pub default_timeout: Duration,
    pub retry: RetryPolicy,
    /// How long in-flight tasks may keep running after cancellation.
    pub cancellation_grace: Duration,
    /// Upper bound on how long an idle worker sleeps between queue checks.
    pub idle_poll: Duration,
    /// Seed for steal-victim selection; random when unset.
    pub steal_seed: Option<u64>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Adaptive,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            adaptive_threshold: 4,
            default_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            cancellation_grace: Duration::from_secs(2),
            idle_poll: Duration::from_millis(5),
            steal_seed: None,
        }
    }
}

impl ExecutorOptions {
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_steal_seed(mut self, seed: u64) -> Self {
        self.steal_seed = Some(seed);
        self
    }

    fn pool_size(&self) -> usize {
        match self.mode {
            ExecutionMode::Sequential => 1,
            ExecutionMode::Parallel | ExecutionMode::Adaptive => self.workers.max(1),
        }
    }

    fn initially_active(&self, ready: usize) -> usize {
        match self.mode {
            ExecutionMode::Sequential => 1,
            ExecutionMode::Parallel => self.pool_size(),
            ExecutionMode::Adaptive if ready > self.adaptive_threshold => self.pool_size(),
            ExecutionMode::Adaptive => 1,
        }
    }
}

/// Runs task graphs against an [`ActionRegistry`].
pub struct Executor {
    registry: Arc<dyn ActionRegistry>,
    validator: Arc<dyn TaskValidator>,
    metrics: Arc<Metrics>,
    emitter: Emitter,
    options: ExecutorOptions,
}

impl Executor {
    pub fn new(registry: Arc<dyn ActionRegistry>, metrics: Arc<Metrics>) -> Self {
        let emitter = Emitter::disabled(metrics.clone());
        Self {
            registry,
            validator: Arc::new(AllowAll),
            metrics,
            emitter,
            options: ExecutorOptions::default(),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn TaskValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Run `graph` to completion. See [`Executor::execute_with`].
    pub async fn execute(&self, graph: &mut TaskGraph) -> PlexusResult<ExecutionResult> {
        self.execute_with(graph, CancellationToken::new(), None).await
    }

    /// Run `graph` until every task is terminal or `cancel` fires.
    ///
    /// The graph is validated first; a structural error is returned before
    /// anything runs. Per-task failures are recorded on the tasks and in the
    /// returned [`ExecutionResult`], never raised. After cancellation,
    /// in-flight tasks get the configured grace period; whatever is still
    /// unfinished afterwards ends `Blocked`.
    pub async fn execute_with(
        &self,
        graph: &mut TaskGraph,
        cancel: CancellationToken,
        session_id: Option<String>,
    ) -> PlexusResult<ExecutionResult> {
        graph.validate()?;
        let started = Instant::now();
        let run_id = Uuid::new_v4();

        let mut state = RunState::new(std::mem::take(graph));
        let seeded = Self::seed(&mut state);
        let skipped_upfront = seeded.skipped;
        let ready = seeded.ready;

        let pool = self.options.pool_size();
        let active = self.options.initially_active(ready.len());
        info!(
            run_id = %run_id,
            tasks = state.graph.len(),
            mode = %self.options.mode,
            workers = pool,
            active,
            "Execution started"
        );

        let done = CancellationToken::new();
        if state.remaining == 0 {
            done.cancel();
        }

        let mut queues: Vec<VecDeque<_>> = (0..pool).map(|_| VecDeque::new()).collect();
        for (i, id) in ready.into_iter().enumerate() {
            queues[i % active].push_back(id);
        }
        let queued: usize = queues.iter().map(VecDeque::len).sum();

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            queues: queues.into_iter().map(Mutex::new).collect(),
            queued: AtomicUsize::new(queued),
            active_workers: AtomicUsize::new(active),
            work_available: Notify::new(),
            scale_up: Notify::new(),
            done,
            cancel: cancel.clone(),
            registry: self.registry.clone(),
            validator: self.validator.clone(),
            metrics: self.metrics.clone(),
            emitter: self.emitter.clone(),
            options: self.options.clone(),
            run_id,
            session_id,
        });
        let restore = GraphRestore {
            slot: graph,
            shared: Some(shared.clone()),
        };
        for _ in 0..skipped_upfront {
            self.metrics.record_task_skipped();
        }

        let seed = self.options.steal_seed.unwrap_or_else(rand::random);
        let mut workers = JoinSet::new();
        for idx in 0..pool {
            workers.spawn(run_worker(shared.clone(), idx, seed));
        }

        let cancelled = self.supervise(&shared, &mut workers, &cancel).await;

        if cancelled {
            warn!(run_id = %run_id, "Execution cancelled, waiting for in-flight tasks");
            let grace = self.options.cancellation_grace;
            let drained = tokio::time::timeout(grace, async {
                while workers.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    run_id = %run_id,
                    grace_ms = grace.as_millis() as u64,
                    "Grace period elapsed, aborting workers"
                );
                workers.abort_all();
            }
        }
        while workers.join_next().await.is_some() {}

        let mut graph_out = {
            let mut state = shared.state.lock();
            std::mem::take(&mut state.graph)
        };
        self.sweep(&mut graph_out, cancelled);

        let elapsed = started.elapsed();
        self.metrics.record_execution(elapsed);
        let result = ExecutionResult::from_graph(&graph_out, elapsed, cancelled);
        restore.finish(graph_out);
        info!(
            run_id = %run_id,
            success = result.success,
            completed = result.completed_task_ids.len(),
            failed = result.failed_task_ids.len(),
            skipped = result.skipped_task_ids.len(),
            blocked = result.blocked_task_ids.len(),
            duration_ms = elapsed.as_millis() as u64,
            "Execution finished"
        );
        Ok(result)
    }

    /// Wait for the run to finish, be cancelled, or lose every worker.
    /// Returns whether the run was cancelled.
    async fn supervise(
        &self,
        shared: &Arc<Shared>,
        workers: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = shared.done.cancelled() => return false,
                _ = cancel.cancelled() => return true,
                joined = workers.join_next() => match joined {
                    Some(Err(e)) if e.is_panic() => {
                        error!(error = %e, "Worker panicked");
                        // Its queue may still hold work; let the idle
                        // workers steal it.
                        shared.open_pool();
                    }
                    Some(_) => {}
                    None => {
                        // Every worker is gone but the run is not done.
                        return cancel.is_cancelled();
                    }
                },
            }
        }
    }

    /// Reset leftovers from a previous run, settle tasks whose dependencies
    /// already ended badly, and mark the initial ready set.
    fn seed(state: &mut RunState) -> Seeded {
        let ids = state.graph.ids().to_vec();
        for id in &ids {
            if let Some(task) = state.graph.get_mut(id.as_str()) {
                if matches!(task.status, TaskStatus::Ready | TaskStatus::Running) {
                    task.status = TaskStatus::Pending;
                }
            }
        }
        state.remaining = state
            .graph
            .tasks()
            .filter(|t| !t.status.is_terminal())
            .count();

        let mut skipped = 0;
        let mut released = Vec::new();
        for id in &ids {
            if state
                .graph
                .status_of(id.as_str())
                .is_some_and(TaskStatus::is_unsuccessful)
            {
                let (s, r) = state.settle_unsuccessful(id);
                skipped += s.len();
                released.extend(r);
            }
        }

        let mut ready: Vec<_> = state
            .graph
            .ready_set()
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        ready.extend(released);
        ready.sort_by_key(|id| {
            std::cmp::Reverse(state.graph.get(id.as_str()).map_or(0, |t| t.priority))
        });
        for id in &ready {
            if let Some(task) = state.graph.get_mut(id.as_str()) {
                task.status = TaskStatus::Ready;
            }
        }
        Seeded { ready, skipped }
    }

    /// Anything still non-terminal after the workers stopped ends `Blocked`.
    fn sweep(&self, graph: &mut TaskGraph, cancelled: bool) {
        let ids = graph.ids().to_vec();
        for id in ids {
            let Some(task) = graph.get_mut(id.as_str()) else {
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }
            let error = if cancelled {
                TaskError::Cancelled
            } else {
                TaskError::WorkerLost
            };
            let reason = error.to_string();
            task.status = TaskStatus::Blocked;
            task.error = Some(error);
            task.finished_at = Some(Utc::now());
            self.metrics.record_task_blocked();
            self.emitter.emit(OrchestrationEvent::TaskBlocked {
                task_id: id.to_string(),
                reason,
                timestamp: Utc::now(),
            });
        }
    }
}

/// Hands the graph back to the caller's slot. If the run future is dropped
/// before it finishes, the slot gets a snapshot of the shared state with
/// unfinished tasks back at `Pending`.
struct GraphRestore<'g> {
    slot: &'g mut TaskGraph,
    shared: Option<Arc<Shared>>,
}

impl GraphRestore<'_> {
    fn finish(mut self, graph: TaskGraph) {
        self.shared = None;
        *self.slot = graph;
    }
}

impl Drop for GraphRestore<'_> {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let mut snapshot = shared.state.lock().graph.clone();
        let ids = snapshot.ids().to_vec();
        for id in ids {
            if let Some(task) = snapshot.get_mut(id.as_str()) {
                if matches!(task.status, TaskStatus::Ready | TaskStatus::Running) {
                    task.status = TaskStatus::Pending;
                }
            }
        }
        warn!(tasks = snapshot.len(), "Execution dropped before finishing, graph restored");
        *self.slot = snapshot;
    }
}

struct Seeded {
    ready: Vec<crate::types::TaskId>,
    skipped: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::policy::{ActionPolicy, Decision, ValidationContext};
    use crate::registry::{FnAction, LocalActionRegistry};
    use crate::types::{Task, TaskId};
    use async_trait::async_trait;
    use plexus_core::{ActionError, ActionInvocation};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor_with(registry: LocalActionRegistry, options: ExecutorOptions) -> (Executor, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let executor = Executor::new(Arc::new(registry), metrics.clone()).with_options(options);
        (executor, metrics)
    }

    fn echo_registry(names: &[&str]) -> LocalActionRegistry {
        let mut registry = LocalActionRegistry::new();
        for name in names {
            let name = name.to_string();
            registry.register(Arc::new(FnAction::new(name.clone(), move |inv: ActionInvocation| {
                let name = name.clone();
                async move { Ok(serde_json::json!({ "action": name, "task": inv.task_id })) }
            })));
        }
        registry
    }

    fn fast() -> ExecutorOptions {
        ExecutorOptions::default()
            .with_retry(RetryPolicy::immediate())
            .with_steal_seed(7)
    }

    #[tokio::test]
    async fn test_empty_graph_finishes_immediately() {
        let (executor, _) = executor_with(LocalActionRegistry::new(), fast());
        let mut graph = TaskGraph::new();
        let result = executor.execute(&mut graph).await.unwrap();
        assert!(result.success);
        assert!(result.completed_task_ids.is_empty());
    }

    #[tokio::test]
    async fn test_cyclic_graph_rejected_before_running() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut registry = LocalActionRegistry::new();
        registry.register(Arc::new(FnAction::new("x", move |_inv: ActionInvocation| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(serde_json::Value::Null) }
        })));
        let (executor, _) = executor_with(registry, fast());

        let mut graph = TaskGraph::from_tasks(vec![
            Task::new("a", "x").depends_on("b"),
            Task::new("b", "x").depends_on("a"),
        ])
        .unwrap();
        assert!(executor.execute(&mut graph).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sequential_chain_passes_inputs() {
        let mut registry = echo_registry(&["fetch"]);
        registry.register(Arc::new(FnAction::new("summarize", |inv: ActionInvocation| async move {
            let fetched = inv.inputs.get("fetch").cloned().unwrap_or_default();
            Ok(serde_json::json!({ "summary_of": fetched["task"] }))
        })));
        let (executor, metrics) =
            executor_with(registry, fast().with_mode(ExecutionMode::Sequential));

        let mut graph = TaskGraph::from_tasks(vec![
            Task::new("fetch", "fetch"),
            Task::new("summarize", "summarize").depends_on("fetch"),
        ])
        .unwrap();
        let result = executor.execute(&mut graph).await.unwrap();

        assert!(result.success);
        assert_eq!(
            result.completed_task_ids,
            vec![TaskId::from("fetch"), TaskId::from("summarize")]
        );
        assert_eq!(
            graph.get("summarize").unwrap().result,
            Some(serde_json::json!({ "summary_of": "fetch" }))
        );
        assert_eq!(metrics.snapshot().execution.tasks_completed, 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let (executor, _) = executor_with(LocalActionRegistry::new(), fast());
        let mut graph = TaskGraph::from_tasks(vec![Task::new("a", "missing")]).unwrap();
        let result = executor.execute(&mut graph).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.attempts[&TaskId::from("a")], 1);
        assert_eq!(
            result.errors[&TaskId::from("a")],
            TaskError::Action(ActionError::NotFound("missing".into()))
        );
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let mut registry = LocalActionRegistry::new();
        registry.register(Arc::new(FnAction::new("slow", |inv: ActionInvocation| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(serde_json::json!("late")),
                _ = inv.cancel.cancelled() => Err(ActionError::Internal("cancelled".into())),
            }
        })));
        let (executor, metrics) = executor_with(registry, fast());

        let mut graph = TaskGraph::from_tasks(vec![Task::new("a", "slow")
            .with_timeout(Duration::from_millis(20))
            .with_max_retries(1)])
        .unwrap();
        let result = executor.execute(&mut graph).await.unwrap();

        assert_eq!(result.failed_task_ids, vec![TaskId::from("a")]);
        assert_eq!(result.attempts[&TaskId::from("a")], 2);
        assert!(matches!(
            result.errors[&TaskId::from("a")],
            TaskError::Action(ActionError::Timeout { after_ms: 20 })
        ));
        assert_eq!(metrics.snapshot().execution.tasks_timed_out, 2);
    }

    #[tokio::test]
    async fn test_policy_denial_blocks_and_skips_dependents() {
        let registry = echo_registry(&["shell", "report"]);
        let (executor, metrics) = executor_with(registry, fast());
        let executor = executor.with_validator(Arc::new(ActionPolicy::new().deny("shell")));

        let mut graph = TaskGraph::from_tasks(vec![
            Task::new("run", "shell"),
            Task::new("report", "report").depends_on("run"),
        ])
        .unwrap();
        let result = executor.execute(&mut graph).await.unwrap();

        assert_eq!(result.blocked_task_ids, vec![TaskId::from("run")]);
        assert_eq!(result.skipped_task_ids, vec![TaskId::from("report")]);
        assert!(matches!(
            result.errors[&TaskId::from("run")],
            TaskError::Denied { .. }
        ));
        assert!(result.attempts.is_empty());
        assert!(graph.get("run").unwrap().started_at.is_none());
        assert!(matches!(
            result.ensure_success(),
            Err(plexus_core::PlexusError::ValidationDenied { ref task_id, .. }) if task_id == "run"
        ));
        let snap = metrics.snapshot();
        assert_eq!(snap.execution.tasks_blocked, 1);
        assert_eq!(snap.execution.tasks_skipped, 1);
        assert_eq!(snap.execution.tasks_started, 0);
    }

    struct ApprovalGate;

    #[async_trait]
    impl TaskValidator for ApprovalGate {
        async fn validate(&self, task: &Task, context: &ValidationContext) -> Decision {
            assert_eq!(context.attempt, 1);
            if task.action == "email" {
                Decision::RequireApproval("outbound mail".into())
            } else {
                Decision::Allow
            }
        }
    }

    #[tokio::test]
    async fn test_require_approval_blocks_pending_review() {
        let registry = echo_registry(&["fetch", "email"]);
        let (executor, _) = executor_with(registry, fast());
        let executor = executor.with_validator(Arc::new(ApprovalGate));

        let mut graph = TaskGraph::from_tasks(vec![
            Task::new("fetch", "fetch"),
            Task::new("email", "email").depends_on("fetch"),
        ])
        .unwrap();
        let result = executor.execute(&mut graph).await.unwrap();
        assert_eq!(result.completed_task_ids, vec![TaskId::from("fetch")]);
        assert_eq!(
            result.errors[&TaskId::from("email")],
            TaskError::AwaitingApproval {
                reason: "outbound mail".into()
            }
        );
        assert_eq!(result.attempts.get(&TaskId::from("fetch")), Some(&1));
        assert!(!result.attempts.contains_key(&TaskId::from("email")));
    }

    /// Panics while checking one task.
    struct PanickingGate;

    #[async_trait]
    impl TaskValidator for PanickingGate {
        async fn validate(&self, task: &Task, _context: &ValidationContext) -> Decision {
            if task.id.as_str() == "boom" {
                panic!("policy backend unreachable");
            }
            Decision::Allow
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panicking_validator_loses_only_its_task() {
        for mode in [ExecutionMode::Parallel, ExecutionMode::Adaptive] {
            let registry = echo_registry(&["x"]);
            let options = fast().with_mode(mode).with_workers(2);
            let (executor, _) = executor_with(registry, options);
            let executor = executor.with_validator(Arc::new(PanickingGate));

            let mut graph = TaskGraph::from_tasks(vec![
                Task::new("boom", "x").with_priority(5),
                Task::new("after", "x").depends_on("boom"),
                Task::new("other", "x"),
                Task::new("tail", "x").depends_on("other"),
            ])
            .unwrap();
            let result = tokio::time::timeout(Duration::from_secs(5), executor.execute(&mut graph))
                .await
                .expect("run must finish after a worker panic")
                .unwrap();

            assert_eq!(result.blocked_task_ids, vec![TaskId::from("boom")], "{mode}");
            assert_eq!(result.errors[&TaskId::from("boom")], TaskError::WorkerLost);
            assert_eq!(result.skipped_task_ids, vec![TaskId::from("after")], "{mode}");
            let mut completed = result.completed_task_ids.clone();
            completed.sort();
            assert_eq!(completed, vec![TaskId::from("other"), TaskId::from("tail")], "{mode}");
            assert!(!result.cancelled);
        }
    }

    #[tokio::test]
    async fn test_dropped_run_leaves_graph_inspectable() {
        let mut registry = echo_registry(&["quick"]);
        registry.register(Arc::new(FnAction::new("slow", |_inv: ActionInvocation| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(serde_json::Value::Null)
        })));
        let options = fast().with_mode(ExecutionMode::Sequential);
        let (executor, _) = executor_with(registry, options);

        let mut graph = TaskGraph::from_tasks(vec![
            Task::new("a", "quick"),
            Task::new("b", "slow").depends_on("a"),
            Task::new("c", "quick").depends_on("b"),
        ])
        .unwrap();
        let outcome =
            tokio::time::timeout(Duration::from_millis(200), executor.execute(&mut graph)).await;
        assert!(outcome.is_err());

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.status_of("a"), Some(TaskStatus::Completed));
        assert!(graph.get("a").unwrap().result.is_some());
        assert_eq!(graph.status_of("b"), Some(TaskStatus::Pending));
        assert_eq!(graph.status_of("c"), Some(TaskStatus::Pending));

        // The restored graph can be run again.
        let (executor, _) = executor_with(echo_registry(&["quick", "slow"]), fast());
        let result = executor.execute(&mut graph).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_panicking_action_is_worker_lost() {
        let mut registry = LocalActionRegistry::new();
        registry.register(Arc::new(FnAction::new("boom", |_inv: ActionInvocation| async {
            if true {
                panic!("action exploded");
            }
            Ok(serde_json::Value::Null)
        })));
        let (executor, _) = executor_with(registry, fast());

        let mut graph = TaskGraph::from_tasks(vec![Task::new("a", "boom")]).unwrap();
        let result = executor.execute(&mut graph).await.unwrap();
        assert_eq!(result.blocked_task_ids, vec![TaskId::from("a")]);
        assert_eq!(result.errors[&TaskId::from("a")], TaskError::WorkerLost);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancellation_blocks_unfinished_tasks() {
        let mut registry = LocalActionRegistry::new();
        registry.register(Arc::new(FnAction::new("wait", |inv: ActionInvocation| async move {
            inv.cancel.cancelled().await;
            Err(ActionError::Internal("cancelled".into()))
        })));
        let options = fast()
            .with_mode(ExecutionMode::Parallel)
            .with_workers(2);
        let (executor, _) = executor_with(registry, options);

        let mut graph = TaskGraph::from_tasks(vec![
            Task::new("a", "wait"),
            Task::new("b", "wait").depends_on("a"),
        ])
        .unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let result = executor.execute_with(&mut graph, cancel, None).await.unwrap();
        assert!(result.cancelled);
        assert!(!result.success);
        // a is asked to stop and fails without retry; b never ran.
        assert_eq!(result.failed_task_ids, vec![TaskId::from("a")]);
        assert_eq!(result.skipped_task_ids, vec![TaskId::from("b")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_adaptive_starts_wide_on_large_ready_set() {
        let registry = echo_registry(&["x"]);
        let options = fast()
            .with_mode(ExecutionMode::Adaptive)
            .with_workers(4);
        let (executor, metrics) = executor_with(registry, options);

        let tasks: Vec<Task> = (0..12).map(|i| Task::new(format!("t{i}"), "x")).collect();
        let mut graph = TaskGraph::from_tasks(tasks).unwrap();
        assert_eq!(executor.options().initially_active(graph.len()), 4);
        let result = executor.execute(&mut graph).await.unwrap();
        assert!(result.success);
        assert_eq!(result.completed_task_ids.len(), 12);
        assert_eq!(metrics.snapshot().execution.tasks_completed, 12);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_adaptive_scales_up_when_work_fans_out() {
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let mut registry = echo_registry(&["root"]);
        let (r, p) = (running.clone(), peak.clone());
        registry.register(Arc::new(FnAction::new("leaf", move |_inv: ActionInvocation| {
            let (running, peak) = (r.clone(), p.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }
        })));
        let mut options = fast().with_mode(ExecutionMode::Adaptive).with_workers(4);
        options.adaptive_threshold = 2;
        let (executor, metrics) = executor_with(registry, options);

        let mut tasks = vec![Task::new("root", "root")];
        tasks.extend((0..6).map(|i| Task::new(format!("leaf{i}"), "leaf").depends_on("root")));
        let mut graph = TaskGraph::from_tasks(tasks).unwrap();
        assert_eq!(executor.options().initially_active(1), 1);

        let result = executor.execute(&mut graph).await.unwrap();
        assert!(result.success);
        assert!(peak.load(Ordering::SeqCst) > 1, "backlog must open the pool mid-run");
        assert!(metrics.snapshot().execution.steals > 0);
    }

    #[tokio::test]
    async fn test_rerun_resets_stale_running_state() {
        let registry = echo_registry(&["x"]);
        let (executor, _) = executor_with(registry, fast());
        let mut graph = TaskGraph::from_tasks(vec![Task::new("a", "x")]).unwrap();
        graph.get_mut("a").unwrap().status = TaskStatus::Running;
        let result = executor.execute(&mut graph).await.unwrap();
        assert!(result.success);
    }

    #[test]
    fn test_initially_active_workers() {
        let options = ExecutorOptions::default().with_workers(8);
        assert_eq!(options.clone().with_mode(ExecutionMode::Sequential).initially_active(100), 1);
        assert_eq!(options.clone().with_mode(ExecutionMode::Parallel).initially_active(1), 8);
        assert_eq!(options.clone().with_mode(ExecutionMode::Adaptive).initially_active(3), 1);
        assert_eq!(options.with_mode(ExecutionMode::Adaptive).initially_active(5), 8);
    }
}
