use super::ExecutorOptions;
use crate::audit::Emitter;
use crate::graph::TaskGraph;
use crate::metrics::Metrics;
use crate::policy::{Decision, TaskValidator, ValidationContext};
use crate::types::{TaskError, TaskId, TaskStatus};
use chrono::Utc;
use parking_lot::Mutex;
use plexus_core::{ActionError, ActionInvocation, ActionRegistry, OrchestrationEvent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Graph plus the bookkeeping that must change atomically with it.
pub(super) struct RunState {
    pub graph: TaskGraph,
    pub dependents: HashMap<TaskId, Vec<TaskId>>,
    /// Tasks not yet in a terminal state.
    pub remaining: usize,
}

impl RunState {
    pub fn new(graph: TaskGraph) -> Self {
        let dependents = graph.dependents_map();
        Self {
            graph,
            dependents,
            remaining: 0,
        }
    }

    /// Mark every eligible dependent of `id` as `Ready` and return them.
    pub fn release_dependents(&mut self, id: &TaskId) -> Vec<TaskId> {
        let mut ready = Vec::new();
        let Some(dependents) = self.dependents.get(id) else {
            return ready;
        };
        for dependent in dependents {
            let eligible = self
                .graph
                .get(dependent.as_str())
                .is_some_and(|t| self.graph.is_eligible(t));
            if eligible {
                if let Some(task) = self.graph.get_mut(dependent.as_str()) {
                    task.status = TaskStatus::Ready;
                    ready.push(dependent.clone());
                }
            }
        }
        ready
    }

    /// After `id` ended without a result: skip every pending dependent that
    /// required it (transitively) and release those that only had an
    /// optional edge to it. Returns `(skipped, ready)`.
    pub fn settle_unsuccessful(&mut self, id: &TaskId) -> (Vec<TaskId>, Vec<TaskId>) {
        let mut skipped = Vec::new();
        let mut ready = Vec::new();
        let mut stack = vec![id.clone()];

        while let Some(current) = stack.pop() {
            let Some(dependents) = self.dependents.get(&current).cloned() else {
                continue;
            };
            for dependent in dependents {
                let Some(task) = self.graph.get(dependent.as_str()) else {
                    continue;
                };
                if task.status != TaskStatus::Pending {
                    continue;
                }
                let required_failed = task.dependencies.iter().any(|dep| {
                    !dep.optional
                        && self
                            .graph
                            .status_of(dep.task_id.as_str())
                            .is_some_and(TaskStatus::is_unsuccessful)
                });
                let eligible = self.graph.is_eligible(task);

                if let Some(task) = self.graph.get_mut(dependent.as_str()) {
                    if required_failed {
                        task.status = TaskStatus::Skipped;
                        task.finished_at = Some(Utc::now());
                        self.remaining -= 1;
                        skipped.push(dependent.clone());
                        stack.push(dependent);
                    } else if eligible {
                        task.status = TaskStatus::Ready;
                        ready.push(dependent);
                    }
                }
            }
        }
        (skipped, ready)
    }

    /// Results of the completed dependencies of `id`, keyed by dependency id.
    pub fn inputs_for(&self, id: &str) -> HashMap<String, Value> {
        let mut inputs = HashMap::new();
        let Some(task) = self.graph.get(id) else {
            return inputs;
        };
        for dep in &task.dependencies {
            if let Some(result) = self
                .graph
                .get(dep.task_id.as_str())
                .filter(|d| d.status == TaskStatus::Completed)
                .and_then(|d| d.result.clone())
            {
                inputs.insert(dep.task_id.to_string(), result);
            }
        }
        inputs
    }
}

/// State shared by every worker of one run.
pub(super) struct Shared {
    pub state: Mutex<RunState>,
    pub queues: Vec<Mutex<VecDeque<TaskId>>>,
    pub queued: AtomicUsize,
    pub active_workers: AtomicUsize,
    pub work_available: Notify,
    pub scale_up: Notify,
    /// Fired when no task is left to run.
    pub done: CancellationToken,
    /// Fired by the caller to cancel the run.
    pub cancel: CancellationToken,
    pub registry: Arc<dyn ActionRegistry>,
    pub validator: Arc<dyn TaskValidator>,
    pub metrics: Arc<Metrics>,
    pub emitter: Emitter,
    pub options: ExecutorOptions,
    pub run_id: Uuid,
    pub session_id: Option<String>,
}

enum Attempt {
    Finished(Result<Value, ActionError>),
    TimedOut(Duration),
    Lost(String),
}

impl Shared {
    fn stopping(&self) -> bool {
        self.done.is_cancelled() || self.cancel.is_cancelled()
    }

    /// Push tasks onto worker `idx`'s queue, highest priority first.
    pub fn push_local(&self, idx: usize, mut ids: Vec<TaskId>) {
        if ids.is_empty() {
            return;
        }
        {
            let state = self.state.lock();
            ids.sort_by_key(|id| {
                std::cmp::Reverse(state.graph.get(id.as_str()).map_or(0, |t| t.priority))
            });
        }
        let count = ids.len();
        {
            let mut queue = self.queues[idx].lock();
            queue.extend(ids);
        }
        let queued = self.queued.fetch_add(count, Ordering::SeqCst) + count;
        self.maybe_scale_up(queued);
        self.work_available.notify_waiters();
    }

    /// Adaptive mode: open the full pool once the backlog exceeds the
    /// threshold.
    fn maybe_scale_up(&self, queued: usize) {
        if self.options.mode != super::ExecutionMode::Adaptive {
            return;
        }
        if queued > self.options.adaptive_threshold && self.open_pool() {
            info!(queued, workers = self.queues.len(), "Backlog above threshold, scaling to full pool");
        }
    }

    /// Activate every worker of the pool. Returns whether any was idle.
    pub fn open_pool(&self) -> bool {
        let target = self.queues.len();
        if self.active_workers.load(Ordering::SeqCst) >= target {
            return false;
        }
        self.active_workers.store(target, Ordering::SeqCst);
        self.scale_up.notify_waiters();
        true
    }

    fn pop_local(&self, idx: usize) -> Option<TaskId> {
        let id = self.queues[idx].lock().pop_front()?;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        Some(id)
    }

    /// Take one task from the tail of another worker's queue, visiting
    /// victims from a random start. Locked queues are skipped.
    fn steal(&self, idx: usize, rng: &mut StdRng) -> Option<TaskId> {
        let n = self.queues.len();
        if n < 2 {
            return None;
        }
        let start = rng.gen_range(0..n);
        for offset in 0..n {
            let victim = (start + offset) % n;
            if victim == idx {
                continue;
            }
            let Some(mut queue) = self.queues[victim].try_lock() else {
                continue;
            };
            if let Some(id) = queue.pop_back() {
                drop(queue);
                self.queued.fetch_sub(1, Ordering::SeqCst);
                self.metrics.record_steal();
                debug!(worker = idx, victim, task_id = %id, "Stole task");
                return Some(id);
            }
        }
        None
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.work_available.notified() => {}
            _ = tokio::time::sleep(self.options.idle_poll) => {}
            _ = self.done.cancelled() => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    fn finish_one(&self, state: &mut RunState) {
        state.remaining -= 1;
        if state.remaining == 0 {
            self.done.cancel();
        }
    }

    /// Run one task end to end on worker `idx`.
    async fn run_task(self: &Arc<Self>, idx: usize, id: TaskId) {
        let claimed = {
            let mut state = self.state.lock();
            let inputs = state.inputs_for(id.as_str());
            match state.graph.get_mut(id.as_str()) {
                Some(task) if task.status == TaskStatus::Ready => {
                    task.status = TaskStatus::Running;
                    Some((task.clone(), inputs))
                }
                _ => None,
            }
        };
        let Some((task, inputs)) = claimed else {
            return;
        };
        let attempt = task.retry_count + 1;
        let mut in_flight = InFlight {
            shared: self,
            idx,
            id: &id,
            settled: false,
        };

        let context = ValidationContext {
            run_id: self.run_id,
            attempt,
            session_id: self.session_id.clone(),
        };
        match self.validator.validate(&task, &context).await {
            Decision::Allow => {}
            Decision::Deny(reason) => {
                warn!(task_id = %id, reason = %reason, "Task denied by policy");
                in_flight.settled = true;
                self.block(idx, &id, TaskError::Denied { reason });
                return;
            }
            Decision::RequireApproval(reason) => {
                info!(task_id = %id, reason = %reason, "Task awaiting approval");
                in_flight.settled = true;
                self.block(idx, &id, TaskError::AwaitingApproval { reason });
                return;
            }
        }

        // Attempts only count once the policy let the action run.
        {
            let mut state = self.state.lock();
            if let Some(task) = state.graph.get_mut(id.as_str()) {
                if task.started_at.is_none() {
                    task.started_at = Some(Utc::now());
                }
            }
        }

        self.metrics.record_task_started();
        self.emitter.emit(OrchestrationEvent::TaskStarted {
            task_id: id.to_string(),
            action: task.action.clone(),
            attempt,
            worker: idx,
            timestamp: Utc::now(),
        });
        debug!(task_id = %id, action = %task.action, attempt, worker = idx, "Task started");

        let timeout = task.timeout().unwrap_or(self.options.default_timeout);
        let action_cancel = self.cancel.child_token();
        let invocation = ActionInvocation {
            task_id: id.to_string(),
            action: task.action.clone(),
            parameters: task.parameters.clone(),
            inputs,
            attempt,
            deadline: Instant::now() + timeout,
            cancel: action_cancel.clone(),
        };

        let started = Instant::now();
        let registry = self.registry.clone();
        // The action runs on its own task so a timed-out call can finish in
        // the background; its late result is dropped.
        let handle = tokio::spawn(async move { registry.execute(invocation).await });
        let outcome = match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => Attempt::Finished(result),
            Ok(Err(join_error)) => Attempt::Lost(join_error.to_string()),
            Err(_) => {
                action_cancel.cancel();
                Attempt::TimedOut(timeout)
            }
        };
        let elapsed = started.elapsed();
        in_flight.settled = true;

        match outcome {
            Attempt::Finished(Ok(value)) => self.complete(idx, &id, value, elapsed),
            Attempt::Finished(Err(e)) => self.fail(idx, &id, e),
            Attempt::TimedOut(after) => {
                self.metrics.record_task_timed_out();
                warn!(task_id = %id, timeout_ms = after.as_millis() as u64, "Task timed out");
                self.fail(
                    idx,
                    &id,
                    ActionError::Timeout {
                        after_ms: after.as_millis() as u64,
                    },
                );
            }
            Attempt::Lost(reason) => {
                error!(task_id = %id, worker = idx, error = %reason, "Action terminated abnormally");
                self.block(idx, &id, TaskError::WorkerLost);
            }
        }
    }

    fn complete(&self, idx: usize, id: &TaskId, value: Value, elapsed: Duration) {
        let ready = {
            let mut state = self.state.lock();
            let Some(task) = state.graph.get_mut(id.as_str()) else {
                return;
            };
            task.status = TaskStatus::Completed;
            task.result = Some(value);
            task.error = None;
            task.finished_at = Some(Utc::now());
            let ready = state.release_dependents(id);
            self.finish_one(&mut state);
            ready
        };

        self.metrics.record_task_completed();
        self.emitter.emit(OrchestrationEvent::TaskCompleted {
            task_id: id.to_string(),
            duration_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
        });
        debug!(task_id = %id, released = ready.len(), "Task completed");
        self.push_local(idx, ready);
    }

    fn fail(self: &Arc<Self>, idx: usize, id: &TaskId, error: ActionError) {
        let retry = {
            let mut state = self.state.lock();
            let Some(task) = state.graph.get_mut(id.as_str()) else {
                return;
            };
            let attempt = task.retry_count + 1;
            if error.is_retryable() && task.retry_count < task.max_retries && !self.cancel.is_cancelled() {
                task.retry_count += 1;
                task.status = TaskStatus::Ready;
                Some((attempt, task.retry_count - 1))
            } else {
                task.status = TaskStatus::Failed;
                task.error = Some(TaskError::Action(error.clone()));
                task.finished_at = Some(Utc::now());
                self.finish_one(&mut state);
                None
            }
        };

        match retry {
            Some((attempt, retry_index)) => {
                let delay = self.options.retry.backoff(retry_index);
                self.metrics.record_task_retried();
                self.emitter.emit(OrchestrationEvent::TaskFailed {
                    task_id: id.to_string(),
                    error: error.to_string(),
                    attempt,
                    will_retry: true,
                    timestamp: Utc::now(),
                });
                warn!(
                    task_id = %id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Task failed, retrying"
                );
                self.requeue_after(idx, id.clone(), delay);
            }
            None => {
                let attempt = {
                    let state = self.state.lock();
                    state.graph.get(id.as_str()).map_or(1, |t| t.retry_count + 1)
                };
                self.metrics.record_task_failed();
                self.emitter.emit(OrchestrationEvent::TaskFailed {
                    task_id: id.to_string(),
                    error: error.to_string(),
                    attempt,
                    will_retry: false,
                    timestamp: Utc::now(),
                });
                warn!(task_id = %id, attempt, error = %error, "Task failed");
                self.propagate(idx, id);
            }
        }
    }

    /// Terminal `Blocked` for one task, then propagate to its dependents.
    fn block(&self, idx: usize, id: &TaskId, error: TaskError) {
        let reason = error.to_string();
        {
            let mut state = self.state.lock();
            let Some(task) = state.graph.get_mut(id.as_str()) else {
                return;
            };
            task.status = TaskStatus::Blocked;
            task.error = Some(error);
            task.finished_at = Some(Utc::now());
            self.finish_one(&mut state);
        }
        self.metrics.record_task_blocked();
        self.emitter.emit(OrchestrationEvent::TaskBlocked {
            task_id: id.to_string(),
            reason,
            timestamp: Utc::now(),
        });
        self.propagate(idx, id);
    }

    fn propagate(&self, idx: usize, id: &TaskId) {
        let (skipped, ready) = {
            let mut state = self.state.lock();
            let settled = state.settle_unsuccessful(id);
            if state.remaining == 0 {
                self.done.cancel();
            }
            settled
        };
        for skipped_id in &skipped {
            self.metrics.record_task_skipped();
            debug!(task_id = %skipped_id, cause = %id, "Task skipped");
        }
        self.push_local(idx, ready);
    }

    /// Make a retried task stealable again once its backoff has elapsed.
    fn requeue_after(self: &Arc<Self>, idx: usize, id: TaskId, delay: Duration) {
        if delay.is_zero() {
            self.push_local(idx, vec![id]);
            return;
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => shared.push_local(idx, vec![id]),
                _ = shared.cancel.cancelled() => {}
            }
        });
    }
}

/// Settles the claimed task as `WorkerLost` when the worker unwinds from a
/// panic while running it. Dropping it without a panic (abort, caller gone)
/// leaves the task to the end-of-run sweep.
struct InFlight<'a> {
    shared: &'a Arc<Shared>,
    idx: usize,
    id: &'a TaskId,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled || !std::thread::panicking() {
            return;
        }
        error!(task_id = %self.id, worker = self.idx, "Worker panicked while running task");
        self.shared.block(self.idx, self.id, TaskError::WorkerLost);
    }
}

/// Worker loop: local queue first, then steal, otherwise idle until work
/// shows up or the run ends.
pub(super) async fn run_worker(shared: Arc<Shared>, idx: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(idx as u64));

    while idx >= shared.active_workers.load(Ordering::SeqCst) {
        if shared.stopping() {
            return;
        }
        tokio::select! {
            _ = shared.scale_up.notified() => {}
            _ = tokio::time::sleep(shared.options.idle_poll) => {}
            _ = shared.done.cancelled() => {}
            _ = shared.cancel.cancelled() => {}
        }
    }
    debug!(worker = idx, "Worker active");

    loop {
        if shared.stopping() {
            break;
        }
        let next = shared
            .pop_local(idx)
            .or_else(|| shared.steal(idx, &mut rng));
        match next {
            Some(id) => shared.run_task(idx, id).await,
            None => shared.idle().await,
        }
    }
    debug!(worker = idx, "Worker exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::Task;

    fn state(tasks: Vec<Task>) -> RunState {
        let graph = TaskGraph::from_tasks(tasks).unwrap();
        let mut state = RunState::new(graph);
        state.remaining = state.graph.len();
        state
    }

    #[test]
    fn test_settle_skips_required_and_releases_optional() {
        let mut st = state(vec![
            Task::new("root", "x"),
            Task::new("hard", "x").depends_on("root"),
            Task::new("soft", "x").optionally_depends_on("root"),
            Task::new("leaf", "x").depends_on("hard"),
        ]);
        st.graph.get_mut("root").unwrap().status = TaskStatus::Failed;
        st.remaining -= 1;

        let (skipped, ready) = st.settle_unsuccessful(&TaskId::from("root"));
        let mut skipped: Vec<&str> = skipped.iter().map(TaskId::as_str).collect();
        skipped.sort_unstable();
        assert_eq!(skipped, vec!["hard", "leaf"]);
        assert_eq!(ready, vec![TaskId::from("soft")]);
        assert_eq!(st.graph.status_of("soft"), Some(TaskStatus::Ready));
        assert_eq!(st.remaining, 1);
    }

    #[test]
    fn test_release_waits_for_all_dependencies() {
        let mut st = state(vec![
            Task::new("a", "x"),
            Task::new("b", "x"),
            Task::new("join", "x").depends_on("a").depends_on("b"),
        ]);
        st.graph.get_mut("a").unwrap().status = TaskStatus::Completed;
        assert!(st.release_dependents(&TaskId::from("a")).is_empty());

        st.graph.get_mut("b").unwrap().status = TaskStatus::Completed;
        assert_eq!(st.release_dependents(&TaskId::from("b")), vec![TaskId::from("join")]);
    }

    #[test]
    fn test_inputs_only_from_completed_dependencies() {
        let mut st = state(vec![
            Task::new("a", "x"),
            Task::new("b", "x"),
            Task::new("c", "x").depends_on("a").optionally_depends_on("b"),
        ]);
        let a = st.graph.get_mut("a").unwrap();
        a.status = TaskStatus::Completed;
        a.result = Some(serde_json::json!("A"));
        st.graph.get_mut("b").unwrap().status = TaskStatus::Failed;

        let inputs = st.inputs_for("c");
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs["a"], "A");
    }
}
