use crate::graph::TaskGraph;
use crate::verifier::ResultContract;
use chrono::{DateTime, Utc};
use plexus_core::{ActionError, PlexusError, PlexusResult};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use uuid::Uuid;

/// Opaque identifier of a task, unique within its graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a task.
///
/// `Pending -> Ready -> Running -> Completed`, or `Running -> Failed`
/// (after retries are exhausted) / `Ready` (retry). `Blocked` is set by the
/// policy gate or cancellation; dependents of a failed or blocked task become
/// `Skipped` unless their edge to it is optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Blocked,
    Skipped,
}

impl TaskStatus {
    /// Whether the task will not change state again during this run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked | TaskStatus::Skipped
        )
    }

    /// Terminal without a result.
    pub fn is_unsuccessful(self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Blocked | TaskStatus::Skipped
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// A dependency edge. `optional` lets the dependent run even when this
/// predecessor ends up failed, blocked or skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub task_id: TaskId,
    #[serde(default)]
    pub optional: bool,
}

impl Dependency {
    pub fn required(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            optional: false,
        }
    }

    pub fn optional(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            optional: true,
        }
    }
}

/// Why a task ended up failed or blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskError {
    /// The action failed on its last attempt.
    Action(ActionError),
    /// The policy gate denied the task.
    Denied { reason: String },
    /// The policy gate requires an external approval before the task may run.
    AwaitingApproval { reason: String },
    /// The run was cancelled before the task finished.
    Cancelled,
    /// The worker running the task terminated abnormally.
    WorkerLost,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Action(e) => write!(f, "{e}"),
            TaskError::Denied { reason } => write!(f, "denied by policy: {reason}"),
            TaskError::AwaitingApproval { reason } => write!(f, "awaiting approval: {reason}"),
            TaskError::Cancelled => write!(f, "cancelled"),
            TaskError::WorkerLost => write!(f, "worker terminated"),
        }
    }
}

impl TaskError {
    /// The engine error describing this failure of `task_id`.
    pub fn to_error(&self, task_id: &TaskId) -> PlexusError {
        match self {
            TaskError::Action(e) => PlexusError::Action(e.clone()),
            TaskError::Denied { reason } => PlexusError::ValidationDenied {
                task_id: task_id.to_string(),
                reason: reason.clone(),
            },
            TaskError::AwaitingApproval { reason } => PlexusError::ValidationDenied {
                task_id: task_id.to_string(),
                reason: format!("awaiting approval: {reason}"),
            },
            TaskError::Cancelled => PlexusError::Cancelled,
            TaskError::WorkerLost => PlexusError::Action(ActionError::Internal(format!(
                "worker running '{task_id}' terminated"
            ))),
        }
    }
}

fn default_required() -> bool {
    true
}

fn default_max_retries() -> u32 {
    2
}

/// A single unit of work in a [`TaskGraph`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    /// Name of the external capability to invoke.
    pub action: String,
    /// Passed verbatim to the action.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Higher runs first among otherwise-eligible tasks.
    #[serde(default)]
    pub priority: i32,
    /// Whether the run counts as successful only if this task completes.
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-attempt timeout; the executor default applies when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Result contract checked by strict and paranoid verification.
    #[serde(default)]
    pub expectation: Option<ResultContract>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task; the name defaults to the id.
    pub fn new(id: impl Into<TaskId>, action: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            action: action.into(),
            parameters: HashMap::new(),
            dependencies: Vec::new(),
            priority: 0,
            required: true,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            timeout_ms: None,
            expectation: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.push(Dependency::required(id));
        self
    }

    pub fn optionally_depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.push(Dependency::optional(id));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Mark the task as best-effort: its failure does not fail the run.
    pub fn best_effort(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn expecting(mut self, contract: ResultContract) -> Self {
        self.expectation = Some(contract);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Number of times the action was invoked so far.
    pub fn attempts(&self) -> u32 {
        if self.started_at.is_some() {
            self.retry_count + 1
        } else {
            0
        }
    }

    /// Clear every per-run field, keeping the task definition.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.result = None;
        self.error = None;
        self.retry_count = 0;
        self.started_at = None;
        self.finished_at = None;
    }
}

/// Which decomposition strategy produced a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RuleBased,
    ModelBased,
    Hybrid,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::RuleBased => write!(f, "rule_based"),
            StrategyKind::ModelBased => write!(f, "model_based"),
            StrategyKind::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// A task graph plus the metadata of how it was decomposed.
///
/// Plans are treated as immutable once produced; executors run a
/// [`Plan::fresh_copy`] so replays never share task state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub request: String,
    pub graph: TaskGraph,
    pub strategy_used: StrategyKind,
    /// In `[0.0, 1.0]`.
    pub confidence: f64,
    pub reasoning_trace: Vec<String>,
    pub decomposition_depth: u32,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(
        request: impl Into<String>,
        graph: TaskGraph,
        strategy_used: StrategyKind,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request: request.into(),
            graph,
            strategy_used,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning_trace: Vec::new(),
            decomposition_depth: 1,
            created_at: Utc::now(),
        }
    }

    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.reasoning_trace = trace;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.decomposition_depth = depth;
        self
    }

    /// Deep copy with every task reset to `Pending` and results cleared.
    pub fn fresh_copy(&self) -> Plan {
        let mut copy = self.clone();
        copy.graph.reset();
        copy
    }
}

/// Aggregate outcome of executing one graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Every required task completed.
    pub success: bool,
    pub completed_task_ids: Vec<TaskId>,
    pub failed_task_ids: Vec<TaskId>,
    pub skipped_task_ids: Vec<TaskId>,
    pub blocked_task_ids: Vec<TaskId>,
    pub total_duration: Duration,
    pub errors: BTreeMap<TaskId, TaskError>,
    /// Invocation attempts per task that ran at least once.
    pub attempts: BTreeMap<TaskId, u32>,
    pub cancelled: bool,
}

impl ExecutionResult {
    /// Summarize a graph after a run. Id lists follow topological order when
    /// it can be computed, insertion order otherwise.
    pub fn from_graph(graph: &TaskGraph, total_duration: Duration, cancelled: bool) -> Self {
        let order = graph
            .topological_order()
            .unwrap_or_else(|_| graph.ids().to_vec());

        let mut result = ExecutionResult {
            success: true,
            total_duration,
            cancelled,
            ..Default::default()
        };

        for id in &order {
            let Some(task) = graph.get(id.as_str()) else {
                continue;
            };
            match task.status {
                TaskStatus::Completed => result.completed_task_ids.push(id.clone()),
                TaskStatus::Failed => result.failed_task_ids.push(id.clone()),
                TaskStatus::Skipped => result.skipped_task_ids.push(id.clone()),
                TaskStatus::Blocked => result.blocked_task_ids.push(id.clone()),
                _ => {}
            }
            if task.required && task.status != TaskStatus::Completed {
                result.success = false;
            }
            if let Some(err) = &task.error {
                result.errors.insert(id.clone(), err.clone());
            }
            if task.attempts() > 0 {
                result.attempts.insert(id.clone(), task.attempts());
            }
        }

        result
    }

    /// `Ok` when the run succeeded, otherwise the error of the first failed
    /// or blocked task, for callers that want to bail out with `?`.
    pub fn ensure_success(&self) -> PlexusResult<()> {
        if self.success {
            return Ok(());
        }
        let first = self
            .failed_task_ids
            .iter()
            .chain(&self.blocked_task_ids)
            .find_map(|id| self.errors.get(id).map(|e| e.to_error(id)));
        match first {
            Some(err) => Err(err),
            None if self.cancelled => Err(PlexusError::Cancelled),
            None => Err(PlexusError::Action(ActionError::Internal(
                "required tasks did not complete".into(),
            ))),
        }
    }

    /// Whether any task ended failed, blocked or skipped.
    pub fn has_failures(&self) -> bool {
        !(self.failed_task_ids.is_empty()
            && self.blocked_task_ids.is_empty()
            && self.skipped_task_ids.is_empty())
    }
}
