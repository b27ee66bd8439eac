//! Orchestration events for audit and observability sinks.
//!
//! These types live in `plexus-core` so that sinks can be implemented
//! without depending on the orchestrator crate.

use crate::PlexusResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structured event emitted by the planner, executor and verifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// A plan was produced (freshly or from the cache).
    PlanningCompleted {
        plan_id: Uuid,
        fingerprint: String,
        strategy: String,
        confidence: f64,
        task_count: usize,
        duration_ms: u64,
        cache_hit: bool,
        timestamp: DateTime<Utc>,
    },
    /// A plan was served from the plan cache.
    CacheHit {
        fingerprint: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker started running a task.
    TaskStarted {
        task_id: String,
        action: String,
        attempt: u32,
        worker: usize,
        timestamp: DateTime<Utc>,
    },
    /// A task completed successfully.
    TaskCompleted {
        task_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A task attempt failed.
    TaskFailed {
        task_id: String,
        error: String,
        attempt: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    /// A task was blocked by the policy gate or by cancellation.
    TaskBlocked {
        task_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// A task result was verified.
    VerificationResult {
        task_id: String,
        passed: bool,
        level: String,
        needs_review: bool,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestrationEvent {
    /// The event name used in logs and audit files.
    pub fn name(&self) -> &'static str {
        match self {
            OrchestrationEvent::PlanningCompleted { .. } => "planning_completed",
            OrchestrationEvent::CacheHit { .. } => "cache_hit",
            OrchestrationEvent::TaskStarted { .. } => "task_started",
            OrchestrationEvent::TaskCompleted { .. } => "task_completed",
            OrchestrationEvent::TaskFailed { .. } => "task_failed",
            OrchestrationEvent::TaskBlocked { .. } => "task_blocked",
            OrchestrationEvent::VerificationResult { .. } => "verification_result",
        }
    }
}

/// Receiver for orchestration events (audit log, metrics pipeline, ...).
///
/// `deliver` is called from worker hot paths and must not block. Errors are
/// swallowed and counted by the caller; they never abort orchestration.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &OrchestrationEvent) -> PlexusResult<()>;
}
