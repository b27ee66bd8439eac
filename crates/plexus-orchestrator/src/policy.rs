use crate::types::Task;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Verdict of the policy gate for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    /// The task is blocked and never invoked.
    Deny(String),
    /// The task is blocked pending an external approval.
    RequireApproval(String),
}

/// What the gate knows about the run a task belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationContext {
    pub run_id: Uuid,
    /// The attempt about to start (1-based).
    pub attempt: u32,
    pub session_id: Option<String>,
}

/// Policy gate consulted once per attempt, immediately before invocation.
#[async_trait]
pub trait TaskValidator: Send + Sync {
    async fn validate(&self, task: &Task, context: &ValidationContext) -> Decision;
}

/// Lets every task through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl TaskValidator for AllowAll {
    async fn validate(&self, _task: &Task, _context: &ValidationContext) -> Decision {
        Decision::Allow
    }
}

/// Static allow/deny policy over action names.
#[derive(Debug, Clone, Default)]
pub struct ActionPolicy {
    denied: HashSet<String>,
    approval_required: HashSet<String>,
}

impl ActionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(mut self, action: impl Into<String>) -> Self {
        self.denied.insert(action.into());
        self
    }

    pub fn require_approval(mut self, action: impl Into<String>) -> Self {
        self.approval_required.insert(action.into());
        self
    }
}

#[async_trait]
impl TaskValidator for ActionPolicy {
    async fn validate(&self, task: &Task, _context: &ValidationContext) -> Decision {
        if self.denied.contains(&task.action) {
            Decision::Deny(format!("action '{}' is not permitted", task.action))
        } else if self.approval_required.contains(&task.action) {
            Decision::RequireApproval(format!("action '{}' needs approval", task.action))
        } else {
            Decision::Allow
        }
    }
}
