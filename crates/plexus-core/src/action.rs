use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Structured error returned by an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ActionError {
    /// No action is registered under the requested name.
    #[error("Action not found: {0}")]
    NotFound(String),
    /// The parameters were rejected by the action.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    /// The invocation did not finish before its deadline.
    #[error("Timed out after {after_ms}ms")]
    Timeout {
        /// The timeout that expired, in milliseconds.
        after_ms: u64,
    },
    /// Any other failure inside the action.
    #[error("Internal action error: {0}")]
    Internal(String),
}

impl ActionError {
    /// Whether retrying the same invocation can reasonably succeed.
    ///
    /// Unknown actions and rejected arguments fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActionError::Timeout { .. } | ActionError::Internal(_))
    }
}

/// A single request to run an action on behalf of a task.
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    /// Id of the task being executed.
    pub task_id: String,
    /// Name of the action to run.
    pub action: String,
    /// Parameters, passed through verbatim from the task.
    pub parameters: HashMap<String, serde_json::Value>,
    /// Results of the task's completed dependencies, keyed by dependency id.
    pub inputs: HashMap<String, serde_json::Value>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Point in time after which the executor stops waiting.
    pub deadline: Instant,
    /// Cancelled when the executor gives up on this invocation.
    pub cancel: CancellationToken,
}

impl ActionInvocation {
    /// Time left before the deadline (zero once it has passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the executor has asked this invocation to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Executes named actions (tools, sub-routines, model calls).
///
/// Implementations must honor `deadline` and `cancel` cooperatively. Once the
/// deadline passes or `cancel` fires the executor has stopped waiting and any
/// value produced afterwards is discarded, so side effects that land late must
/// be safe to repeat or ignore.
#[async_trait]
pub trait ActionRegistry: Send + Sync {
    /// Run the invocation and return its result.
    async fn execute(&self, invocation: ActionInvocation) -> Result<serde_json::Value, ActionError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ActionError::Internal("boom".into()).is_retryable());
        assert!(ActionError::Timeout { after_ms: 10 }.is_retryable());
        assert!(!ActionError::NotFound("x".into()).is_retryable());
        assert!(!ActionError::InvalidArguments("x".into()).is_retryable());
    }

    #[test]
    fn test_action_error_serialization() {
        let err = ActionError::Timeout { after_ms: 250 };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("timeout"));
        let parsed: ActionError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_remaining_after_deadline_is_zero() {
        let invocation = ActionInvocation {
            task_id: "t".into(),
            action: "noop".into(),
            parameters: HashMap::new(),
            inputs: HashMap::new(),
            attempt: 1,
            deadline: Instant::now(),
            cancel: CancellationToken::new(),
        };
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(invocation.remaining(), Duration::ZERO);
        assert!(!invocation.is_cancelled());
    }
}
