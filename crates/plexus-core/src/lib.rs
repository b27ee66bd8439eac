//! Core types and error definitions for the Plexus orchestration engine.
//!
//! This crate holds what every other Plexus crate shares: the error
//! taxonomy and the contracts of the external collaborators the engine
//! talks to (action execution, model inference, event delivery).
//!
//! # Main types
//!
//! - [`PlexusError`] — Unified error enum for planning, execution and verification.
//! - [`PlexusResult`] — Convenience alias for `Result<T, PlexusError>`.
//! - [`ActionError`] — Structured failure reported by an action invocation.
//! - [`ActionRegistry`] — Executes named actions with a deadline.
//! - [`ModelBackend`] — Text generation used by model-assisted decomposition.
//! - [`EventSink`] — Fire-and-forget receiver of [`OrchestrationEvent`]s.

/// Action invocation contract (tool / capability execution).
pub mod action;
/// Language-model backend contract.
pub mod backend;
/// Orchestration events and the sink contract.
pub mod event;

pub use action::{ActionError, ActionInvocation, ActionRegistry};
pub use backend::{Generation, GenerationOptions, ModelBackend, TokenUsage};
pub use event::{EventSink, OrchestrationEvent};

// --- Error types ---

/// Top-level error type for the Plexus engine.
///
/// Structural graph errors ([`PlexusError::Cycle`], [`PlexusError::DuplicateId`],
/// [`PlexusError::UnknownDependency`]) are fatal to planning. Per-task failures
/// are normally recorded on the task instead of being raised.
#[derive(Debug, thiserror::Error)]
pub enum PlexusError {
    /// The dependency graph contains a cycle. `path` lists the ids along the
    /// cycle, starting and ending with the same id.
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Task ids forming the cycle.
        path: Vec<String>,
    },

    /// Two tasks in the same graph share an id.
    #[error("Duplicate task id: {0}")]
    DuplicateId(String),

    /// A task names a dependency that is not part of the graph.
    #[error("Task '{task_id}' depends on unknown task '{dependency}'")]
    UnknownDependency {
        /// The task declaring the dependency.
        task_id: String,
        /// The missing dependency id.
        dependency: String,
    },

    /// No decomposition strategy produced a usable graph.
    #[error("Decomposition error: {0}")]
    Decomposition(String),

    /// The policy gate refused to let a task run.
    #[error("Task '{task_id}' denied by policy: {reason}")]
    ValidationDenied {
        /// The denied task.
        task_id: String,
        /// Reason given by the validator.
        reason: String,
    },

    /// An action invocation failed.
    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    /// One or more task results did not pass verification.
    #[error("Verification failed for tasks: {}", task_ids.join(", "))]
    VerificationFailure {
        /// Ids of the tasks that failed verification.
        task_ids: Vec<String>,
    },

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from a persistence layer (plan store, audit log).
    #[error("Store error: {0}")]
    Store(String),

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlexusError {
    /// Whether this error describes an invalid graph structure.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            PlexusError::Cycle { .. }
                | PlexusError::DuplicateId(_)
                | PlexusError::UnknownDependency { .. }
        )
    }
}

/// A convenience `Result` alias using [`PlexusError`].
pub type PlexusResult<T> = Result<T, PlexusError>;
