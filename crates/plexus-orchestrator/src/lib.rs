//! Task-orchestration engine: decomposition, caching, work-stealing
//! execution and verification of task graphs.
//!
//! A request is fingerprinted and looked up in the [`PlanCache`]; on a miss
//! the [`Planner`] walks its strategy chain (rule-based, model-based, hybrid)
//! until one yields a valid graph above the confidence floor. The
//! [`Executor`] runs the graph on a pool of work-stealing workers, and the
//! [`Verifier`] checks every result at the requested level.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Facade running plan → execute → verify for one request.
//! - [`TaskGraph`] — Dependency graph with cycle detection and topological order.
//! - [`Planner`] — Strategy chain in front of the plan cache.
//! - [`PlanCache`] — LRU cache of plans with per-entry TTL.
//! - [`Executor`] — Work-stealing worker pool with retries, timeouts and cancellation.
//! - [`Verifier`] — Basic / strict / paranoid result checks.
//! - [`Metrics`] — Counters and durations for every stage.

/// Append-only JSONL audit log and the event emitter.
pub mod audit;
/// LRU + TTL plan cache.
pub mod cache;
/// TOML configuration.
pub mod config;
/// Orchestrator facade and builder.
pub mod engine;
/// Work-stealing executor.
pub mod executor;
/// Task dependency graph.
pub mod graph;
/// Engine metrics.
pub mod metrics;
/// Request decomposition strategies and the planner.
pub mod planner;
/// Pre-execution policy gate.
pub mod policy;
/// In-process action registry.
pub mod registry;
/// Durable plan storage.
pub mod store;
/// Task model, plans and execution results.
pub mod types;
/// Result verification.
pub mod verifier;

pub use audit::{AuditLog, Emitter};
pub use cache::{Fingerprint, PlanCache, PlanCacheEntry};
pub use config::{
    CacheConfig, ExecutorConfig, OrchestratorConfig, PlannerConfig, RetryConfig, VerifierConfig,
};
pub use engine::{
    OrchestrationResponse, Orchestrator, OrchestratorBuilder, Outcome, TaskOutput,
};
pub use executor::{ExecutionMode, Executor, ExecutorOptions, RetryPolicy};
pub use graph::TaskGraph;
pub use metrics::{Metrics, MetricsSnapshot};
pub use planner::{
    fingerprint, HybridStrategy, ModelBasedStrategy, PlannedRequest, Planner, PlanningContext,
    RuleBasedStrategy, Strategy, TaskTemplate, TemplateStep,
};
pub use policy::{ActionPolicy, AllowAll, Decision, TaskValidator, ValidationContext};
pub use registry::{Action, EchoAction, FnAction, LocalActionRegistry};
pub use store::{FilePlanStore, PlanStore};
pub use types::{
    Dependency, ExecutionResult, Plan, StrategyKind, Task, TaskError, TaskId, TaskStatus,
};
pub use verifier::{
    ResultContract, ResultKind, VerificationLevel, VerificationReport, VerificationResult,
    Verifier,
};
