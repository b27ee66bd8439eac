use crate::audit::{AuditLog, Emitter};
use crate::cache::PlanCache;
use crate::config::OrchestratorConfig;
use crate::executor::Executor;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::planner::{PlanningContext, Planner, RuleBasedStrategy, Strategy};
use crate::policy::TaskValidator;
use crate::store::{FilePlanStore, PlanStore};
use crate::types::{ExecutionResult, StrategyKind, TaskError, TaskId, TaskStatus};
use crate::verifier::{VerificationLevel, VerificationReport, VerificationResult, Verifier};
use chrono::Utc;
use plexus_core::{
    ActionRegistry, EventSink, ModelBackend, OrchestrationEvent, PlexusError, PlexusResult,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// How a request ended. Planning failures, execution failures and
/// verification flags are kept apart so callers can react to each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    PlanningFailed {
        reason: String,
    },
    ExecutionPartiallyFailed {
        failed: Vec<TaskId>,
        blocked: Vec<TaskId>,
        skipped: Vec<TaskId>,
    },
    /// Every task completed but some results did not pass verification or
    /// were flagged for review.
    VerificationFlagged {
        failed: Vec<TaskId>,
        flagged: Vec<TaskId>,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

/// One task's final state, as reported to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub task_id: TaskId,
    pub name: String,
    pub action: String,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub attempts: u32,
    pub verification: Option<VerificationResult>,
}

/// Everything a caller gets back from [`Orchestrator::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResponse {
    pub request: String,
    pub outcome: Outcome,
    pub plan_id: Option<Uuid>,
    pub fingerprint: Option<String>,
    pub cache_hit: bool,
    pub strategy: Option<StrategyKind>,
    pub confidence: Option<f64>,
    pub reasoning_trace: Vec<String>,
    /// Task outputs in topological order.
    pub results: Vec<TaskOutput>,
    pub execution: Option<ExecutionResult>,
    pub verification: Option<VerificationReport>,
    pub duration_ms: u64,
}

impl OrchestrationResponse {
    fn planning_failed(request: &str, reason: String, duration_ms: u64) -> Self {
        Self {
            request: request.to_string(),
            outcome: Outcome::PlanningFailed { reason },
            plan_id: None,
            fingerprint: None,
            cache_hit: false,
            strategy: None,
            confidence: None,
            reasoning_trace: Vec::new(),
            results: Vec::new(),
            execution: None,
            verification: None,
            duration_ms,
        }
    }

    pub fn output(&self, task_id: &str) -> Option<&TaskOutput> {
        self.results.iter().find(|o| o.task_id.as_str() == task_id)
    }
}

/// Wires collaborators and configuration into an [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    registry: Option<Arc<dyn ActionRegistry>>,
    backend: Option<Arc<dyn ModelBackend>>,
    validator: Option<Arc<dyn TaskValidator>>,
    sink: Option<Arc<dyn EventSink>>,
    store: Option<Arc<dyn PlanStore>>,
    rules: RuleBasedStrategy,
    verifier: Verifier,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            registry: None,
            backend: None,
            validator: None,
            sink: None,
            store: None,
            rules: RuleBasedStrategy::new(),
            verifier: Verifier::new(),
        }
    }

    pub fn registry(mut self, registry: Arc<dyn ActionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Enables the model-based and hybrid strategies.
    pub fn backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn TaskValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Replaces the file audit log configured by `audit_dir`.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replaces the file store configured by `cache.store_dir`.
    pub fn plan_store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn rules(mut self, rules: RuleBasedStrategy) -> Self {
        self.rules = rules;
        self
    }

    pub fn verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Validate the configuration and assemble the engine. Creates the
    /// plan store and audit directories named in the configuration.
    pub async fn build(self) -> PlexusResult<Orchestrator> {
        let config = self.config;
        config.validate()?;
        let registry = self
            .registry
            .ok_or_else(|| PlexusError::Config("an action registry is required".into()))?;

        let metrics = Arc::new(Metrics::new());

        let mut audit = None;
        let sink = match (self.sink, &config.audit_dir) {
            (Some(sink), _) => Some(sink),
            (None, Some(dir)) => {
                let log = Arc::new(AuditLog::new(dir));
                info!(path = %log.path().display(), "Audit log enabled");
                audit = Some(log.clone());
                Some(log as Arc<dyn EventSink>)
            }
            (None, None) => None,
        };
        let emitter = Emitter::new(sink, metrics.clone());

        let store = match (self.store, &config.cache.store_dir) {
            (Some(store), _) => Some(store),
            (None, Some(dir)) => {
                Some(Arc::new(FilePlanStore::new(dir.clone()).await?) as Arc<dyn PlanStore>)
            }
            (None, None) => None,
        };

        let mut strategies = Vec::new();
        for kind in &config.planner.strategies {
            match Strategy::from_kind(
                *kind,
                &self.rules,
                self.backend.as_ref(),
                config.planner.max_tasks,
            ) {
                Some(strategy) => strategies.push(strategy),
                None => warn!(strategy = %kind, "No model backend configured, strategy disabled"),
            }
        }
        if strategies.is_empty() {
            return Err(PlexusError::Config(
                "no usable planning strategy; model-assisted strategies need a backend".into(),
            ));
        }

        let cache = Arc::new(
            PlanCache::new(config.cache.capacity, config.cache.ttl()).with_metrics(metrics.clone()),
        );
        let mut planner = Planner::new(strategies, cache, metrics.clone())
            .with_emitter(emitter.clone())
            .with_confidence_floor(config.planner.confidence_floor)
            .with_max_tasks(config.planner.max_tasks);
        if let Some(store) = store {
            planner = planner.with_store(store);
        }

        let mut executor = Executor::new(registry, metrics.clone())
            .with_emitter(emitter.clone())
            .with_options(config.executor.to_options());
        if let Some(validator) = self.validator {
            executor = executor.with_validator(validator);
        }

        let verifier = self
            .verifier
            .with_review_threshold(config.verifier.review_threshold);

        info!(
            strategies = ?planner.strategy_kinds(),
            mode = %executor.options().mode,
            workers = executor.options().workers,
            level = %config.verifier.level,
            "Orchestrator ready"
        );

        Ok(Orchestrator {
            planner,
            executor,
            verifier,
            metrics,
            emitter,
            audit,
            config,
        })
    }
}

/// Plan, execute and verify requests.
pub struct Orchestrator {
    planner: Planner,
    executor: Executor,
    verifier: Verifier,
    metrics: Arc<Metrics>,
    emitter: Emitter,
    audit: Option<Arc<AuditLog>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run a request at the configured verification level.
    pub async fn run(
        &self,
        request: &str,
        context: &PlanningContext,
    ) -> PlexusResult<OrchestrationResponse> {
        self.run_with(request, context, self.config.verifier.level, CancellationToken::new())
            .await
    }

    /// Full pipeline: plan, execute the plan's graph, verify the results.
    ///
    /// Planning errors become [`Outcome::PlanningFailed`]; per-task failures
    /// are reported in the response. Only a graph that fails validation at
    /// execution time is returned as an error.
    pub async fn run_with(
        &self,
        request: &str,
        context: &PlanningContext,
        level: VerificationLevel,
        cancel: CancellationToken,
    ) -> PlexusResult<OrchestrationResponse> {
        let started = Instant::now();
        info!(request = %request, level = %level, "Orchestration started");

        let planned = match self.planner.plan(request, context).await {
            Ok(planned) => planned,
            Err(e) => {
                warn!(error = %e, "Orchestration stopped at planning");
                return Ok(OrchestrationResponse::planning_failed(
                    request,
                    e.to_string(),
                    started.elapsed().as_millis() as u64,
                ));
            }
        };

        let mut plan = planned.plan;
        let execution = self
            .executor
            .execute_with(&mut plan.graph, cancel, context.session_id.clone())
            .await?;

        let report = self.verifier.verify(&plan.graph, level);
        for result in report.results.values() {
            self.metrics
                .record_verification(result.passed, result.needs_review);
            self.emitter.emit(OrchestrationEvent::VerificationResult {
                task_id: result.task_id.to_string(),
                passed: result.passed,
                level: level.to_string(),
                needs_review: result.needs_review,
                timestamp: Utc::now(),
            });
        }

        let outcome = if execution.has_failures() || !execution.success {
            Outcome::ExecutionPartiallyFailed {
                failed: execution.failed_task_ids.clone(),
                blocked: execution.blocked_task_ids.clone(),
                skipped: execution.skipped_task_ids.clone(),
            }
        } else if !report.all_passed() || !report.flagged().is_empty() {
            Outcome::VerificationFlagged {
                failed: report.failed(),
                flagged: report.flagged(),
            }
        } else {
            Outcome::Succeeded
        };

        let order = plan.graph.topological_order()?;
        let results = order
            .iter()
            .filter_map(|id| plan.graph.get(id.as_str()))
            .map(|task| TaskOutput {
                task_id: task.id.clone(),
                name: task.name.clone(),
                action: task.action.clone(),
                status: task.status,
                result: task.result.clone(),
                error: task.error.clone(),
                attempts: task.attempts(),
                verification: report.get(task.id.as_str()).cloned(),
            })
            .collect();

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            plan_id = %plan.id,
            outcome = ?outcome,
            cache_hit = planned.cache_hit,
            duration_ms,
            "Orchestration finished"
        );

        Ok(OrchestrationResponse {
            request: request.to_string(),
            outcome,
            plan_id: Some(plan.id),
            fingerprint: Some(planned.fingerprint.to_string()),
            cache_hit: planned.cache_hit,
            strategy: Some(plan.strategy_used),
            confidence: Some(plan.confidence),
            reasoning_trace: plan.reasoning_trace,
            results,
            execution: Some(execution),
            verification: Some(report),
            duration_ms,
        })
    }

    /// Start the periodic cache expiry sweep, if configured.
    pub fn spawn_maintenance(&self) -> Option<JoinHandle<()>> {
        let interval = self.config.cache.eviction_interval()?;
        info!(interval_secs = interval.as_secs(), "Plan cache maintenance started");
        Some(self.planner.cache().clone().spawn_expiry_task(interval))
    }

    /// Drop the engine and flush the audit log it owns, if any.
    pub async fn shutdown(self) {
        let Orchestrator {
            planner,
            executor,
            emitter,
            audit,
            ..
        } = self;
        drop(planner);
        drop(executor);
        drop(emitter);
        if let Some(audit) = audit {
            match Arc::try_unwrap(audit) {
                Ok(log) => log.shutdown().await,
                Err(_) => warn!("Audit log still shared, not flushed"),
            }
        }
    }
}
