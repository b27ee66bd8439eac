//! Request decomposition.
//!
//! The [`Planner`] fingerprints a request, consults the plan cache (and the
//! optional durable [`PlanStore`]), and on a miss walks an ordered chain of
//! [`Strategy`] values until one yields a non-empty, valid graph whose
//! confidence clears the configured floor.

pub mod hybrid;
pub mod model_based;
pub mod rule_based;

pub use hybrid::HybridStrategy;
pub use model_based::{ModelBasedStrategy, ModelProposal, ProposedTask};
pub use rule_based::{normalize_request, RuleBasedStrategy, TaskTemplate, TemplateStep};

use crate::audit::Emitter;
use crate::cache::{Fingerprint, PlanCache};
use crate::metrics::Metrics;
use crate::store::PlanStore;
use crate::types::{Plan, StrategyKind};
use chrono::Utc;
use plexus_core::{ModelBackend, OrchestrationEvent, PlexusError, PlexusResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Caller-supplied context for a planning call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanningContext {
    /// Strategy-relevant fields; they take part in the fingerprint.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Correlation id for logs and the policy gate; not fingerprinted.
    #[serde(default)]
    pub session_id: Option<String>,
}

impl PlanningContext {
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Hex SHA-256 of the normalized request plus the canonical JSON of the
/// context attributes.
pub fn fingerprint(request: &str, context: &PlanningContext) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(normalize_request(request).as_bytes());
    hasher.update(b"\n");
    let attributes = serde_json::to_string(&context.attributes).unwrap_or_default();
    hasher.update(attributes.as_bytes());
    Fingerprint::new(hex::encode(hasher.finalize()))
}

/// One decomposition strategy of the chain.
#[derive(Clone)]
pub enum Strategy {
    RuleBased(RuleBasedStrategy),
    ModelBased(ModelBasedStrategy),
    Hybrid(HybridStrategy),
}

impl Strategy {
    /// Build the strategy for `kind`. Model-assisted kinds need a backend and
    /// yield `None` without one.
    pub fn from_kind(
        kind: StrategyKind,
        rules: &RuleBasedStrategy,
        backend: Option<&Arc<dyn ModelBackend>>,
        max_tasks: usize,
    ) -> Option<Self> {
        match kind {
            StrategyKind::RuleBased => Some(Strategy::RuleBased(rules.clone())),
            StrategyKind::ModelBased => backend.map(|b| {
                Strategy::ModelBased(ModelBasedStrategy::new(b.clone()).with_max_tasks(max_tasks))
            }),
            StrategyKind::Hybrid => {
                backend.map(|b| Strategy::Hybrid(HybridStrategy::new(rules.clone(), b.clone())))
            }
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::RuleBased(_) => StrategyKind::RuleBased,
            Strategy::ModelBased(_) => StrategyKind::ModelBased,
            Strategy::Hybrid(_) => StrategyKind::Hybrid,
        }
    }

    pub async fn decompose(&self, request: &str, context: &PlanningContext) -> PlexusResult<Plan> {
        match self {
            Strategy::RuleBased(s) => s.decompose(request, context),
            Strategy::ModelBased(s) => s.decompose(request, context).await,
            Strategy::Hybrid(s) => s.decompose(request, context).await,
        }
    }
}

/// A plan handed to the caller, with where it came from.
#[derive(Debug, Clone)]
pub struct PlannedRequest {
    pub plan: Plan,
    pub fingerprint: Fingerprint,
    pub cache_hit: bool,
}

/// Turns requests into validated plans.
pub struct Planner {
    strategies: Vec<Strategy>,
    cache: Arc<PlanCache>,
    store: Option<Arc<dyn PlanStore>>,
    metrics: Arc<Metrics>,
    emitter: Emitter,
    confidence_floor: f64,
    max_tasks: usize,
}

impl Planner {
    pub fn new(strategies: Vec<Strategy>, cache: Arc<PlanCache>, metrics: Arc<Metrics>) -> Self {
        let emitter = Emitter::disabled(metrics.clone());
        Self {
            strategies,
            cache,
            store: None,
            metrics,
            emitter,
            confidence_floor: 0.5,
            max_tasks: 64,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Plans below this confidence are rejected.
    pub fn with_confidence_floor(mut self, floor: f64) -> Self {
        self.confidence_floor = floor.clamp(0.0, 1.0);
        self
    }

    /// Plans with more tasks than this are rejected.
    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub fn strategy_kinds(&self) -> Vec<StrategyKind> {
        self.strategies.iter().map(Strategy::kind).collect()
    }

    pub fn cache(&self) -> &Arc<PlanCache> {
        &self.cache
    }

    /// Produce a plan for `request`: cache, then store, then the strategy
    /// chain. Structural errors from a strategy are returned directly; any
    /// other strategy failure moves on to the next one.
    pub async fn plan(&self, request: &str, context: &PlanningContext) -> PlexusResult<PlannedRequest> {
        let started = Instant::now();
        let fingerprint = fingerprint(request, context);

        if let Some(plan) = self.lookup(&fingerprint).await {
            self.metrics.record_cache_hit();
            self.emitter.emit(OrchestrationEvent::CacheHit {
                fingerprint: fingerprint.to_string(),
                timestamp: Utc::now(),
            });
            self.emit_completed(&plan, &fingerprint, started.elapsed(), true);
            info!(
                fingerprint = fingerprint.short(),
                strategy = %plan.strategy_used,
                tasks = plan.graph.len(),
                "Plan served from cache"
            );
            return Ok(PlannedRequest {
                plan,
                fingerprint,
                cache_hit: true,
            });
        }
        self.metrics.record_cache_miss();

        let plan = match self.decompose(request, context).await {
            Ok(plan) => plan,
            Err(e) => {
                self.metrics.record_planning_failure();
                warn!(fingerprint = fingerprint.short(), error = %e, "Planning failed");
                return Err(e);
            }
        };

        let elapsed = started.elapsed();
        self.metrics.record_plan(plan.strategy_used, elapsed);
        self.cache.put(fingerprint.clone(), plan.clone());
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&fingerprint, &plan).await {
                warn!(fingerprint = fingerprint.short(), error = %e, "Failed to persist plan");
            }
        }
        self.emit_completed(&plan, &fingerprint, elapsed, false);
        info!(
            fingerprint = fingerprint.short(),
            strategy = %plan.strategy_used,
            confidence = plan.confidence,
            tasks = plan.graph.len(),
            duration_ms = elapsed.as_millis() as u64,
            "Plan created"
        );

        Ok(PlannedRequest {
            plan,
            fingerprint,
            cache_hit: false,
        })
    }

    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<Plan> {
        if let Some(plan) = self.cache.get(fingerprint) {
            return Some(plan);
        }

        let store = self.store.as_ref()?;
        match store.load(fingerprint).await {
            Ok(Some(plan)) => {
                if plan.graph.is_empty() {
                    warn!(fingerprint = fingerprint.short(), "Stored plan is empty, ignoring");
                    return None;
                }
                if let Err(e) = plan.graph.validate() {
                    warn!(fingerprint = fingerprint.short(), error = %e, "Stored plan is invalid, ignoring");
                    return None;
                }
                debug!(fingerprint = fingerprint.short(), "Promoting stored plan into cache");
                self.cache.put(fingerprint.clone(), plan.clone());
                Some(plan.fresh_copy())
            }
            Ok(None) => None,
            Err(e) => {
                warn!(fingerprint = fingerprint.short(), error = %e, "Plan store lookup failed");
                None
            }
        }
    }

    async fn decompose(&self, request: &str, context: &PlanningContext) -> PlexusResult<Plan> {
        let mut trace: Vec<String> = Vec::new();

        for strategy in &self.strategies {
            let kind = strategy.kind();
            let mut plan = match strategy.decompose(request, context).await {
                Ok(plan) => plan,
                Err(e) if e.is_structural() => return Err(e),
                Err(e) => {
                    debug!(strategy = %kind, error = %e, "Strategy failed");
                    trace.push(format!("{kind}: failed: {e}"));
                    continue;
                }
            };

            if plan.graph.is_empty() {
                trace.push(format!("{kind}: produced an empty graph"));
                continue;
            }
            plan.graph.validate()?;
            if plan.graph.len() > self.max_tasks {
                trace.push(format!(
                    "{kind}: rejected, {} tasks exceed the limit of {}",
                    plan.graph.len(),
                    self.max_tasks
                ));
                continue;
            }
            if plan.confidence < self.confidence_floor {
                trace.push(format!(
                    "{kind}: rejected, confidence {:.2} below floor {:.2}",
                    plan.confidence, self.confidence_floor
                ));
                continue;
            }

            trace.push(format!("{kind}: accepted at confidence {:.2}", plan.confidence));
            trace.append(&mut plan.reasoning_trace);
            plan.reasoning_trace = trace;
            return Ok(plan);
        }

        if self.strategies.is_empty() {
            trace.push("no strategies configured".to_string());
        }
        Err(PlexusError::Decomposition(format!(
            "no strategy produced a usable plan ({})",
            trace.join("; ")
        )))
    }

    fn emit_completed(&self, plan: &Plan, fingerprint: &Fingerprint, elapsed: Duration, cache_hit: bool) {
        self.emitter.emit(OrchestrationEvent::PlanningCompleted {
            plan_id: plan.id,
            fingerprint: fingerprint.to_string(),
            strategy: plan.strategy_used.to_string(),
            confidence: plan.confidence,
            task_count: plan.graph.len(),
            duration_ms: elapsed.as_millis() as u64,
            cache_hit,
            timestamp: Utc::now(),
        });
    }
}
