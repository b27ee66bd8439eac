use crate::types::StrategyKind;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters shared by the planner, executor and verifier.
///
/// Constructed once by the composition root and handed out as
/// `Arc<Metrics>`; every field is an atomic so workers can record without
/// taking a lock.
#[derive(Debug, Default)]
pub struct Metrics {
    plans_created: AtomicU64,
    planning_failures: AtomicU64,
    rule_based_wins: AtomicU64,
    model_based_wins: AtomicU64,
    hybrid_wins: AtomicU64,
    planning_time_ms: AtomicU64,

    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,

    tasks_started: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_blocked: AtomicU64,
    tasks_skipped: AtomicU64,
    tasks_timed_out: AtomicU64,
    steals: AtomicU64,
    executions: AtomicU64,
    execution_time_ms: AtomicU64,

    verifications_passed: AtomicU64,
    verifications_failed: AtomicU64,
    verifications_flagged: AtomicU64,

    events_dropped: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn add_duration(counter: &AtomicU64, elapsed: Duration) {
    counter.fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly decomposed plan.
    pub fn record_plan(&self, strategy: StrategyKind, elapsed: Duration) {
        bump(&self.plans_created);
        add_duration(&self.planning_time_ms, elapsed);
        match strategy {
            StrategyKind::RuleBased => bump(&self.rule_based_wins),
            StrategyKind::ModelBased => bump(&self.model_based_wins),
            StrategyKind::Hybrid => bump(&self.hybrid_wins),
        }
    }

    pub fn record_planning_failure(&self) {
        bump(&self.planning_failures);
    }

    pub fn record_cache_hit(&self) {
        bump(&self.cache_hits);
    }

    pub fn record_cache_miss(&self) {
        bump(&self.cache_misses);
    }

    pub fn record_cache_evictions(&self, count: usize) {
        self.cache_evictions
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_task_started(&self) {
        bump(&self.tasks_started);
    }

    pub fn record_task_completed(&self) {
        bump(&self.tasks_completed);
    }

    pub fn record_task_failed(&self) {
        bump(&self.tasks_failed);
    }

    pub fn record_task_retried(&self) {
        bump(&self.tasks_retried);
    }

    pub fn record_task_blocked(&self) {
        bump(&self.tasks_blocked);
    }

    pub fn record_task_skipped(&self) {
        bump(&self.tasks_skipped);
    }

    pub fn record_task_timed_out(&self) {
        bump(&self.tasks_timed_out);
    }

    pub fn record_steal(&self) {
        bump(&self.steals);
    }

    pub fn record_execution(&self, elapsed: Duration) {
        bump(&self.executions);
        add_duration(&self.execution_time_ms, elapsed);
    }

    /// Record one verification verdict.
    pub fn record_verification(&self, passed: bool, needs_review: bool) {
        if !passed {
            bump(&self.verifications_failed);
        } else if needs_review {
            bump(&self.verifications_flagged);
        } else {
            bump(&self.verifications_passed);
        }
    }

    pub fn record_event_dropped(&self) {
        bump(&self.events_dropped);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let hits = load(&self.cache_hits);
        let misses = load(&self.cache_misses);
        MetricsSnapshot {
            planning: PlanningMetrics {
                plans_created: load(&self.plans_created),
                failures: load(&self.planning_failures),
                rule_based_wins: load(&self.rule_based_wins),
                model_based_wins: load(&self.model_based_wins),
                hybrid_wins: load(&self.hybrid_wins),
                total_time_ms: load(&self.planning_time_ms),
            },
            cache: CacheMetrics {
                hits,
                misses,
                evictions: load(&self.cache_evictions),
                hit_rate: if hits + misses == 0 {
                    0.0
                } else {
                    hits as f64 / (hits + misses) as f64
                },
            },
            execution: ExecutionMetrics {
                runs: load(&self.executions),
                tasks_started: load(&self.tasks_started),
                tasks_completed: load(&self.tasks_completed),
                tasks_failed: load(&self.tasks_failed),
                tasks_retried: load(&self.tasks_retried),
                tasks_blocked: load(&self.tasks_blocked),
                tasks_skipped: load(&self.tasks_skipped),
                tasks_timed_out: load(&self.tasks_timed_out),
                steals: load(&self.steals),
                total_time_ms: load(&self.execution_time_ms),
            },
            verification: VerificationMetrics {
                passed: load(&self.verifications_passed),
                failed: load(&self.verifications_failed),
                flagged: load(&self.verifications_flagged),
            },
            events_dropped: load(&self.events_dropped),
        }
    }

    /// Serialize the current counters as JSON (for dashboards).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanningMetrics {
    pub plans_created: u64,
    pub failures: u64,
    pub rule_based_wins: u64,
    pub model_based_wins: u64,
    pub hybrid_wins: u64,
    pub total_time_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub runs: u64,
    pub tasks_started: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_blocked: u64,
    pub tasks_skipped: u64,
    pub tasks_timed_out: u64,
    pub steals: u64,
    pub total_time_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationMetrics {
    pub passed: u64,
    pub failed: u64,
    pub flagged: u64,
}

/// Serializable view of [`Metrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub planning: PlanningMetrics,
    pub cache: CacheMetrics,
    pub execution: ExecutionMetrics,
    pub verification: VerificationMetrics,
    pub events_dropped: u64,
}
