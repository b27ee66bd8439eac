//! Post-execution result verification.
//!
//! Verification is a pure read over an executed [`TaskGraph`]: it never
//! mutates tasks and never raises. Callers that want an error can use
//! [`VerificationReport::ensure_passed`].

use crate::graph::TaskGraph;
use crate::types::{Task, TaskId, TaskStatus};
use plexus_core::{PlexusError, PlexusResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// How much checking the verifier applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLevel {
    /// Completed with a result.
    Basic,
    /// Basic plus the task's result contract.
    #[default]
    Strict,
    /// Strict plus schema re-checks and low-confidence review flagging.
    Paranoid,
}

impl std::fmt::Display for VerificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationLevel::Basic => write!(f, "basic"),
            VerificationLevel::Strict => write!(f, "strict"),
            VerificationLevel::Paranoid => write!(f, "paranoid"),
        }
    }
}

impl std::str::FromStr for VerificationLevel {
    type Err = PlexusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(VerificationLevel::Basic),
            "strict" => Ok(VerificationLevel::Strict),
            "paranoid" => Ok(VerificationLevel::Paranoid),
            other => Err(PlexusError::Config(format!(
                "unknown verification level '{other}'"
            ))),
        }
    }
}

/// JSON shape of a result value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    #[default]
    Any,
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ResultKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ResultKind::Null,
            Value::Bool(_) => ResultKind::Bool,
            Value::Number(_) => ResultKind::Number,
            Value::String(_) => ResultKind::String,
            Value::Array(_) => ResultKind::Array,
            Value::Object(_) => ResultKind::Object,
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        self == ResultKind::Any || self == ResultKind::of(value)
    }
}

impl std::fmt::Display for ResultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultKind::Any => "any",
            ResultKind::Null => "null",
            ResultKind::Bool => "bool",
            ResultKind::Number => "number",
            ResultKind::String => "string",
            ResultKind::Array => "array",
            ResultKind::Object => "object",
        };
        f.write_str(s)
    }
}

/// Declared shape of an action's result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultContract {
    #[serde(default)]
    pub kind: ResultKind,
    /// Fields an object result must carry.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Expected kind per field, checked at paranoid level.
    #[serde(default)]
    pub field_kinds: BTreeMap<String, ResultKind>,
    /// Strings, arrays and objects must not be empty.
    #[serde(default)]
    pub non_empty: bool,
}

impl ResultContract {
    pub fn of_kind(kind: ResultKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// An object contract.
    pub fn object() -> Self {
        Self::of_kind(ResultKind::Object)
    }

    pub fn with_required_field(mut self, field: impl Into<String>) -> Self {
        self.required_fields.push(field.into());
        self
    }

    pub fn with_field_kind(mut self, field: impl Into<String>, kind: ResultKind) -> Self {
        self.field_kinds.insert(field.into(), kind);
        self
    }

    pub fn non_empty(mut self) -> Self {
        self.non_empty = true;
        self
    }

    /// Shape checks applied at strict level. Returns the first violation.
    fn check_shape(&self, value: &Value) -> Result<(), String> {
        if !self.kind.matches(value) {
            return Err(format!(
                "expected {} result, got {}",
                self.kind,
                ResultKind::of(value)
            ));
        }

        if !self.required_fields.is_empty() {
            let Some(object) = value.as_object() else {
                return Err(format!(
                    "expected object with fields {:?}, got {}",
                    self.required_fields,
                    ResultKind::of(value)
                ));
            };
            if let Some(missing) = self
                .required_fields
                .iter()
                .find(|field| !object.contains_key(field.as_str()))
            {
                return Err(format!("missing required field '{missing}'"));
            }
        }

        if self.non_empty && is_empty_value(value) {
            return Err("result is empty".to_string());
        }

        Ok(())
    }

    /// Schema re-check applied at paranoid level.
    fn check_schema(&self, value: &Value) -> Result<(), String> {
        let Some(object) = value.as_object() else {
            return Ok(());
        };
        for (field, kind) in &self.field_kinds {
            if let Some(field_value) = object.get(field) {
                if !kind.matches(field_value) {
                    return Err(format!(
                        "field '{field}' should be {kind}, got {}",
                        ResultKind::of(field_value)
                    ));
                }
            }
        }
        Ok(())
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn is_blank_string(value: &Value) -> bool {
    matches!(value, Value::String(s) if !s.is_empty() && s.trim().is_empty())
}

/// Outcome of verifying one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub task_id: TaskId,
    pub passed: bool,
    pub level: VerificationLevel,
    pub explanation: String,
    /// Passed, but should be looked at by a human before it is trusted.
    #[serde(default)]
    pub needs_review: bool,
}

/// Per-task verification results for one graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub level: VerificationLevel,
    pub results: BTreeMap<TaskId, VerificationResult>,
}

impl VerificationReport {
    pub fn get(&self, task_id: &str) -> Option<&VerificationResult> {
        self.results.get(task_id)
    }

    pub fn all_passed(&self) -> bool {
        self.results.values().all(|r| r.passed)
    }

    /// Ids of tasks that failed verification.
    pub fn failed(&self) -> Vec<TaskId> {
        self.results
            .values()
            .filter(|r| !r.passed)
            .map(|r| r.task_id.clone())
            .collect()
    }

    /// Ids of tasks that passed but were flagged for review.
    pub fn flagged(&self) -> Vec<TaskId> {
        self.results
            .values()
            .filter(|r| r.passed && r.needs_review)
            .map(|r| r.task_id.clone())
            .collect()
    }

    pub fn ensure_passed(&self) -> PlexusResult<()> {
        let failed = self.failed();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(PlexusError::VerificationFailure {
                task_ids: failed.into_iter().map(|id| id.to_string()).collect(),
            })
        }
    }
}

/// Checks executed task results against per-action contracts.
#[derive(Debug, Clone)]
pub struct Verifier {
    contracts: HashMap<String, ResultContract>,
    review_threshold: f64,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Verifier {
    pub fn new() -> Self {
        Self {
            contracts: HashMap::new(),
            review_threshold: 0.6,
        }
    }

    /// Results reporting a `confidence` below this are flagged at paranoid level.
    pub fn with_review_threshold(mut self, threshold: f64) -> Self {
        self.review_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Declare the result contract of an action. A task's own
    /// `expectation` takes precedence.
    pub fn with_contract(mut self, action: impl Into<String>, contract: ResultContract) -> Self {
        self.contracts.insert(action.into(), contract);
        self
    }

    pub fn contract_for<'a>(&'a self, task: &'a Task) -> Option<&'a ResultContract> {
        task.expectation
            .as_ref()
            .or_else(|| self.contracts.get(&task.action))
    }

    /// Verify every task of an executed graph.
    pub fn verify(&self, graph: &TaskGraph, level: VerificationLevel) -> VerificationReport {
        let results = graph
            .tasks()
            .map(|task| (task.id.clone(), self.verify_task(task, level)))
            .collect();
        VerificationReport { level, results }
    }

    pub fn verify_task(&self, task: &Task, level: VerificationLevel) -> VerificationResult {
        let verdict = |passed: bool, explanation: String, needs_review: bool| VerificationResult {
            task_id: task.id.clone(),
            passed,
            level,
            explanation,
            needs_review,
        };

        if task.status != TaskStatus::Completed {
            return verdict(false, format!("task ended {}", task.status), false);
        }
        let Some(result) = task.result.as_ref() else {
            return verdict(false, "completed without a result".to_string(), false);
        };
        if level == VerificationLevel::Basic {
            return verdict(true, "completed with a result".to_string(), false);
        }

        let contract = self.contract_for(task);
        if let Some(contract) = contract {
            if let Err(reason) = contract.check_shape(result) {
                return verdict(false, reason, false);
            }
        }
        if level == VerificationLevel::Strict {
            let explanation = match contract {
                Some(_) => "result matches its contract",
                None => "no contract declared",
            };
            return verdict(true, explanation.to_string(), false);
        }

        if let Some(contract) = contract {
            if let Err(reason) = contract.check_schema(result) {
                return verdict(false, reason, false);
            }
        }
        if is_blank_string(result) {
            return verdict(false, "result is blank".to_string(), false);
        }
        if let Some(object) = result.as_object() {
            if let Some((field, _)) = object.iter().find(|(_, v)| is_blank_string(v)) {
                return verdict(false, format!("field '{field}' is blank"), false);
            }
        }

        match result.get("confidence").and_then(Value::as_f64) {
            Some(confidence) if confidence < self.review_threshold => verdict(
                true,
                format!(
                    "confidence {confidence:.2} below review threshold {:.2}",
                    self.review_threshold
                ),
                true,
            ),
            _ => verdict(true, "result passed paranoid checks".to_string(), false),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn completed(id: &str, action: &str, result: Value) -> Task {
        let mut task = Task::new(id, action);
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task
    }

    #[test]
    fn test_basic_requires_completion_and_result() {
        let verifier = Verifier::new();
        let ok = completed("a", "fetch", json!("body"));
        assert!(verifier.verify_task(&ok, VerificationLevel::Basic).passed);

        let mut no_result = Task::new("b", "fetch");
        no_result.status = TaskStatus::Completed;
        let result = verifier.verify_task(&no_result, VerificationLevel::Basic);
        assert!(!result.passed);
        assert_eq!(result.explanation, "completed without a result");

        let mut failed = Task::new("c", "fetch");
        failed.status = TaskStatus::Failed;
        let result = verifier.verify_task(&failed, VerificationLevel::Basic);
        assert!(!result.passed);
        assert_eq!(result.explanation, "task ended failed");
    }

    #[test]
    fn test_strict_applies_action_contract() {
        let verifier = Verifier::new().with_contract(
            "summarize",
            ResultContract::object().with_required_field("summary"),
        );

        let good = completed("s", "summarize", json!({"summary": "short"}));
        assert!(verifier.verify_task(&good, VerificationLevel::Strict).passed);

        let missing = completed("s", "summarize", json!({"text": "short"}));
        let result = verifier.verify_task(&missing, VerificationLevel::Strict);
        assert!(!result.passed);
        assert!(result.explanation.contains("summary"));

        let wrong_kind = completed("s", "summarize", json!("plain text"));
        assert!(!verifier.verify_task(&wrong_kind, VerificationLevel::Strict).passed);

        // Basic ignores contracts entirely.
        assert!(verifier.verify_task(&wrong_kind, VerificationLevel::Basic).passed);
    }

    #[test]
    fn test_task_expectation_overrides_action_contract() {
        let verifier =
            Verifier::new().with_contract("fetch", ResultContract::of_kind(ResultKind::Object));
        let task = completed("f", "fetch", json!("raw"))
            .expecting(ResultContract::of_kind(ResultKind::String).non_empty());
        assert!(verifier.verify_task(&task, VerificationLevel::Strict).passed);

        let empty = completed("f", "fetch", json!(""))
            .expecting(ResultContract::of_kind(ResultKind::String).non_empty());
        assert!(!verifier.verify_task(&empty, VerificationLevel::Strict).passed);
    }

    #[test]
    fn test_paranoid_checks_field_kinds() {
        let contract = ResultContract::object()
            .with_required_field("count")
            .with_field_kind("count", ResultKind::Number);
        let verifier = Verifier::new().with_contract("count", contract);

        let bad = completed("c", "count", json!({"count": "three"}));
        assert!(verifier.verify_task(&bad, VerificationLevel::Strict).passed);
        let result = verifier.verify_task(&bad, VerificationLevel::Paranoid);
        assert!(!result.passed);
        assert!(result.explanation.contains("count"));
    }

    #[test]
    fn test_paranoid_rejects_blank_strings() {
        let verifier = Verifier::new();
        let blank = completed("b", "echo", json!("   "));
        assert!(verifier.verify_task(&blank, VerificationLevel::Strict).passed);
        assert!(!verifier.verify_task(&blank, VerificationLevel::Paranoid).passed);

        let blank_field = completed("b", "echo", json!({"title": "\t"}));
        assert!(!verifier.verify_task(&blank_field, VerificationLevel::Paranoid).passed);
    }

    #[test]
    fn test_paranoid_flags_low_confidence_without_failing() {
        let verifier = Verifier::new().with_review_threshold(0.7);
        let shaky = completed("x", "classify", json!({"label": "spam", "confidence": 0.4}));
        let result = verifier.verify_task(&shaky, VerificationLevel::Paranoid);
        assert!(result.passed);
        assert!(result.needs_review);

        let sure = completed("y", "classify", json!({"label": "ham", "confidence": 0.95}));
        assert!(!verifier.verify_task(&sure, VerificationLevel::Paranoid).needs_review);
    }

    #[test]
    fn test_verify_graph_does_not_mutate() {
        let mut graph = TaskGraph::new();
        graph.add_task(completed("a", "echo", json!(1))).unwrap();
        graph.add_task(Task::new("b", "echo").depends_on("a")).unwrap();
        let before = graph.clone();

        let report = Verifier::new().verify(&graph, VerificationLevel::Strict);
        assert_eq!(graph, before);
        assert_eq!(report.results.len(), 2);
        assert!(!report.all_passed());
        assert_eq!(report.failed(), vec![TaskId::from("b")]);
        assert!(report.get("a").unwrap().passed);

        match report.ensure_passed() {
            Err(PlexusError::VerificationFailure { task_ids }) => assert_eq!(task_ids, vec!["b"]),
            other => panic!("expected verification failure, got {other:?}"),
        }
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!(
            "Paranoid".parse::<VerificationLevel>().unwrap(),
            VerificationLevel::Paranoid
        );
        assert!("lenient".parse::<VerificationLevel>().is_err());
        assert_eq!(VerificationLevel::default(), VerificationLevel::Strict);
    }
}
