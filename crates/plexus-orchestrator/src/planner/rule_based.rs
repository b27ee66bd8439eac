use super::PlanningContext;
use crate::graph::TaskGraph;
use crate::types::{Plan, StrategyKind, Task, TaskId};
use plexus_core::{PlexusError, PlexusResult};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;

/// One task of a [`TaskTemplate`]. Parameter values may reference named
/// captures of the template pattern as `$name`.
#[derive(Debug, Clone)]
pub struct TemplateStep {
    pub id: String,
    pub action: String,
    pub depends_on: Vec<String>,
    pub parameters: Vec<(String, String)>,
}

impl TemplateStep {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            depends_on: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, template: impl Into<String>) -> Self {
        self.parameters.push((key.into(), template.into()));
        self
    }
}

/// A known request shape mapped to a fixed task layout.
#[derive(Debug, Clone)]
pub struct TaskTemplate {
    pub name: String,
    pub pattern: Regex,
    pub steps: Vec<TemplateStep>,
}

impl TaskTemplate {
    /// `pattern` is matched against the normalized (lowercased,
    /// whitespace-collapsed) request.
    pub fn new(name: impl Into<String>, pattern: &str, steps: Vec<TemplateStep>) -> PlexusResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| PlexusError::Config(format!("Invalid template pattern: {e}")))?;
        Ok(Self {
            name: name.into(),
            pattern,
            steps,
        })
    }

    /// "compare X and Y": fetch both sides in parallel, then compare.
    pub fn compare() -> PlexusResult<Self> {
        Self::new(
            "compare",
            r"^compare\s+(?P<left>.+?)\s+(?:and|with|to|against)\s+(?P<right>.+)$",
            vec![
                TemplateStep::new("fetch_left", "fetch").param("input", "$left"),
                TemplateStep::new("fetch_right", "fetch").param("input", "$right"),
                TemplateStep::new("compare", "compare")
                    .after("fetch_left")
                    .after("fetch_right")
                    .param("left", "$left")
                    .param("right", "$right"),
            ],
        )
    }

    fn instantiate(&self, request: &str, normalized: &str) -> PlexusResult<Option<Plan>> {
        let Some(captures) = self.pattern.captures(normalized) else {
            return Ok(None);
        };

        let mut tasks = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let mut task = Task::new(step.id.as_str(), step.action.as_str());
            for dep in &step.depends_on {
                task = task.depends_on(dep.as_str());
            }
            for (key, template) in &step.parameters {
                let mut value = String::new();
                captures.expand(template, &mut value);
                task = task.with_parameter(key.as_str(), serde_json::json!(value.trim()));
            }
            tasks.push(task);
        }

        let graph = TaskGraph::from_tasks(tasks)?;
        let plan = Plan::new(request, graph, StrategyKind::RuleBased, 1.0).with_trace(vec![format!(
            "rule_based: matched template '{}' ({} tasks)",
            self.name,
            self.steps.len()
        )]);
        Ok(Some(plan))
    }
}

#[allow(clippy::expect_used)]
fn step_separator() -> &'static Regex {
    static SEPARATOR: OnceLock<Regex> = OnceLock::new();
    SEPARATOR.get_or_init(|| {
        Regex::new(r"(?:\s*;\s*|,?\s+and\s+then\s+|,?\s+then\s+)")
            .expect("STEP_SEPARATOR is valid")
    })
}

fn default_vocabulary() -> BTreeMap<String, String> {
    let pairs: &[(&str, &str)] = &[
        ("fetch", "fetch"),
        ("get", "fetch"),
        ("download", "fetch"),
        ("retrieve", "fetch"),
        ("read", "fetch"),
        ("search", "search"),
        ("find", "search"),
        ("lookup", "search"),
        ("summarize", "summarize"),
        ("summarise", "summarize"),
        ("condense", "summarize"),
        ("translate", "translate"),
        ("analyze", "analyze"),
        ("analyse", "analyze"),
        ("classify", "classify"),
        ("extract", "extract"),
        ("compare", "compare"),
        ("write", "write"),
        ("draft", "write"),
        ("save", "store"),
        ("store", "store"),
        ("email", "email"),
        ("mail", "email"),
        ("send", "email"),
        ("notify", "notify"),
    ];
    pairs
        .iter()
        .map(|(verb, action)| (verb.to_string(), action.to_string()))
        .collect()
}

/// Lowercase, trim and collapse runs of whitespace.
pub fn normalize_request(request: &str) -> String {
    request
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Cheap deterministic decomposition: regex templates first, then a
/// sequential chain split on "then" / ";" with each step's leading verb
/// looked up in a vocabulary.
#[derive(Debug, Clone)]
pub struct RuleBasedStrategy {
    templates: Vec<TaskTemplate>,
    vocabulary: BTreeMap<String, String>,
}

impl Default for RuleBasedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleBasedStrategy {
    /// Default vocabulary and the built-in `compare` template.
    pub fn new() -> Self {
        Self {
            templates: TaskTemplate::compare().into_iter().collect(),
            vocabulary: default_vocabulary(),
        }
    }

    pub fn with_template(mut self, template: TaskTemplate) -> Self {
        self.templates.push(template);
        self
    }

    /// Map a leading verb to an action name.
    pub fn with_verb(mut self, verb: impl Into<String>, action: impl Into<String>) -> Self {
        self.vocabulary
            .insert(verb.into().to_lowercase(), action.into());
        self
    }

    /// Every action name this strategy can emit for known verbs and templates.
    pub fn known_actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self
            .vocabulary
            .values()
            .map(String::as_str)
            .chain(
                self.templates
                    .iter()
                    .flat_map(|t| t.steps.iter().map(|s| s.action.as_str())),
            )
            .collect();
        actions.sort_unstable();
        actions.dedup();
        actions
    }

    pub fn decompose(&self, request: &str, _context: &PlanningContext) -> PlexusResult<Plan> {
        let normalized = normalize_request(request);
        if normalized.is_empty() {
            return Err(PlexusError::Decomposition("empty request".into()));
        }

        for template in &self.templates {
            if let Some(plan) = template.instantiate(request, &normalized)? {
                return Ok(plan);
            }
        }

        self.sequential_chain(request, &normalized)
    }

    fn sequential_chain(&self, request: &str, normalized: &str) -> PlexusResult<Plan> {
        let steps: Vec<&str> = step_separator()
            .split(normalized)
            .map(|s| s.trim_matches(|c: char| c.is_whitespace() || c == ',' || c == '.'))
            .filter(|s| !s.is_empty())
            .collect();
        if steps.is_empty() {
            return Err(PlexusError::Decomposition("request has no steps".into()));
        }

        let mut used: HashSet<String> = HashSet::new();
        let mut counters: HashMap<String, usize> = HashMap::new();
        let mut tasks: Vec<Task> = Vec::with_capacity(steps.len());
        let mut known = 0usize;
        let mut trace = Vec::with_capacity(steps.len() + 1);

        for (index, step) in steps.iter().enumerate() {
            let (head, rest) = step.split_once(' ').unwrap_or((*step, ""));
            let verb: String = head.chars().filter(|c| c.is_alphanumeric()).collect();
            let action = match self.vocabulary.get(&verb) {
                Some(action) => {
                    known += 1;
                    action.clone()
                }
                None => verb.clone(),
            };

            let id = unique_id(&action, &mut used, &mut counters);
            let mut task = Task::new(id.as_str(), action.as_str())
                .with_name(*step)
                .with_parameter("input", serde_json::json!(rest.trim()));
            if let Some(previous) = tasks.last() {
                task = task.depends_on(previous.id.clone());
            }
            trace.push(format!("step {}: '{step}' -> {action}", index + 1));
            tasks.push(task);
        }

        let confidence = known as f64 / steps.len() as f64;
        trace.insert(
            0,
            format!(
                "rule_based: sequential chain of {} steps, {known} with known verbs",
                steps.len()
            ),
        );

        let graph = TaskGraph::from_tasks(tasks)?;
        Ok(Plan::new(request, graph, StrategyKind::RuleBased, confidence).with_trace(trace))
    }
}

fn unique_id(action: &str, used: &mut HashSet<String>, counters: &mut HashMap<String, usize>) -> TaskId {
    let base = if action.is_empty() { "step" } else { action };
    let mut candidate = base.to_string();
    while used.contains(&candidate) {
        let n = counters.entry(base.to_string()).or_insert(1);
        *n += 1;
        candidate = format!("{base}_{n}");
    }
    used.insert(candidate.clone());
    TaskId::from(candidate)
}
