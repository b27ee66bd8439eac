use super::PlanningContext;
use crate::graph::TaskGraph;
use crate::types::{Dependency, Plan, StrategyKind, Task};
use plexus_core::{GenerationOptions, ModelBackend, PlexusError, PlexusResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const SYSTEM_PROMPT: &str = "You decompose requests into small executable tasks. \
Reply with a single JSON object and nothing else.";

/// A task as proposed by the model.
#[derive(Debug, Clone, Deserialize)]
pub struct ProposedTask {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub action: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Dependencies this task may run without if they fail.
    #[serde(default)]
    pub optional_depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ProposedTask {
    fn into_task(self) -> Task {
        let mut task = Task::new(self.id, self.action).with_priority(self.priority);
        if let Some(name) = self.name {
            task = task.with_name(name);
        }
        task.parameters = self.parameters;
        task.dependencies = self
            .depends_on
            .into_iter()
            .map(Dependency::required)
            .chain(self.optional_depends_on.into_iter().map(Dependency::optional))
            .collect();
        if let Some(max_retries) = self.max_retries {
            task.max_retries = max_retries;
        }
        task.timeout_ms = self.timeout_ms;
        task
    }
}

/// The JSON object the model is asked to return.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelProposal {
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Vec<String>,
    pub tasks: Vec<ProposedTask>,
}

/// Returns the first balanced `{ ... }` in `text`, ignoring braces inside
/// JSON strings. Code fences and surrounding prose are skipped.
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a model reply into `T`, tolerating prose and code fences around
/// the JSON object.
pub(crate) fn parse_reply<T: serde::de::DeserializeOwned>(reply: &str) -> PlexusResult<T> {
    let json = extract_json_object(reply).ok_or_else(|| {
        PlexusError::Decomposition("model reply contains no JSON object".into())
    })?;
    serde_json::from_str(json)
        .map_err(|e| PlexusError::Decomposition(format!("model reply is not a valid proposal: {e}")))
}

pub(crate) fn context_block(context: &PlanningContext) -> String {
    if context.attributes.is_empty() {
        return String::new();
    }
    let attributes = serde_json::to_string(&context.attributes).unwrap_or_default();
    format!("\nContext: {attributes}")
}

/// Delegates decomposition to a language model.
#[derive(Clone)]
pub struct ModelBasedStrategy {
    backend: Arc<dyn ModelBackend>,
    options: GenerationOptions,
    max_tasks: usize,
}

impl ModelBasedStrategy {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            backend,
            options: GenerationOptions {
                system_prompt: Some(SYSTEM_PROMPT.to_string()),
                ..Default::default()
            },
            max_tasks: 64,
        }
    }

    /// Proposals with more tasks than this are rejected.
    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    fn build_prompt(request: &str, context: &PlanningContext) -> String {
        format!(
            "Break the request below into tasks.\n\
             Respond with JSON: {{\"confidence\": <0..1>, \"reasoning\": [<string>], \
             \"tasks\": [{{\"id\": <string>, \"name\": <string>, \"action\": <string>, \
             \"parameters\": {{...}}, \"depends_on\": [<id>], \"optional_depends_on\": [<id>], \
             \"priority\": <int>}}]}}\n\
             Ids must be unique and dependencies must not form a cycle.{}\n\
             Request: {request}",
            context_block(context)
        )
    }

    pub async fn decompose(&self, request: &str, context: &PlanningContext) -> PlexusResult<Plan> {
        let prompt = Self::build_prompt(request, context);
        let generation = self
            .backend
            .generate(&prompt, &self.options)
            .await
            .map_err(|e| PlexusError::Decomposition(format!("model backend failed: {e}")))?;
        debug!(
            input_tokens = generation.usage.input_tokens,
            output_tokens = generation.usage.output_tokens,
            "Model proposal received"
        );

        let proposal: ModelProposal = parse_reply(&generation.text)?;
        if proposal.tasks.len() > self.max_tasks {
            return Err(PlexusError::Decomposition(format!(
                "model proposed {} tasks, limit is {}",
                proposal.tasks.len(),
                self.max_tasks
            )));
        }

        let task_count = proposal.tasks.len();
        let graph = TaskGraph::from_tasks(proposal.tasks.into_iter().map(ProposedTask::into_task))?;

        let mut trace = vec![format!("model_based: model proposed {task_count} tasks")];
        trace.extend(proposal.reasoning);
        Ok(Plan::new(request, graph, StrategyKind::ModelBased, proposal.confidence).with_trace(trace))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use plexus_core::Generation;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedBackend {
        reply: PlexusResult<String>,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(text.to_string()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> PlexusResult<Generation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(prompt.contains("Request:"));
            match &self.reply {
                Ok(text) => Ok(Generation::text(text.clone())),
                Err(e) => Err(PlexusError::Store(e.to_string())),
            }
        }
    }

    const PROPOSAL: &str = r#"Here is the plan:
```json
{"confidence": 0.8, "reasoning": ["split into fetch and digest"],
 "tasks": [
   {"id": "fetch", "action": "fetch", "parameters": {"url": "https://a.example/{x}"}},
   {"id": "digest", "action": "summarize", "depends_on": ["fetch"], "priority": 2}
 ]}
```"#;

    #[test]
    fn test_extract_json_object() {
        assert_eq!(extract_json_object("x {\"a\": {\"b\": 1}} y"), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json_object(r#"{"s": "}{"}"#), Some(r#"{"s": "}{"}"#));
        assert_eq!(extract_json_object(r#"{"s": "\"}"}"#), Some(r#"{"s": "\"}"}"#));
        assert_eq!(extract_json_object("no json"), None);
        assert_eq!(extract_json_object("{ unterminated"), None);
    }

    #[tokio::test]
    async fn test_model_proposal_becomes_plan() {
        let backend = ScriptedBackend::replying(PROPOSAL);
        let strategy = ModelBasedStrategy::new(backend.clone());
        let plan = strategy
            .decompose("digest the page", &PlanningContext::default())
            .await
            .unwrap();

        assert_eq!(plan.strategy_used, StrategyKind::ModelBased);
        assert!((plan.confidence - 0.8).abs() < f64::EPSILON);
        assert_eq!(plan.graph.len(), 2);
        let digest = plan.graph.get("digest").unwrap();
        assert_eq!(digest.action, "summarize");
        assert_eq!(digest.priority, 2);
        assert_eq!(plan.reasoning_trace[1], "split into fetch and digest");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_is_decomposition_error() {
        let backend = Arc::new(ScriptedBackend {
            reply: Err(PlexusError::Store("offline".into())),
            calls: AtomicU32::new(0),
        });
        let err = ModelBasedStrategy::new(backend)
            .decompose("anything", &PlanningContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlexusError::Decomposition(ref m) if m.contains("offline")));
    }

    #[tokio::test]
    async fn test_garbage_reply_is_decomposition_error() {
        let err = ModelBasedStrategy::new(ScriptedBackend::replying("I cannot help"))
            .decompose("anything", &PlanningContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlexusError::Decomposition(_)));
    }

    #[tokio::test]
    async fn test_oversized_proposal_rejected() {
        let err = ModelBasedStrategy::new(ScriptedBackend::replying(PROPOSAL))
            .with_max_tasks(1)
            .decompose("anything", &PlanningContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlexusError::Decomposition(ref m) if m.contains("limit")));
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_structural() {
        let reply = r#"{"confidence": 0.9, "tasks": [
            {"id": "a", "action": "x"}, {"id": "a", "action": "y"}]}"#;
        let err = ModelBasedStrategy::new(ScriptedBackend::replying(reply))
            .decompose("anything", &PlanningContext::default())
            .await
            .unwrap_err();
        assert!(err.is_structural());
    }
}
