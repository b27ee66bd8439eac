use super::model_based::{context_block, parse_reply};
use super::rule_based::RuleBasedStrategy;
use super::PlanningContext;
use crate::types::{Plan, StrategyKind};
use plexus_core::{GenerationOptions, ModelBackend, PlexusError, PlexusResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

const SYSTEM_PROMPT: &str = "You fill in parameters for a fixed task plan. \
Reply with a single JSON object and nothing else.";

#[derive(Debug, Deserialize)]
struct ParameterFill {
    confidence: f64,
    #[serde(default)]
    parameters: HashMap<String, HashMap<String, serde_json::Value>>,
}

/// Rule-based skeleton with model-filled parameters.
///
/// The skeleton is accepted at any confidence; the plan's confidence is the
/// mean of the skeleton's and the model's.
#[derive(Clone)]
pub struct HybridStrategy {
    rules: RuleBasedStrategy,
    backend: Arc<dyn ModelBackend>,
    options: GenerationOptions,
}

impl HybridStrategy {
    pub fn new(rules: RuleBasedStrategy, backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            rules,
            backend,
            options: GenerationOptions {
                system_prompt: Some(SYSTEM_PROMPT.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    fn build_prompt(request: &str, skeleton: &Plan, context: &PlanningContext) -> String {
        let tasks: Vec<serde_json::Value> = skeleton
            .graph
            .tasks()
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "action": t.action,
                    "parameters": t.parameters,
                })
            })
            .collect();
        let tasks = serde_json::to_string(&tasks).unwrap_or_default();
        format!(
            "Request: {request}{}\n\
             Plan: {tasks}\n\
             Respond with JSON: {{\"confidence\": <0..1>, \
             \"parameters\": {{\"<task id>\": {{<name>: <value>}}}}}}",
            context_block(context)
        )
    }

    pub async fn decompose(&self, request: &str, context: &PlanningContext) -> PlexusResult<Plan> {
        let mut skeleton = self.rules.decompose(request, context)?;

        let prompt = Self::build_prompt(request, &skeleton, context);
        let generation = self
            .backend
            .generate(&prompt, &self.options)
            .await
            .map_err(|e| PlexusError::Decomposition(format!("model backend failed: {e}")))?;
        let fill: ParameterFill = parse_reply(&generation.text)?;

        let mut filled = 0usize;
        let mut unknown = Vec::new();
        for (task_id, parameters) in fill.parameters {
            match skeleton.graph.get_mut(&task_id) {
                Some(task) => {
                    task.parameters.extend(parameters);
                    filled += 1;
                }
                None => unknown.push(task_id),
            }
        }
        unknown.sort();

        let mut trace = vec![format!(
            "hybrid: rule skeleton at confidence {:.2}",
            skeleton.confidence
        )];
        trace.append(&mut skeleton.reasoning_trace);
        trace.push(format!("hybrid: model filled parameters for {filled} tasks"));
        if !unknown.is_empty() {
            trace.push(format!("hybrid: ignored parameters for unknown tasks {unknown:?}"));
        }

        let confidence = (skeleton.confidence + fill.confidence.clamp(0.0, 1.0)) / 2.0;
        Ok(Plan::new(request, skeleton.graph, StrategyKind::Hybrid, confidence)
            .with_trace(trace)
            .with_depth(2))
    }
}
