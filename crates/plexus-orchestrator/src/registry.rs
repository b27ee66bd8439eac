use async_trait::async_trait;
use plexus_core::{ActionError, ActionInvocation, ActionRegistry};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// An in-process action handler.
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, invocation: ActionInvocation) -> Result<Value, ActionError>;
}

/// Adapts an async closure into an [`Action`].
pub struct FnAction<F> {
    name: String,
    handler: F,
}

impl<F, Fut> FnAction<F>
where
    F: Fn(ActionInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(ActionInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, invocation: ActionInvocation) -> Result<Value, ActionError> {
        (self.handler)(invocation).await
    }
}

/// Dry-run handler: echoes what it was asked to do without side effects.
pub struct EchoAction {
    name: String,
}

impl EchoAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Action for EchoAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, invocation: ActionInvocation) -> Result<Value, ActionError> {
        let mut inputs: Vec<&String> = invocation.inputs.keys().collect();
        inputs.sort();
        Ok(serde_json::json!({
            "action": self.name,
            "parameters": invocation.parameters,
            "inputs": inputs,
            "dry_run": true,
        }))
    }
}

/// Registry of in-process actions keyed by name.
pub struct LocalActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl LocalActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// A registry that answers every listed action with an [`EchoAction`].
    pub fn dry_run<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut registry = Self::new();
        for name in names {
            registry.register(Arc::new(EchoAction::new(name)));
        }
        registry
    }

    pub fn register(&mut self, action: Arc<dyn Action>) {
        let name = action.name().to_string();
        info!(action = %name, "Registered action");
        self.actions.insert(name, action);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Action>> {
        self.actions.get(name)
    }

    /// Registered action names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }
}

impl Default for LocalActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionRegistry for LocalActionRegistry {
    async fn execute(&self, invocation: ActionInvocation) -> Result<Value, ActionError> {
        let action = self
            .actions
            .get(&invocation.action)
            .ok_or_else(|| ActionError::NotFound(invocation.action.clone()))?;
        action.run(invocation).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    fn invocation(action: &str) -> ActionInvocation {
        ActionInvocation {
            task_id: "t".into(),
            action: action.into(),
            parameters: HashMap::from([("url".to_string(), serde_json::json!("A"))]),
            inputs: HashMap::from([("fetch".to_string(), serde_json::json!("body"))]),
            attempt: 1,
            deadline: Instant::now() + Duration::from_secs(1),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_found() {
        let registry = LocalActionRegistry::new();
        let err = registry.execute(invocation("missing")).await.unwrap_err();
        assert_eq!(err, ActionError::NotFound("missing".into()));
    }

    #[tokio::test]
    async fn test_fn_action_dispatch() {
        let mut registry = LocalActionRegistry::new();
        registry.register(Arc::new(FnAction::new("length", |inv: ActionInvocation| async move {
            match inv.inputs.get("fetch").and_then(Value::as_str) {
                Some(body) => Ok(serde_json::json!(body.len())),
                None => Err(ActionError::InvalidArguments("no input".into())),
            }
        })));

        assert_eq!(registry.action_count(), 1);
        let out = registry.execute(invocation("length")).await.unwrap();
        assert_eq!(out, serde_json::json!(4));
    }

    #[tokio::test]
    async fn test_dry_run_echoes_invocation() {
        let registry = LocalActionRegistry::dry_run(["fetch", "email"]);
        assert_eq!(registry.names(), vec!["email", "fetch"]);

        let out = registry.execute(invocation("fetch")).await.unwrap();
        assert_eq!(out["action"], "fetch");
        assert_eq!(out["parameters"]["url"], "A");
        assert_eq!(out["inputs"], serde_json::json!(["fetch"]));
        assert_eq!(out["dry_run"], true);
    }
}
