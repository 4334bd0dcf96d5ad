use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use fxhash::FxHashMap;

/// The error type of action handlers, reported to the caller as a message.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type ActionResult = Result<serde_json::Value, BoxError>;

/// A named operation served over the control channel.
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    async fn call(&self, payload: serde_json::Value) -> ActionResult;
}

struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> ActionHandler for FnAction<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    async fn call(&self, payload: serde_json::Value) -> ActionResult {
        (self.0)(payload).await
    }
}

/// Dispatches incoming requests by action name.
#[derive(Clone, Default)]
pub struct ActionRouter {
    handlers: FxHashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `action` with an async closure, replacing any previous handler.
    pub fn with_action<F, Fut>(self, action: impl Into<String>, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        self.with_handler(action, Arc::new(FnAction(f)))
    }

    pub fn with_handler(
        mut self,
        action: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        self.handlers.insert(action.into(), handler);
        self
    }

    /// Add the actions of `other`, which take precedence on conflicts.
    pub fn merge(mut self, other: ActionRouter) -> Self {
        self.handlers.extend(other.handlers);
        self
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Run the handler of `action`, unknown actions are errors.
    pub async fn dispatch(
        &self,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let handler = self
            .handlers
            .get(action)
            .ok_or_else(|| format!("Unknown action: {action}"))?;
        handler.call(payload).await.map_err(|error| error.to_string())
    }
}
