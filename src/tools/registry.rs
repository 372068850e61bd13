use crate::types::ToolSpec;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A capability the model may invoke during an agent turn.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn input_schema(&self) -> Value;

    /// Runs the tool on the raw JSON parameters the model produced.
    fn call(&self, params: &str) -> BoxFuture<'static, anyhow::Result<Value>>;

    /// Renders a result for the model and for display.
    fn result_to_string(&self, result: &Value) -> anyhow::Result<String>;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),
    #[error("tool {name} failed: {source:#}")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("tool {name} timed out after {secs}s")]
    TimedOut { name: String, secs: u64 },
    #[error("tool {name} produced a result that could not be displayed: {source:#}")]
    Display {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: BTreeMap::new(),
            timeout,
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn catalog(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|tool| tool.spec()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Runs `name` under the registry timeout.
    pub async fn call(&self, name: &str, params: &str) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::Unknown(name.to_string()))?;
        match tokio::time::timeout(self.timeout, tool.call(params)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(ToolError::Failed {
                name: name.to_string(),
                source,
            }),
            Err(_) => Err(ToolError::TimedOut {
                name: name.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    pub fn result_to_string(&self, name: &str, result: &Value) -> Result<String, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::Unknown(name.to_string()))?;
        tool.result_to_string(result)
            .map_err(|source| ToolError::Display {
                name: name.to_string(),
                source,
            })
    }
}

/// Runs blocking filesystem work off the async runtime.
pub(crate) async fn run_blocking<T, F>(name: &str, work: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|join_error| anyhow::anyhow!("Tool execution task failed for {name}: {join_error}"))?
}
