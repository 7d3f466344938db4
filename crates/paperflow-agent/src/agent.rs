use async_trait::async_trait;
use paperflow_core::{AgentError, Capability, PaperflowResult, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// One invocation of an agent for one task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Workflow run this call belongs to.
    pub correlation_id: Uuid,
    /// Task within the run.
    pub task_id: String,
    /// Capability being invoked.
    pub capability: Capability,
    /// The task's own input payload.
    pub input: Value,
    /// Outputs of upstream tasks, keyed by task id.
    #[serde(default)]
    pub upstream: BTreeMap<String, Value>,
    /// Owner of the request; `None` for system operations.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Zero-based attempt number.
    #[serde(default)]
    pub attempt: u32,
}

impl AgentRequest {
    /// A standalone request with a fresh correlation id; the task id
    /// defaults to the capability name.
    pub fn new(capability: Capability, input: Value) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            task_id: capability.to_string(),
            capability,
            input,
            upstream: BTreeMap::new(),
            user_id: None,
            attempt: 0,
        }
    }

    /// Attach the output of an upstream task.
    pub fn with_upstream(mut self, task_id: impl Into<String>, output: Value) -> Self {
        self.upstream.insert(task_id.into(), output);
        self
    }

    /// Run on behalf of a user.
    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// String field of the input payload.
    pub fn input_str(&self, field: &str) -> Option<&str> {
        self.input.get(field).and_then(Value::as_str)
    }
}

/// Result of a successful agent call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    /// Task result handed to downstream tasks.
    pub payload: Value,
    /// Tokens spent on the provider, if the agent called one.
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl AgentOutput {
    /// A payload with no provider usage.
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            usage: None,
        }
    }

    /// Record the tokens the provider reported.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// The capability-invocation interface every agent variant implements.
///
/// To add a new agent type, implement this trait and register an instance
/// (or an [`AgentFactory`] for user-scoped agents) with the registry. The
/// orchestrator never needs to change.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Perform the capability for one task attempt.
    async fn invoke(&self, request: AgentRequest) -> Result<AgentOutput, AgentError>;

    /// Release resources when the owning session ends.
    async fn shutdown(&self) {}
}

/// Identity of the user a request runs for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserContext {
    /// Caller-supplied user identifier.
    pub user_id: String,
}

impl UserContext {
    /// Context for one user.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Creates user-scoped agents on first use.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    /// Build a fresh agent bound to `user`.
    async fn create(&self, user: &UserContext) -> PaperflowResult<Arc<dyn Agent>>;
}
