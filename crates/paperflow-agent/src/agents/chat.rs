use crate::agent::{Agent, AgentFactory, AgentOutput, AgentRequest, UserContext};
use crate::agents::provider::{instruction_for, render_prompt};
use crate::provider::{PromptMessage, ProviderClient, ProviderRequest};
use async_trait::async_trait;
use paperflow_core::{AgentError, Capability, PaperflowResult};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Conversational agent bound to one user. Keeps that user's history.
pub struct ChatAgent {
    user_id: String,
    client: Arc<dyn ProviderClient>,
    model: String,
    max_output_tokens: u32,
    history: Mutex<Vec<PromptMessage>>,
}

impl ChatAgent {
    /// A chat agent for `user_id` with empty history, capped at 1024 output tokens.
    pub fn new(user_id: impl Into<String>, client: Arc<dyn ProviderClient>, model: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            client,
            model: model.into(),
            max_output_tokens: 1024,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Cap completion tokens per turn.
    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = max;
        self
    }

    /// Owner of this agent.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Number of messages held, both sides.
    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }
}

#[async_trait]
impl Agent for ChatAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
        if request.user_id.as_deref().is_some_and(|u| u != self.user_id) {
            return Err(AgentError::permanent(format!(
                "chat agent of '{}' cannot serve another user",
                self.user_id
            )));
        }
        let Some(message) = request.input_str("message").map(str::to_string) else {
            return Err(AgentError::permanent("chat input needs a 'message' field"));
        };

        // held for the whole turn so turns of one user never interleave
        let mut history = self.history.lock().await;
        history.push(PromptMessage::user(message));

        let mut system = instruction_for(Capability::Chat).to_string();
        let context = render_prompt(&AgentRequest {
            input: serde_json::Value::Null,
            ..request.clone()
        });
        if !context.trim().is_empty() {
            system.push_str("\n\nContext:\n");
            system.push_str(&context);
        }

        let provider_request = ProviderRequest::new(self.model.clone(), history.clone())
            .with_system(system)
            .with_max_output_tokens(self.max_output_tokens);
        let response = match self.client.complete(provider_request).await {
            Ok(r) => r,
            Err(e) => {
                history.pop();
                return Err(e.into());
            }
        };

        history.push(PromptMessage::assistant(response.output.clone()));
        let turns = history.len() / 2;
        debug!(user = %self.user_id, turns, "Chat turn completed");
        Ok(AgentOutput::new(json!({
            "reply": response.output,
            "turns": turns,
        }))
        .with_usage(response.usage))
    }

    async fn shutdown(&self) {
        self.history.lock().await.clear();
    }
}

/// Builds one [`ChatAgent`] per user.
pub struct ChatAgentFactory {
    client: Arc<dyn ProviderClient>,
    model: String,
    max_output_tokens: u32,
}

impl ChatAgentFactory {
    /// A factory whose agents share `client` and `model`.
    pub fn new(client: Arc<dyn ProviderClient>, model: impl Into<String>, max_output_tokens: u32) -> Self {
        Self {
            client,
            model: model.into(),
            max_output_tokens,
        }
    }
}

#[async_trait]
impl AgentFactory for ChatAgentFactory {
    async fn create(&self, user: &UserContext) -> PaperflowResult<Arc<dyn Agent>> {
        Ok(Arc::new(
            ChatAgent::new(user.user_id.clone(), self.client.clone(), self.model.clone())
                .with_max_output_tokens(self.max_output_tokens),
        ))
    }
}
