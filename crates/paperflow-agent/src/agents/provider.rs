use crate::agent::{Agent, AgentOutput, AgentRequest};
use crate::provider::{PromptMessage, ProviderClient, ProviderRequest};
use async_trait::async_trait;
use paperflow_core::{AgentError, Capability};
use serde_json::{json, Value};
use std::fmt::Write;
use std::sync::Arc;
use tracing::debug;

/// Agent that fulfils one capability with a single provider completion.
pub struct ProviderAgent {
    capability: Capability,
    client: Arc<dyn ProviderClient>,
    model: String,
    max_output_tokens: u32,
}

impl ProviderAgent {
    /// An agent answering `capability` with `model`, capped at 1024 output tokens.
    pub fn new(capability: Capability, client: Arc<dyn ProviderClient>, model: impl Into<String>) -> Self {
        Self {
            capability,
            client,
            model: model.into(),
            max_output_tokens: 1024,
        }
    }

    /// Cap completion tokens.
    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = max;
        self
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }
}

/// System instruction for a capability.
pub fn instruction_for(capability: Capability) -> &'static str {
    match capability {
        Capability::TextExtraction => {
            "Extract the full plain text of the paper. Drop page headers, footers and line-break hyphenation."
        }
        Capability::Summarization => {
            "Summarize the paper: research question, method, main results and limitations."
        }
        Capability::Comparison => {
            "Compare the summarized papers. Point out shared ground, disagreements and which results are stronger."
        }
        Capability::MetadataMerge => {
            "Reconcile the metadata records into one record. Prefer values that agree across sources."
        }
        Capability::Chat => "Answer the user's questions about the paper.",
        Capability::CrossrefLookup | Capability::SemanticScholarLookup => {
            "Return bibliographic metadata for the paper as JSON."
        }
        Capability::Storage => "Describe the stored result.",
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) if map.len() == 1 => match map.values().next() {
            Some(Value::String(s)) => s.clone(),
            _ => value.to_string(),
        },
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Task input and upstream outputs rendered as one user prompt.
pub fn render_prompt(request: &AgentRequest) -> String {
    let mut prompt = String::new();
    if !request.input.is_null() {
        let _ = write!(prompt, "INPUT:\n{}\n", render_value(&request.input));
    }
    for (task_id, output) in &request.upstream {
        let _ = write!(prompt, "\n[{task_id}]\n{}\n", render_value(output));
    }
    prompt
}

#[async_trait]
impl Agent for ProviderAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
        if request.capability != self.capability {
            return Err(AgentError::permanent(format!(
                "agent serves '{}' but was asked for '{}'",
                self.capability, request.capability
            )));
        }
        let prompt = render_prompt(&request);
        if prompt.trim().is_empty() {
            return Err(AgentError::permanent(format!(
                "task '{}' has no input to work on",
                request.task_id
            )));
        }

        let provider_request = ProviderRequest::new(self.model.clone(), vec![PromptMessage::user(prompt)])
            .with_system(instruction_for(self.capability))
            .with_max_output_tokens(self.max_output_tokens);
        let response = self.client.complete(provider_request).await?;
        debug!(
            task = %request.task_id,
            provider = %self.client.provider(),
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Provider agent completed"
        );

        Ok(AgentOutput::new(json!({
            "text": response.output,
            "model": response.model,
        }))
        .with_usage(response.usage))
    }
}
