use crate::agent::{Agent, AgentOutput, AgentRequest};
use async_trait::async_trait;
use paperflow_core::AgentError;
use serde_json::{json, Map, Value};

/// Merges metadata records from upstream lookups into one record.
///
/// Sources listed in `priority` are applied first, the rest in task-id
/// order. The first source to supply a field wins it.
#[derive(Debug, Clone, Default)]
pub struct MergeAgent {
    priority: Vec<String>,
}

impl MergeAgent {
    /// A merge with no priority sources; upstream outputs apply in task-id order.
    pub fn new() -> Self {
        Self::default()
    }

    /// A merge that applies the listed task ids first, in order.
    pub fn with_priority<I, S>(priority: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            priority: priority.into_iter().map(Into::into).collect(),
        }
    }
}

fn metadata_of(output: &Value) -> Option<&Map<String, Value>> {
    output
        .get("metadata")
        .unwrap_or(output)
        .as_object()
        .filter(|m| !m.is_empty())
}

#[async_trait]
impl Agent for MergeAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
        let mut ordered: Vec<(&String, &Value)> = self
            .priority
            .iter()
            .filter_map(|id| request.upstream.get_key_value(id))
            .collect();
        ordered.extend(
            request
                .upstream
                .iter()
                .filter(|(id, _)| !self.priority.contains(id)),
        );

        let mut merged = Map::new();
        let mut sources = Vec::new();
        for (task_id, output) in ordered {
            let Some(metadata) = metadata_of(output) else {
                continue;
            };
            for (field, value) in metadata {
                if !value.is_null() && !merged.contains_key(field) {
                    merged.insert(field.clone(), value.clone());
                }
            }
            sources.push(task_id.clone());
        }

        if merged.is_empty() {
            return Err(AgentError::permanent(format!(
                "task '{}' has no upstream metadata to merge",
                request.task_id
            )));
        }
        Ok(AgentOutput::new(json!({
            "metadata": merged,
            "sources": sources,
        })))
    }
}
