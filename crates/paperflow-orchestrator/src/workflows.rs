//! Workflow builders: pure functions from request parameters to task graphs.

use crate::graph::{TaskGraph, TaskGraphBuilder};
use crate::types::TaskSpec;
use paperflow_core::{Capability, PaperflowError, PaperflowResult};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Turns workflow parameters into a task graph. Must not have side effects.
pub trait WorkflowBuilder: Send + Sync {
    /// Build a validated graph, or reject the parameters.
    fn build(&self, params: &Value) -> PaperflowResult<TaskGraph>;
}

impl<F> WorkflowBuilder for F
where
    F: Fn(&Value) -> PaperflowResult<TaskGraph> + Send + Sync,
{
    fn build(&self, params: &Value) -> PaperflowResult<TaskGraph> {
        self(params)
    }
}

/// Extract, summarize, enrich and store one paper.
pub const PAPER_PROCESSING: &str = "paper_processing";
/// Summarize several papers and compare the summaries.
pub const PAPER_COMPARISON: &str = "paper_comparison";
/// Look a paper up in every metadata source and merge the answers.
pub const METADATA_ENRICHMENT: &str = "metadata_enrichment";
/// One conversational turn with the user's chat agent.
pub const CHAT: &str = "chat";

/// Builders keyed by workflow name.
#[derive(Clone, Default)]
pub struct WorkflowCatalog {
    builders: BTreeMap<String, Arc<dyn WorkflowBuilder>>,
}

impl WorkflowCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// A catalog holding the built-in workflows.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register(PAPER_PROCESSING, paper_processing);
        catalog.register(PAPER_COMPARISON, paper_comparison);
        catalog.register(METADATA_ENRICHMENT, metadata_enrichment);
        catalog.register(CHAT, chat);
        catalog
    }

    /// Add or replace a builder.
    pub fn register(&mut self, name: impl Into<String>, builder: impl WorkflowBuilder + 'static) {
        self.builders.insert(name.into(), Arc::new(builder));
    }

    /// Whether a builder is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Registered workflow names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.builders.keys().cloned().collect()
    }

    /// Build the graph for workflow `name`.
    pub fn build(&self, name: &str, params: &Value) -> PaperflowResult<TaskGraph> {
        let builder = self
            .builders
            .get(name)
            .ok_or_else(|| PaperflowError::UnknownWorkflow(name.to_string()))?;
        builder.build(params)
    }
}

fn invalid(workflow: &str, reason: impl Into<String>) -> PaperflowError {
    PaperflowError::InvalidWorkflowParams {
        workflow: workflow.to_string(),
        reason: reason.into(),
    }
}

fn required_str<'a>(workflow: &str, params: &'a Value, field: &str) -> PaperflowResult<&'a str> {
    match params.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(_) => Err(invalid(workflow, format!("'{field}' must be a non-empty string"))),
        None => Err(invalid(workflow, format!("missing '{field}'"))),
    }
}

fn optional_str<'a>(workflow: &str, params: &'a Value, field: &str) -> PaperflowResult<Option<&'a str>> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(invalid(workflow, format!("'{field}' must be a string"))),
    }
}

fn metadata_lookups(builder: TaskGraphBuilder, paper_id: &str) -> TaskGraphBuilder {
    builder
        .task(
            TaskSpec::new("lookup_crossref", Capability::CrossrefLookup)
                .input(json!({ "paper_id": paper_id })),
        )
        .task(
            TaskSpec::new("lookup_semantic_scholar", Capability::SemanticScholarLookup)
                .input(json!({ "paper_id": paper_id })),
        )
}

fn merge_metadata() -> TaskSpec {
    TaskSpec::new("merge_metadata", Capability::MetadataMerge)
        .optionally_after(["lookup_crossref", "lookup_semantic_scholar"])
}

/// Extract, summarize and enrich one paper, then store the results.
///
/// `{ "paper_id": "...", "text": "..."? }`
pub fn paper_processing(params: &Value) -> PaperflowResult<TaskGraph> {
    let paper_id = required_str(PAPER_PROCESSING, params, "paper_id")?;
    let text = optional_str(PAPER_PROCESSING, params, "text")?;

    let mut extract_input = json!({ "paper_id": paper_id });
    if let Some(text) = text {
        extract_input["text"] = json!(text);
    }

    let builder = TaskGraph::builder().task(
        TaskSpec::new("extract", Capability::TextExtraction)
            .input(extract_input)
            .required(),
    );
    metadata_lookups(builder, paper_id)
        .task(
            TaskSpec::new("summarize", Capability::Summarization)
                .input(json!({ "paper_id": paper_id }))
                .after(["extract"])
                .required(),
        )
        .task(merge_metadata())
        .task(
            TaskSpec::new("store", Capability::Storage)
                .input(json!({ "paper_id": paper_id }))
                .after(["summarize"])
                .optionally_after(["merge_metadata"]),
        )
        .build()
}

/// Summarize several papers and compare them.
///
/// `{ "paper_ids": ["...", "..."] }`, at least two distinct ids.
pub fn paper_comparison(params: &Value) -> PaperflowResult<TaskGraph> {
    let ids = params
        .get("paper_ids")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(PAPER_COMPARISON, "missing 'paper_ids' array"))?;
    let mut seen = HashSet::new();
    let mut paper_ids = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(id) = id.as_str().filter(|s| !s.trim().is_empty()) else {
            return Err(invalid(PAPER_COMPARISON, "paper ids must be non-empty strings"));
        };
        if !seen.insert(id) {
            return Err(invalid(PAPER_COMPARISON, format!("paper '{id}' listed twice")));
        }
        paper_ids.push(id);
    }
    if paper_ids.len() < 2 {
        return Err(invalid(PAPER_COMPARISON, "need at least two papers to compare"));
    }

    let mut builder = TaskGraph::builder();
    let mut summaries = Vec::with_capacity(paper_ids.len());
    for (n, paper_id) in paper_ids.iter().enumerate() {
        let id = format!("summarize_{n}");
        builder.add_task(
            TaskSpec::new(id.clone(), Capability::Summarization)
                .input(json!({ "paper_id": paper_id })),
        );
        summaries.push(id);
    }
    builder.add_task(
        TaskSpec::new("compare", Capability::Comparison)
            .input(json!({ "paper_ids": paper_ids }))
            .after(summaries)
            .required(),
    );
    builder.build()
}

/// Look a paper up in every metadata source and merge the records.
///
/// `{ "paper_id": "..." }`
pub fn metadata_enrichment(params: &Value) -> PaperflowResult<TaskGraph> {
    let paper_id = required_str(METADATA_ENRICHMENT, params, "paper_id")?;
    metadata_lookups(TaskGraph::builder(), paper_id)
        .task(merge_metadata().required())
        .build()
}

/// One chat turn with the user's conversational agent.
///
/// `{ "message": "...", "paper_id": "..."? }`
pub fn chat(params: &Value) -> PaperflowResult<TaskGraph> {
    let message = required_str(CHAT, params, "message")?;
    let paper_id = optional_str(CHAT, params, "paper_id")?;
    let mut input = json!({ "message": message });
    if let Some(paper_id) = paper_id {
        input["paper_id"] = json!(paper_id);
    }
    TaskGraph::builder()
        .task(TaskSpec::new("chat", Capability::Chat).input(input).required())
        .build()
}
