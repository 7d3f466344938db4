//! Core types and error definitions for the Paperflow engine.
//!
//! This crate provides the foundational types shared across all Paperflow crates,
//! including error handling, capability and provider identifiers, the agent error
//! taxonomy, configuration loading, and tracing bootstrap.
//!
//! # Main types
//!
//! - [`PaperflowError`] — Unified error enum for all Paperflow subsystems.
//! - [`PaperflowResult`] — Convenience alias for `Result<T, PaperflowError>`.
//! - [`Capability`] — What an agent can do (extraction, summarization, ...).
//! - [`ProviderId`] — Identifier of an external AI or metadata provider.
//! - [`AgentError`] — Transient/permanent failure returned by an agent call.
//! - [`TokenUsage`] — Token counts reported by one provider call.
//! - [`PaperflowConfig`] — TOML configuration surface.

/// TOML configuration surface.
pub mod config;
/// Unified error type.
pub mod error;
/// Tracing subscriber bootstrap.
pub mod telemetry;

pub use config::PaperflowConfig;
pub use error::{PaperflowError, PaperflowResult};

use serde::{Deserialize, Serialize};
use std::str::FromStr;

// --- Capabilities ---

/// A capability an agent advertises and a task requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Pull plain text out of a paper.
    TextExtraction,
    /// Look up bibliographic metadata on Crossref.
    CrossrefLookup,
    /// Look up bibliographic metadata on Semantic Scholar.
    SemanticScholarLookup,
    /// Merge metadata gathered from several sources.
    MetadataMerge,
    /// Summarize a paper.
    Summarization,
    /// Compare several papers against each other.
    Comparison,
    /// Interactive chat bound to one user's conversation.
    Chat,
    /// Persist workflow outputs.
    Storage,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 8] = [
        Capability::TextExtraction,
        Capability::CrossrefLookup,
        Capability::SemanticScholarLookup,
        Capability::MetadataMerge,
        Capability::Summarization,
        Capability::Comparison,
        Capability::Chat,
        Capability::Storage,
    ];

    /// Stable snake_case name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::TextExtraction => "text_extraction",
            Capability::CrossrefLookup => "crossref_lookup",
            Capability::SemanticScholarLookup => "semantic_scholar_lookup",
            Capability::MetadataMerge => "metadata_merge",
            Capability::Summarization => "summarization",
            Capability::Comparison => "comparison",
            Capability::Chat => "chat",
            Capability::Storage => "storage",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = PaperflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| PaperflowError::Config(format!("Unknown capability '{s}'")))
    }
}

// --- Providers ---

/// Identifier of an external provider (an AI API or a metadata service).
///
/// Open-ended on purpose: pricing and rate limits are keyed by this id and
/// unknown ids fall back to unthrottled, zero-cost behavior.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    /// Creates a provider id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// --- Agent scope ---

/// Lifetime of an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentScope {
    /// Created once at process start and shared by every request.
    #[default]
    System,
    /// Created lazily per user and torn down with that user's session.
    User,
}

impl std::fmt::Display for AgentScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentScope::System => write!(f, "system"),
            AgentScope::User => write!(f, "user"),
        }
    }
}

// --- Agent errors ---

/// Failure returned across the agent invocation boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "lowercase")]
pub enum AgentError {
    /// Network or provider hiccup; worth retrying.
    #[error("transient agent error: {0}")]
    Transient(String),
    /// Invalid input or unsupported operation; retrying cannot help.
    #[error("permanent agent error: {0}")]
    Permanent(String),
}

impl AgentError {
    /// Creates a transient error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Creates a permanent error.
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether the failure is eligible for retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }
}

// --- Usage ---

/// Token counts reported by a single provider call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub input_tokens: u64,
    /// Tokens produced by the completion.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Creates a usage value.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Input plus output tokens.
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_round_trips_through_str() {
        for cap in Capability::ALL {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert!("teleportation".parse::<Capability>().is_err());
    }

    #[test]
    fn test_capability_serde_matches_as_str() {
        let json = serde_json::to_string(&Capability::SemanticScholarLookup).unwrap();
        assert_eq!(json, "\"semantic_scholar_lookup\"");
    }

    #[test]
    fn test_provider_id_is_transparent() {
        let id = ProviderId::from("anthropic");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"anthropic\"");
        assert_eq!(id.to_string(), "anthropic");
    }

    #[test]
    fn test_agent_error_classification() {
        assert!(AgentError::transient("503").is_transient());
        assert!(!AgentError::permanent("bad input").is_transient());
    }

    #[test]
    fn test_token_usage_total_saturates() {
        assert_eq!(TokenUsage::new(10, 5).total(), 15);
        assert_eq!(TokenUsage::new(u64::MAX, 1).total(), u64::MAX);
    }
}
