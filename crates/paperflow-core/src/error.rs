use crate::{AgentError, Capability, ProviderId};
use thiserror::Error;

/// A convenience `Result` alias using [`PaperflowError`].
pub type PaperflowResult<T> = Result<T, PaperflowError>;

/// Top-level error type for the Paperflow engine.
#[derive(Error, Debug)]
pub enum PaperflowError {
    /// No registered agent advertises the capability.
    #[error("No agent advertises capability '{0}'")]
    CapabilityNotFound(Capability),

    /// Lazy creation of a user-scoped agent failed.
    #[error("Agent initialization failed for '{capability}': {reason}")]
    AgentInitializationFailed {
        /// Capability whose agent could not be created.
        capability: Capability,
        /// Why creation failed.
        reason: String,
    },

    /// The workflow definition contains a dependency cycle.
    #[error("Dependency cycle detected among tasks: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    /// Two tasks in one graph share an id.
    #[error("Duplicate task id '{0}'")]
    DuplicateTask(String),

    /// A task depends on an id that is not part of the graph.
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency {
        /// The dependent task.
        task: String,
        /// The missing upstream id.
        dependency: String,
    },

    /// No builder is registered under the workflow name.
    #[error("Unknown workflow '{0}'")]
    UnknownWorkflow(String),

    /// A builder rejected its parameters.
    #[error("Invalid parameters for workflow '{workflow}': {reason}")]
    InvalidWorkflowParams {
        /// The workflow name.
        workflow: String,
        /// What was wrong.
        reason: String,
    },

    /// No rate-limit token was available in time.
    #[error("Rate limit exceeded for provider '{provider}': {reason}")]
    RateLimitExceeded {
        /// The throttled provider.
        provider: ProviderId,
        /// Why the permit was refused.
        reason: String,
    },

    /// An agent call failed.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// Malformed accounting input; never stored.
    #[error("Invalid usage record: {0}")]
    InvalidUsageRecord(String),

    /// A call or workflow ran out of time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from an outbound HTTP request.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PaperflowError {
    /// Whether a task that hit this error may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            PaperflowError::RateLimitExceeded { .. }
            | PaperflowError::Timeout(_)
            | PaperflowError::Http(_) => true,
            PaperflowError::Agent(e) => e.is_transient(),
            _ => false,
        }
    }
}
