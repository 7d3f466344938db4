use crate::{AgentScope, Capability, PaperflowError, PaperflowResult, ProviderId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root of the TOML configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperflowConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub metadata_sources: Vec<MetadataSourceConfig>,
}

/// Retry and timeout defaults applied by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,
}

impl OrchestratorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            workflow_timeout_secs: default_workflow_timeout_secs(),
        }
    }
}

/// Discovery cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Wire protocol spoken by an AI provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderApi {
    /// OpenAI-compatible chat completions (OpenAI, Groq, Gemini's compat endpoint, ...).
    OpenAi,
    /// Anthropic messages API.
    Anthropic,
}

/// Request ceilings for one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub requests_per_second: Option<f64>,
    #[serde(default)]
    pub requests_per_minute: Option<f64>,
    /// Bucket capacity; derived from the ceilings when absent.
    #[serde(default)]
    pub burst: Option<f64>,
}

impl RateLimitConfig {
    pub fn per_second(rps: f64) -> Self {
        Self {
            requests_per_second: Some(rps),
            ..Self::default()
        }
    }

    pub fn per_minute(rpm: f64) -> Self {
        Self {
            requests_per_minute: Some(rpm),
            ..Self::default()
        }
    }

    fn validate(&self, owner: &str) -> PaperflowResult<()> {
        if self.requests_per_second.is_none() && self.requests_per_minute.is_none() {
            return Err(PaperflowError::Config(format!(
                "rate limit for '{owner}' needs requests_per_second or requests_per_minute"
            )));
        }
        for value in [
            self.requests_per_second,
            self.requests_per_minute,
            self.burst,
        ]
        .into_iter()
        .flatten()
        {
            if !(value.is_finite() && value > 0.0) {
                return Err(PaperflowError::Config(format!(
                    "rate limit values for '{owner}' must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Price per 1K tokens in USD.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// One external AI provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: ProviderId,
    pub api: ProviderApi,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub pricing: Option<PricingConfig>,
}

impl ProviderConfig {
    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.base_url {
            url
        } else {
            match self.api {
                ProviderApi::OpenAi => "https://api.openai.com",
                ProviderApi::Anthropic => "https://api.anthropic.com",
            }
        }
    }
}

/// An agent to register at bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub capability: Capability,
    #[serde(default)]
    pub provider: Option<ProviderId>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub scope: AgentScope,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

/// External metadata service queried by discovery agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSourceKind {
    Crossref,
    SemanticScholar,
}

impl MetadataSourceKind {
    /// Provider id used for rate limiting and usage attribution.
    pub fn provider_id(&self) -> ProviderId {
        match self {
            MetadataSourceKind::Crossref => ProviderId::from("crossref"),
            MetadataSourceKind::SemanticScholar => ProviderId::from("semantic_scholar"),
        }
    }

    /// Capability served by agents backed by this source.
    pub fn capability(&self) -> Capability {
        match self {
            MetadataSourceKind::Crossref => Capability::CrossrefLookup,
            MetadataSourceKind::SemanticScholar => Capability::SemanticScholarLookup,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            MetadataSourceKind::Crossref => "https://api.crossref.org",
            MetadataSourceKind::SemanticScholar => "https://api.semanticscholar.org",
        }
    }
}

/// One metadata source and its request ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSourceConfig {
    pub id: MetadataSourceKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl MetadataSourceConfig {
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.id.default_base_url())
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_call_timeout_secs() -> u64 {
    120
}
fn default_workflow_timeout_secs() -> u64 {
    900
}
fn default_cache_ttl_secs() -> u64 {
    6 * 60 * 60
}
fn default_max_concurrency() -> usize {
    4
}
fn default_max_output_tokens() -> u32 {
    1024
}

impl Default for PaperflowConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            orchestrator: OrchestratorConfig::default(),
            cache: CacheConfig::default(),
            providers: Vec::new(),
            agents: Vec::new(),
            metadata_sources: Vec::new(),
        }
    }
}

impl PaperflowConfig {
    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> PaperflowResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PaperflowError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(raw: &str) -> PaperflowResult<Self> {
        let config: PaperflowConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn provider(&self, id: &ProviderId) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| &p.id == id)
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> PaperflowResult<()> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.clone()) {
                return Err(PaperflowError::Config(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
            if let Some(limit) = &provider.rate_limit {
                limit.validate(provider.id.as_str())?;
            }
            if let Some(pricing) = &provider.pricing {
                if pricing.input_per_1k < 0.0 || pricing.output_per_1k < 0.0 {
                    return Err(PaperflowError::Config(format!(
                        "pricing for '{}' must not be negative",
                        provider.id
                    )));
                }
            }
        }

        for agent in &self.agents {
            if agent.max_concurrency == 0 {
                return Err(PaperflowError::Config(format!(
                    "agent '{}' needs max_concurrency >= 1",
                    agent.capability
                )));
            }
            if let Some(provider) = &agent.provider {
                if self.provider(provider).is_none() {
                    return Err(PaperflowError::Config(format!(
                        "agent '{}' references unknown provider '{provider}'",
                        agent.capability
                    )));
                }
            }
        }

        for source in &self.metadata_sources {
            if let Some(limit) = &source.rate_limit {
                limit.validate(source.id.provider_id().as_str())?;
            }
        }

        if self.orchestrator.backoff_base_ms > self.orchestrator.backoff_max_ms {
            return Err(PaperflowError::Config(
                "backoff_base_ms must not exceed backoff_max_ms".to_string(),
            ));
        }
        Ok(())
    }
}
