use crate::agent::{Agent, AgentOutput, AgentRequest};
use crate::discovery::DiscoveryCache;
use async_trait::async_trait;
use paperflow_core::{AgentError, ProviderId};
use paperflow_security::{AcquireMode, RateLimiter};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// External bibliographic metadata service.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Provider id used for rate limiting and cache keys.
    fn provider(&self) -> &ProviderId;

    /// Fetch normalized metadata for one paper.
    async fn lookup(&self, paper_id: &str) -> Result<Value, AgentError>;
}

/// Metadata lookup agent.
///
/// Lookups go through the shared discovery cache keyed by
/// `"<source>:<paper_id>"`. Only a cache miss takes a rate-limit permit for
/// the source.
pub struct DiscoveryAgent {
    source: Arc<dyn MetadataSource>,
    cache: Arc<DiscoveryCache<Value>>,
    limiter: Arc<RateLimiter>,
    ttl: Option<Duration>,
    acquire_timeout: Duration,
}

impl DiscoveryAgent {
    /// A lookup agent over `source`, sharing `cache` and rate limits with
    /// the other lookup agents.
    pub fn new(
        source: Arc<dyn MetadataSource>,
        cache: Arc<DiscoveryCache<Value>>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            source,
            cache,
            limiter,
            ttl: None,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    /// Override the cache's default TTL for this source.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// How long a cache miss may wait for a rate-limit permit.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Cache key for `paper_id` in this source.
    pub fn cache_key(&self, paper_id: &str) -> String {
        format!("{}:{}", self.source.provider(), paper_id)
    }
}

#[async_trait]
impl Agent for DiscoveryAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
        let Some(paper_id) = request.input_str("paper_id") else {
            return Err(AgentError::permanent("metadata lookup needs a 'paper_id'"));
        };
        let provider = self.source.provider();
        let key = self.cache_key(paper_id);

        let metadata = self
            .cache
            .get_or_fetch(&key, self.ttl, move || async move {
                self.limiter
                    .acquire(provider, 1, AcquireMode::Wait(self.acquire_timeout))
                    .await
                    .map_err(|e| AgentError::transient(e.to_string()))?;
                self.source.lookup(paper_id).await
            })
            .await?;

        Ok(AgentOutput::new(json!({
            "source": provider,
            "paper_id": paper_id,
            "metadata": metadata,
        })))
    }
}
