//! Turns a [`PaperflowConfig`] into a ready orchestrator.

use paperflow_agent::agents::{
    ChatAgentFactory, DiscoveryAgent, FileStoreAgent, MergeAgent, ProviderAgent,
};
use paperflow_agent::{
    AgentDescriptor, AgentRegistry, DiscoveryCache, HttpMetadataSource, HttpProviderClient,
    ProviderClient,
};
use paperflow_core::config::AgentConfig;
use paperflow_core::{
    AgentScope, Capability, PaperflowConfig, PaperflowError, PaperflowResult, ProviderId,
};
use paperflow_orchestrator::Orchestrator;
use paperflow_security::RateLimiter;
use paperflow_usage::{Accountant, StaticPricing};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Task ids whose metadata wins when the default merge agent combines lookups.
const MERGE_PRIORITY: [&str; 2] = ["lookup_crossref", "lookup_semantic_scholar"];

/// Everything a run needs, wired from configuration.
pub struct Runtime {
    pub orchestrator: Orchestrator,
    pub cache: Arc<DiscoveryCache<Value>>,
}

/// Provider clients are built on first reference so unused providers
/// do not need their API keys set.
struct Clients<'a> {
    config: &'a PaperflowConfig,
    built: HashMap<ProviderId, Arc<dyn ProviderClient>>,
}

impl<'a> Clients<'a> {
    fn new(config: &'a PaperflowConfig) -> Self {
        Self {
            config,
            built: HashMap::new(),
        }
    }

    fn get(&mut self, id: &ProviderId) -> PaperflowResult<Arc<dyn ProviderClient>> {
        if let Some(client) = self.built.get(id) {
            return Ok(client.clone());
        }
        let provider = self
            .config
            .provider(id)
            .ok_or_else(|| PaperflowError::Config(format!("unknown provider '{id}'")))?;
        let client: Arc<dyn ProviderClient> = Arc::new(HttpProviderClient::from_config(provider)?);
        self.built.insert(id.clone(), client.clone());
        Ok(client)
    }
}

pub fn build_runtime(config: &PaperflowConfig) -> PaperflowResult<Runtime> {
    config.validate()?;

    let limits = config
        .providers
        .iter()
        .filter_map(|p| p.rate_limit.as_ref().map(|l| (p.id.clone(), l)))
        .chain(
            config
                .metadata_sources
                .iter()
                .filter_map(|s| s.rate_limit.as_ref().map(|l| (s.id.provider_id(), l))),
        );
    let limiter = Arc::new(RateLimiter::from_limits(limits));
    let accountant = Arc::new(Accountant::new(Arc::new(StaticPricing::from_config(
        &config.providers,
    ))));
    let registry = Arc::new(AgentRegistry::new());
    let mut clients = Clients::new(config);

    for agent in &config.agents {
        register_configured(&registry, &mut clients, agent)?;
    }

    let cache = Arc::new(DiscoveryCache::new(config.cache.ttl()));
    for source in &config.metadata_sources {
        let kind = source.id;
        let agent = DiscoveryAgent::new(
            Arc::new(HttpMetadataSource::from_config(source)),
            cache.clone(),
            limiter.clone(),
        )
        .with_acquire_timeout(config.orchestrator.call_timeout());
        // No provider affinity: the agent takes its own permit on cache misses.
        registry.register_system(
            AgentDescriptor::system(kind.capability()).named(kind.provider_id().as_str()),
            Arc::new(agent),
        )?;
    }

    let configured = registry.capabilities();
    if !configured.contains(&Capability::MetadataMerge) {
        registry.register_system(
            AgentDescriptor::system(Capability::MetadataMerge).named("merge"),
            Arc::new(MergeAgent::with_priority(MERGE_PRIORITY)),
        )?;
    }
    if !configured.contains(&Capability::Storage) {
        let dir = config.data_dir.join("results");
        registry.register_system(
            AgentDescriptor::system(Capability::Storage).named("file_store"),
            Arc::new(FileStoreAgent::new(dir)),
        )?;
    }

    info!(
        capabilities = registry.capabilities().len(),
        rate_limited = limiter.providers().len(),
        "Runtime ready"
    );

    let orchestrator =
        Orchestrator::new(registry, limiter, accountant).with_config(&config.orchestrator);
    Ok(Runtime {
        orchestrator,
        cache,
    })
}

fn register_configured(
    registry: &AgentRegistry,
    clients: &mut Clients<'_>,
    agent: &AgentConfig,
) -> PaperflowResult<()> {
    let capability = agent.capability;
    match (capability, &agent.provider) {
        (Capability::CrossrefLookup | Capability::SemanticScholarLookup, _) => {
            return Err(PaperflowError::Config(format!(
                "'{capability}' agents are configured under [[metadata_sources]]"
            )));
        }
        (Capability::MetadataMerge, None) => {
            return registry.register_system(
                AgentDescriptor::system(capability)
                    .named("merge")
                    .with_concurrency(agent.max_concurrency),
                Arc::new(MergeAgent::with_priority(MERGE_PRIORITY)),
            );
        }
        (Capability::Storage, None) => {
            return registry.register_system(
                AgentDescriptor::system(capability)
                    .named("file_store")
                    .with_concurrency(agent.max_concurrency),
                Arc::new(FileStoreAgent::new(clients.config.data_dir.join("results"))),
            );
        }
        (Capability::Storage, Some(_)) => {
            return Err(PaperflowError::Config(
                "storage agents do not call a provider".to_string(),
            ));
        }
        _ => {}
    }

    let provider = agent.provider.as_ref().ok_or_else(|| {
        PaperflowError::Config(format!("agent '{capability}' needs a provider"))
    })?;
    let model = agent.model.as_deref().ok_or_else(|| {
        PaperflowError::Config(format!("agent '{capability}' needs a model"))
    })?;
    let client = clients.get(provider)?;

    match (agent.scope, capability) {
        (AgentScope::User, Capability::Chat) => registry.register_user_scoped(
            AgentDescriptor::user(capability)
                .with_provider(provider.clone())
                .with_concurrency(agent.max_concurrency),
            Arc::new(ChatAgentFactory::new(client, model, agent.max_output_tokens)),
        ),
        (AgentScope::System, Capability::Chat) => Err(PaperflowError::Config(
            "chat agents keep per-user history and must use scope = \"user\"".to_string(),
        )),
        (AgentScope::User, _) => Err(PaperflowError::Config(format!(
            "only chat agents can be user-scoped, not '{capability}'"
        ))),
        (AgentScope::System, _) => registry.register_system(
            AgentDescriptor::system(capability)
                .named(format!("{capability}@{provider}"))
                .with_provider(provider.clone())
                .with_concurrency(agent.max_concurrency),
            Arc::new(
                ProviderAgent::new(capability, client, model)
                    .with_max_output_tokens(agent.max_output_tokens),
            ),
        ),
    }
}
