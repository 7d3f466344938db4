use crate::agent::{Agent, AgentFactory, UserContext};
use paperflow_core::{AgentError, AgentScope, Capability, PaperflowError, PaperflowResult, ProviderId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

/// Static description of an agent: what it does and how it may be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Name used in logs.
    pub name: String,
    /// Capability the agent serves.
    pub capability: Capability,
    /// Maximum calls in flight on one instance.
    pub max_concurrency: usize,
    /// Whether one instance serves everyone or each user gets their own.
    pub scope: AgentScope,
    /// Provider whose rate limit and pricing apply to this agent's calls.
    pub provider: Option<ProviderId>,
}

impl AgentDescriptor {
    /// A system-wide agent with a concurrency limit of 4 and no provider.
    pub fn system(capability: Capability) -> Self {
        Self {
            name: capability.to_string(),
            capability,
            max_concurrency: 4,
            scope: AgentScope::System,
            provider: None,
        }
    }

    /// A user-scoped agent with a concurrency limit of 1 and no provider.
    pub fn user(capability: Capability) -> Self {
        Self {
            max_concurrency: 1,
            scope: AgentScope::User,
            ..Self::system(capability)
        }
    }

    /// Override the log name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attribute calls to `provider`.
    pub fn with_provider(mut self, provider: impl Into<ProviderId>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Set the concurrency limit; at least 1.
    pub fn with_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }
}

/// What backs a registration: a ready instance (system scope) or a factory
/// that builds one per user (user scope).
#[derive(Clone)]
pub enum AgentSource {
    /// A shared instance for a system-scoped agent.
    Instance(Arc<dyn Agent>),
    /// A per-user factory for a user-scoped agent.
    Factory(Arc<dyn AgentFactory>),
}

/// A resolved agent together with its concurrency gate.
#[derive(Clone)]
pub struct AgentHandle {
    descriptor: Arc<AgentDescriptor>,
    agent: Arc<dyn Agent>,
    slots: Arc<Semaphore>,
}

/// A held concurrency slot on one agent instance.
pub struct AgentSlot {
    _permit: OwnedSemaphorePermit,
}

impl AgentHandle {
    /// Wrap an instance with a concurrency gate sized from `descriptor`.
    pub fn new(descriptor: AgentDescriptor, agent: Arc<dyn Agent>) -> Self {
        Self::from_shared(Arc::new(descriptor), agent)
    }

    fn from_shared(descriptor: Arc<AgentDescriptor>, agent: Arc<dyn Agent>) -> Self {
        let slots = Arc::new(Semaphore::new(descriptor.max_concurrency.max(1)));
        Self {
            descriptor,
            agent,
            slots,
        }
    }

    /// Descriptor the agent was registered with.
    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// The agent instance.
    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    /// Free concurrency slots right now.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a concurrency slot; held until the returned guard drops.
    pub async fn slot(&self) -> Result<AgentSlot, AgentError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::transient(format!("agent '{}' is shut down", self.descriptor.name)))?;
        Ok(AgentSlot { _permit: permit })
    }
}

type UserAgents = Arc<tokio::sync::Mutex<HashMap<Capability, AgentHandle>>>;

/// Maps capabilities to agent instances.
///
/// System-wide agents are registered once at bootstrap. User-scoped agents
/// are built lazily by their factory on first resolution for a user and
/// cached until [`AgentRegistry::end_session`]. Creation for one user is
/// serialized on that user's own lock; other users never wait on it.
#[derive(Default)]
pub struct AgentRegistry {
    system: RwLock<HashMap<Capability, Vec<AgentHandle>>>,
    factories: RwLock<HashMap<Capability, (Arc<AgentDescriptor>, Arc<dyn AgentFactory>)>>,
    sessions: Mutex<HashMap<String, UserAgents>>,
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. System scope takes an instance, user scope a factory.
    pub fn register(&self, descriptor: AgentDescriptor, source: AgentSource) -> PaperflowResult<()> {
        let capability = descriptor.capability;
        let name = descriptor.name.clone();
        match (descriptor.scope, source) {
            (AgentScope::System, AgentSource::Instance(agent)) => {
                self.system
                    .write()
                    .entry(capability)
                    .or_default()
                    .push(AgentHandle::new(descriptor, agent));
            }
            (AgentScope::User, AgentSource::Factory(factory)) => {
                self.factories
                    .write()
                    .insert(capability, (Arc::new(descriptor), factory));
            }
            (scope, _) => {
                return Err(PaperflowError::Config(format!(
                    "agent '{name}' has {scope} scope but was registered with the wrong source kind"
                )));
            }
        }
        info!(agent = %name, capability = %capability, "Registered agent");
        Ok(())
    }

    /// Shorthand for registering a system-wide instance.
    pub fn register_system(
        &self,
        descriptor: AgentDescriptor,
        agent: Arc<dyn Agent>,
    ) -> PaperflowResult<()> {
        self.register(descriptor, AgentSource::Instance(agent))
    }

    /// Shorthand for registering a user-scoped factory.
    pub fn register_user_scoped(
        &self,
        descriptor: AgentDescriptor,
        factory: Arc<dyn AgentFactory>,
    ) -> PaperflowResult<()> {
        self.register(descriptor, AgentSource::Factory(factory))
    }

    /// Find an agent for `capability`.
    ///
    /// System-wide instances win; among several, the one with the most free
    /// slots is picked. Otherwise a user-scoped agent is looked up or created
    /// for `user`.
    pub async fn resolve(
        &self,
        capability: Capability,
        user: Option<&UserContext>,
    ) -> PaperflowResult<AgentHandle> {
        if let Some(handle) = self.pick_system(capability) {
            return Ok(handle);
        }

        let registration = self.factories.read().get(&capability).cloned();
        let Some((descriptor, factory)) = registration else {
            return Err(PaperflowError::CapabilityNotFound(capability));
        };
        let Some(user) = user else {
            return Err(PaperflowError::AgentInitializationFailed {
                capability,
                reason: "user-scoped agent requires a user context".to_string(),
            });
        };

        let session = self
            .sessions
            .lock()
            .entry(user.user_id.clone())
            .or_default()
            .clone();
        let mut agents = session.lock().await;
        if let Some(handle) = agents.get(&capability) {
            return Ok(handle.clone());
        }

        let agent = factory.create(user).await.map_err(|e| {
            warn!(capability = %capability, user = %user.user_id, error = %e, "Agent creation failed");
            PaperflowError::AgentInitializationFailed {
                capability,
                reason: e.to_string(),
            }
        })?;
        let handle = AgentHandle::from_shared(descriptor, agent);
        agents.insert(capability, handle.clone());
        info!(capability = %capability, user = %user.user_id, "Created user-scoped agent");
        Ok(handle)
    }

    fn pick_system(&self, capability: Capability) -> Option<AgentHandle> {
        let system = self.system.read();
        system
            .get(&capability)?
            .iter()
            .max_by_key(|h| h.available_slots())
            .cloned()
    }

    /// Tear down every agent created for `user_id`. Returns how many were removed.
    pub async fn end_session(&self, user_id: &str) -> usize {
        let Some(session) = self.sessions.lock().remove(user_id) else {
            return 0;
        };
        let drained: Vec<AgentHandle> = session.lock().await.drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.agent().shutdown().await;
        }
        info!(user = %user_id, agents = drained.len(), "Ended agent session");
        drained.len()
    }

    /// Whether `user_id` has live user-scoped agents.
    pub async fn has_session(&self, user_id: &str) -> bool {
        let session = self.sessions.lock().get(user_id).cloned();
        match session {
            Some(s) => !s.lock().await.is_empty(),
            None => false,
        }
    }

    /// Every capability some agent advertises, sorted.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps: BTreeSet<Capability> = self.system.read().keys().copied().collect();
        caps.extend(self.factories.read().keys().copied());
        caps.into_iter().collect()
    }
}
