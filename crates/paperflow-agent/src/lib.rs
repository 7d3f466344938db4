//! Agents and the boundaries they sit on.
//!
//! An agent is a unit of specialized capability invoked by capability id.
//! This crate defines the invocation boundary ([`Agent`]), the registry that
//! maps capabilities to agent instances ([`AgentRegistry`]), the provider call
//! boundary agents use to reach external AI services ([`ProviderClient`]), the
//! retry policy, the discovery cache for metadata lookups, and the built-in
//! agent variants.

pub mod agent;
pub mod agents;
pub mod discovery;
pub mod http;
pub mod provider;
pub mod registry;
pub mod retry;

pub use agent::{Agent, AgentFactory, AgentOutput, AgentRequest, UserContext};
pub use discovery::{CacheStats, DiscoveryCache};
pub use http::{HttpMetadataSource, HttpProviderClient};
pub use provider::{
    PromptMessage, PromptRole, ProviderClient, ProviderError, ProviderRequest, ProviderResponse,
};
pub use registry::{AgentDescriptor, AgentHandle, AgentRegistry, AgentSlot, AgentSource};
pub use retry::RetryPolicy;
