//! Built-in agent variants.
//!
//! Every variant implements [`Agent`](crate::Agent); the orchestrator only
//! ever sees that interface.

pub mod chat;
pub mod discovery;
pub mod merge;
pub mod provider;
pub mod store;

pub use chat::{ChatAgent, ChatAgentFactory};
pub use discovery::{DiscoveryAgent, MetadataSource};
pub use merge::MergeAgent;
pub use provider::ProviderAgent;
pub use store::FileStoreAgent;
