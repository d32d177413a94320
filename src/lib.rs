//! Core Hub
//!
//! Process-local control plane for a multi-agent system: typed message
//! envelopes, an agent registry with capability and dependency resolution,
//! pluggable transports, a prioritized experience-replay buffer, and a
//! bounded error subsystem, orchestrated by a single hub.
//!
//! # Architecture
//!
//! ```text
//! Agents ──► HubFacade ──► Hub ──► dispatch by event kind
//!                           │
//!                           ├── AgentManager   (registry, health, deps)
//!                           ├── CommManager    (memory / pubsub / topic-broker)
//!                           ├── ReplayBuffer   (memory / file / remote-kv)
//!                           ├── ErrorHandler   (taxonomy, bounded log)
//!                           └── periodic loop  (health, sweeps, master prompt)
//! ```
//!
//! The LLM client, database, and HTTP surface are injected collaborators;
//! this crate defines only the contracts the core consumes.

pub mod agent;
pub mod comm;
pub mod config;
pub mod errors;
pub mod hub;
pub mod logging;
pub mod message;
pub mod registry;
pub mod replay;

pub use agent::{HubFacade, LocalAgent, Task, TaskStatus};
pub use comm::{CommunicationManager, Protocol, Transport};
pub use config::ConfigTree;
pub use errors::{ErrorCategory, ErrorFilter, ErrorHandler, ErrorLevel, ErrorRecord, HandlerKey};
pub use hub::Hub;
pub use logging::ContextLogger;
pub use message::{Envelope, EventKind, Priority};
pub use registry::{AgentManager, AgentRecord, AgentStatus, HealthReport};
pub use replay::{create_replay_buffer, BufferStats, Experience, ReplayBuffer, SampleBatch};
