//! agentmesh library root.

pub mod agents;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod hub;
pub mod logging;
pub mod protocol;
pub mod providers;
pub mod storage;

pub use agents::{Agent, AgentRegistry, Layer};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use coordinator::Coordinator;
pub use core::{PriorityQueue, RepeatingTask};
pub use error::{Error, Result};
pub use hub::{IngestReply, IngestionHub, UserMessage, Worker};
pub use protocol::{Envelope, Priority, Router};
pub use providers::Provider;
pub use storage::Storage;
