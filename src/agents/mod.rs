//! Agents and their lifecycle.
//!
//! Every agent implements [`Agent`]; optional behavior is exposed as
//! capability traits that the registry discovers through explicit queries:
//! - [`Startable`]: async setup run before the agent is registered
//! - [`Stoppable`]: cleanup run on removal and shutdown
//! - [`Reportable`]: status snapshots for the monitor

use std::any::Any;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{HandlerId, Priority, Router};
use crate::storage::Storage;

pub mod decision;
pub mod persistence;
pub mod registry;
pub mod responder;
pub mod user;

pub use decision::DecisionAgent;
pub use persistence::PersistenceAgent;
pub use registry::{AgentFactory, AgentRegistry};
pub use responder::ResponderAgent;
pub use user::UserAgent;

/// Well-known agent IDs.
pub const STORAGE_AGENT_ID: &str = "storage";
pub const DECISION_AGENT_ID: &str = "decision";
pub const RESPONDER_AGENT_ID: &str = "responder";

/// Registry ID of the per-user agent for `user_id`.
pub fn user_agent_id(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// Dependency layer. Agents are initialized in ascending order, so a later
/// layer can rely on everything before it being up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    CoreServices = 0,
    Orchestration = 1,
    UserAgents = 2,
    Communication = 3,
}

impl Layer {
    pub const ALL: [Layer; 4] = [
        Layer::CoreServices,
        Layer::Orchestration,
        Layer::UserAgents,
        Layer::Communication,
    ];
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::CoreServices => write!(f, "core_services"),
            Layer::Orchestration => write!(f, "orchestration"),
            Layer::UserAgents => write!(f, "user_agents"),
            Layer::Communication => write!(f, "communication"),
        }
    }
}

/// Shared collaborators handed to agent factories.
#[derive(Clone)]
pub struct AgentContext {
    pub router: Arc<Router>,
    pub storage: Arc<dyn Storage>,
    pub outbox: mpsc::UnboundedSender<OutboundReply>,
}

/// A reply ready to leave the system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundReply {
    pub user_id: String,
    pub text: String,
    pub correlation_id: Option<String>,
    pub priority: Priority,
}

/// Point-in-time status of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub healthy: bool,
    pub handled: u64,
    pub detail: String,
}

/// Minimal interface every registered agent provides.
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    fn layer(&self) -> Layer;

    fn as_startable(&self) -> Option<&dyn Startable> {
        None
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        None
    }

    fn as_reportable(&self) -> Option<&dyn Reportable> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait Startable: Send + Sync {
    async fn start(&self) -> Result<()>;
}

#[async_trait]
pub trait Stoppable: Send + Sync {
    async fn cleanup(&self) -> Result<()>;
}

pub trait Reportable: Send + Sync {
    fn status(&self) -> AgentStatus;
}

/// Handler registrations owned by an agent, removed together on cleanup.
pub struct Subscriptions {
    router: Arc<Router>,
    ids: Mutex<Vec<HandlerId>>,
}

impl Subscriptions {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            ids: Mutex::new(Vec::new()),
        }
    }

    pub fn track(&self, id: HandlerId) {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).push(id);
    }

    /// Unregister everything tracked so far. Returns how many were removed.
    pub fn unsubscribe_all(&self) -> usize {
        let ids: Vec<HandlerId> = std::mem::take(&mut *self.ids.lock().unwrap_or_else(|e| e.into_inner()));
        ids.into_iter()
            .filter(|id| self.router.unregister_handler(*id))
            .count()
    }
}
