//! Storage agent: writes routed traffic to the storage collaborator.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Agent, AgentContext, AgentStatus, Layer, Reportable, Startable, Stoppable, Subscriptions};
use crate::error::{Error, Result};
use crate::protocol::{message_types, Envelope};
use crate::storage::{collections, Filter, Storage};

/// Collection each persisted envelope type lands in.
const ROUTES: [(&str, &str); 3] = [
    (message_types::USER_COMMUNICATION, collections::MESSAGES),
    (message_types::MESSAGE_ANALYZED, collections::ANALYSES),
    (message_types::PROCESSING_ERROR, collections::ERRORS),
];

pub struct PersistenceAgent {
    id: String,
    storage: Arc<dyn Storage>,
    subscriptions: Subscriptions,
    stored: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl PersistenceAgent {
    pub fn new(id: &str, ctx: &AgentContext) -> Arc<Self> {
        let agent = Arc::new(Self {
            id: id.to_string(),
            storage: ctx.storage.clone(),
            subscriptions: Subscriptions::new(ctx.router.clone()),
            stored: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        });

        for (message_type, collection) in ROUTES {
            let storage = agent.storage.clone();
            let stored = agent.stored.clone();
            let failed = agent.failed.clone();
            let id = ctx.router.register_handler(message_type, move |env: Envelope| {
                let storage = storage.clone();
                let stored = stored.clone();
                let failed = failed.clone();
                async move {
                    match storage.store(collection, record_for(&env)).await {
                        Ok(_) => {
                            stored.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            let err = Error::Persist(format!("{} into {}: {}", env.message_type, collection, e));
                            tracing::warn!("{}", err);
                        }
                    }
                    Ok::<(), Error>(())
                }
            });
            agent.subscriptions.track(id);
        }

        agent
    }

    pub fn stored(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }
}

fn record_for(env: &Envelope) -> Value {
    json!({
        "type": env.message_type,
        "source": env.source,
        "priority": env.priority,
        "timestamp": env.timestamp,
        "correlationId": env.correlation_id,
        "payload": env.payload,
    })
}

impl Agent for PersistenceAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn layer(&self) -> Layer {
        Layer::CoreServices
    }

    fn as_startable(&self) -> Option<&dyn Startable> {
        Some(self)
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        Some(self)
    }

    fn as_reportable(&self) -> Option<&dyn Reportable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl Startable for PersistenceAgent {
    async fn start(&self) -> Result<()> {
        self.storage
            .query(collections::USERS, &Filter::new().with("userId", "__healthcheck__"))
            .await
            .map_err(|e| Error::Initialization(format!("storage unreachable: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl Stoppable for PersistenceAgent {
    async fn cleanup(&self) -> Result<()> {
        self.subscriptions.unsubscribe_all();
        Ok(())
    }
}

impl Reportable for PersistenceAgent {
    fn status(&self) -> AgentStatus {
        let failed = self.failed.load(Ordering::Relaxed);
        AgentStatus {
            agent_id: self.id.clone(),
            healthy: true,
            handled: self.stored(),
            detail: format!("{} write(s) failed", failed),
        }
    }
}
