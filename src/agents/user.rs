//! Per-user agent, added and removed at runtime.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{user_agent_id, Agent, AgentContext, AgentFactory, AgentStatus, Layer, Reportable, Stoppable, Subscriptions};
use crate::error::{Error, Result};
use crate::protocol::{message_types, Envelope};

pub struct UserAgent {
    id: String,
    user_id: String,
    subscriptions: Subscriptions,
    received: Arc<AtomicU64>,
    last_response: Arc<Mutex<Option<String>>>,
}

impl UserAgent {
    pub fn new(user_id: &str, ctx: &AgentContext) -> Arc<Self> {
        let agent = Arc::new(Self {
            id: user_agent_id(user_id),
            user_id: user_id.to_string(),
            subscriptions: Subscriptions::new(ctx.router.clone()),
            received: Arc::new(AtomicU64::new(0)),
            last_response: Arc::new(Mutex::new(None)),
        });

        let me = agent.id.clone();
        let received = agent.received.clone();
        let last_response = agent.last_response.clone();
        agent.subscriptions.track(ctx.router.register_handler(
            message_types::USER_RESPONSE,
            move |env: Envelope| {
                let me = me.clone();
                let received = received.clone();
                let last_response = last_response.clone();
                async move {
                    if env.is_for(&me) {
                        received.fetch_add(1, Ordering::Relaxed);
                        *last_response.lock().unwrap_or_else(|e| e.into_inner()) =
                            env.payload_str("text").map(str::to_string);
                    }
                    Ok::<(), Error>(())
                }
            },
        ));

        agent
    }

    /// Factory registering the agent for `user_id` under its `user:<id>` key.
    pub fn factory(user_id: &str) -> AgentFactory {
        let user_id = user_id.to_string();
        Arc::new(move |_id: &str, ctx: &AgentContext| -> Result<Arc<dyn Agent>> {
            Ok(UserAgent::new(&user_id, ctx))
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn last_response(&self) -> Option<String> {
        self.last_response
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Agent for UserAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn layer(&self) -> Layer {
        Layer::UserAgents
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
impl Stoppable for UserAgent {
    async fn cleanup(&self) -> Result<()> {
        let removed = self.subscriptions.unsubscribe_all();
        tracing::debug!("User agent {} released {} handler(s)", self.id, removed);
        Ok(())
    }
}

impl Reportable for UserAgent {
    fn status(&self) -> AgentStatus {
        AgentStatus {
            agent_id: self.id.clone(),
            healthy: true,
            handled: self.received(),
            detail: format!("user {}", self.user_id),
        }
    }
}
