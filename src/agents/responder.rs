//! Responder agent: the exit point for replies.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Agent, AgentContext, AgentStatus, Layer, OutboundReply, Reportable, Stoppable, Subscriptions};
use crate::error::{Error, Result};
use crate::protocol::{message_types, Envelope};

pub struct ResponderAgent {
    id: String,
    subscriptions: Subscriptions,
    forwarded: Arc<AtomicU64>,
}

impl ResponderAgent {
    pub fn new(id: &str, ctx: &AgentContext) -> Arc<Self> {
        let agent = Arc::new(Self {
            id: id.to_string(),
            subscriptions: Subscriptions::new(ctx.router.clone()),
            forwarded: Arc::new(AtomicU64::new(0)),
        });

        let outbox: mpsc::UnboundedSender<OutboundReply> = ctx.outbox.clone();
        let forwarded = agent.forwarded.clone();
        agent.subscriptions.track(ctx.router.register_handler(
            message_types::USER_RESPONSE,
            move |env: Envelope| {
                let outbox = outbox.clone();
                let forwarded = forwarded.clone();
                async move {
                    let user_id = env
                        .payload_str("userId")
                        .ok_or_else(|| Error::Delivery("response without userId".to_string()))?;
                    let reply = OutboundReply {
                        user_id: user_id.to_string(),
                        text: env.payload_str("text").unwrap_or_default().to_string(),
                        correlation_id: env.correlation_id.clone(),
                        priority: env.priority,
                    };

                    outbox
                        .send(reply)
                        .map_err(|_| Error::Delivery("outbound channel closed".to_string()))?;
                    forwarded.fetch_add(1, Ordering::Relaxed);
                    Ok::<(), Error>(())
                }
            },
        ));

        agent
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

impl Agent for ResponderAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn layer(&self) -> Layer {
        Layer::Communication
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
impl Stoppable for ResponderAgent {
    async fn cleanup(&self) -> Result<()> {
        self.subscriptions.unsubscribe_all();
        Ok(())
    }
}

impl Reportable for ResponderAgent {
    fn status(&self) -> AgentStatus {
        AgentStatus {
            agent_id: self.id.clone(),
            healthy: true,
            handled: self.forwarded(),
            detail: "forwarding replies".to_string(),
        }
    }
}
