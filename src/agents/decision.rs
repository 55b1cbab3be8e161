//! Decision agent: turns analyses into user-facing responses.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{user_agent_id, Agent, AgentContext, AgentStatus, Layer, Reportable, Stoppable, Subscriptions};
use crate::error::{Error, Result};
use crate::hub::{AnalysisResult, AnalyzedMessage, FailedMessage};
use crate::protocol::{message_types, Envelope, Priority};

#[derive(Default)]
struct Counters {
    responses: AtomicU64,
    errors: AtomicU64,
    users_added: AtomicU64,
}

pub struct DecisionAgent {
    id: String,
    subscriptions: Subscriptions,
    counters: Arc<Counters>,
}

impl DecisionAgent {
    pub fn new(id: &str, ctx: &AgentContext) -> Arc<Self> {
        let agent = Arc::new(Self {
            id: id.to_string(),
            subscriptions: Subscriptions::new(ctx.router.clone()),
            counters: Arc::new(Counters::default()),
        });

        let router = Arc::downgrade(&ctx.router);
        let counters = agent.counters.clone();
        let source = agent.id.clone();
        agent.subscriptions.track(ctx.router.register_handler(
            message_types::MESSAGE_ANALYZED,
            move |env: Envelope| {
                let router = router.clone();
                let counters = counters.clone();
                let source = source.clone();
                async move {
                    let analyzed: AnalyzedMessage = serde_json::from_value(env.payload.clone())?;
                    let response = respond(&source, &env, &analyzed);
                    if let Some(router) = router.upgrade() {
                        router.send_message(response).await;
                    }
                    counters.responses.fetch_add(1, Ordering::Relaxed);
                    Ok::<(), Error>(())
                }
            },
        ));

        let router = Arc::downgrade(&ctx.router);
        let counters = agent.counters.clone();
        let source = agent.id.clone();
        agent.subscriptions.track(ctx.router.register_handler(
            message_types::PROCESSING_ERROR,
            move |env: Envelope| {
                let router = router.clone();
                let counters = counters.clone();
                let source = source.clone();
                async move {
                    let failed: FailedMessage = serde_json::from_value(env.payload.clone())?;
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    if let Some(router) = router.upgrade() {
                        router.send_message(apologize(&source, &env, &failed)).await;
                    }
                    Ok::<(), Error>(())
                }
            },
        ));

        let counters = agent.counters.clone();
        agent.subscriptions.track(ctx.router.register_handler(
            message_types::USER_ADDED,
            move |env: Envelope| {
                let counters = counters.clone();
                async move {
                    counters.users_added.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("User joined: {}", env.payload_str("userId").unwrap_or("?"));
                    Ok::<(), Error>(())
                }
            },
        ));

        agent
    }

    pub fn users_added(&self) -> u64 {
        self.counters.users_added.load(Ordering::Relaxed)
    }
}

/// Response text for an analysis.
pub fn compose_response(analysis: &AnalysisResult) -> String {
    let base = match (analysis.action.as_str(), analysis.intent.as_str()) {
        ("escalate", _) => "This has been escalated and someone will follow up shortly.".to_string(),
        ("answer", _) | (_, "question") => "Thanks for the question, here is what we found.".to_string(),
        (_, "bug") | (_, "issue") => "Thanks for the report, we are looking into it.".to_string(),
        (_, "feedback") => "Thanks for the feedback.".to_string(),
        ("provide_help", _) | (_, "help") => "We are here to help. Could you share a few more details?".to_string(),
        (action, intent) => format!("Received your {} message ({}).", intent, action),
    };

    match &analysis.summary {
        Some(summary) => format!("{} {}", base, summary),
        None => base,
    }
}

fn respond(source: &str, env: &Envelope, analyzed: &AnalyzedMessage) -> Envelope {
    let user_id = &analyzed.message.user_id;
    let mut response = Envelope::new(
        message_types::USER_RESPONSE,
        source,
        json!({
            "userId": user_id,
            "text": compose_response(&analyzed.analysis),
            "intent": analyzed.analysis.intent,
            "action": analyzed.analysis.action,
        }),
    )
    .with_target(user_agent_id(user_id))
    .with_priority(analyzed.analysis.priority());
    response.correlation_id = env.correlation_id.clone();
    response
}

fn apologize(source: &str, env: &Envelope, failed: &FailedMessage) -> Envelope {
    let user_id = &failed.message.user_id;
    let mut response = Envelope::new(
        message_types::USER_RESPONSE,
        source,
        json!({
            "userId": user_id,
            "text": "Sorry, we could not process your message. Please try again shortly.",
            "intent": "error",
            "action": "retry_later",
        }),
    )
    .with_target(user_agent_id(user_id))
    .with_priority(Priority::High);
    response.correlation_id = env.correlation_id.clone();
    response
}

impl Agent for DecisionAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn layer(&self) -> Layer {
        Layer::Orchestration
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
impl Stoppable for DecisionAgent {
    async fn cleanup(&self) -> Result<()> {
        self.subscriptions.unsubscribe_all();
        Ok(())
    }
}

impl Reportable for DecisionAgent {
    fn status(&self) -> AgentStatus {
        AgentStatus {
            agent_id: self.id.clone(),
            healthy: true,
            handled: self.counters.responses.load(Ordering::Relaxed),
            detail: format!(
                "{} error response(s), {} user(s) added",
                self.counters.errors.load(Ordering::Relaxed),
                self.users_added()
            ),
        }
    }
}
