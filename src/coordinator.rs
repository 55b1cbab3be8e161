//! The coordinator wires router, storage, agents and the ingestion hub
//! together and owns their lifecycle: `new` → `initialize` → … → `shutdown`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::agents::{
    user_agent_id, Agent, AgentContext, AgentRegistry, AgentStatus, DecisionAgent, Layer,
    OutboundReply, PersistenceAgent, ResponderAgent, UserAgent, DECISION_AGENT_ID,
    RESPONDER_AGENT_ID, STORAGE_AGENT_ID,
};
use crate::config::{validate_settings, Settings};
use crate::core::QueueStats;
use crate::error::Result;
use crate::hub::{ClassifierWorker, HubStats, IngestReply, IngestionHub, UserMessage, Worker};
use crate::protocol::Router;
use crate::providers::{create_provider, ExecutionContract};
use crate::storage::{open_storage, user_statuses, Storage};

/// Snapshot for the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub initialized: bool,
    pub agents: Vec<String>,
    pub statuses: Vec<AgentStatus>,
    pub hub: HubStats,
    pub queue: QueueStats,
}

pub struct Coordinator {
    settings: Settings,
    router: Arc<Router>,
    storage: Arc<dyn Storage>,
    registry: AgentRegistry,
    hub: Arc<IngestionHub>,
    replies: Mutex<mpsc::UnboundedReceiver<OutboundReply>>,
}

impl Coordinator {
    /// Build a coordinator around the given storage and workers. Nothing runs
    /// until [`initialize`](Self::initialize).
    pub fn new(settings: Settings, storage: Arc<dyn Storage>, workers: [Arc<dyn Worker>; 2]) -> Result<Self> {
        validate_settings(&settings)?;

        let router = Arc::new(Router::new());
        let (outbox, replies) = mpsc::unbounded_channel();
        let ctx = AgentContext {
            router: router.clone(),
            storage: storage.clone(),
            outbox,
        };

        let registry = AgentRegistry::new(
            ctx,
            Duration::from_secs(settings.registry.monitor_interval_secs),
        );
        registry.plan(
            STORAGE_AGENT_ID,
            Layer::CoreServices,
            Arc::new(|id: &str, ctx: &AgentContext| -> Result<Arc<dyn Agent>> {
                Ok(PersistenceAgent::new(id, ctx))
            }),
        );
        registry.plan(
            DECISION_AGENT_ID,
            Layer::Orchestration,
            Arc::new(|id: &str, ctx: &AgentContext| -> Result<Arc<dyn Agent>> {
                Ok(DecisionAgent::new(id, ctx))
            }),
        );
        registry.plan(
            RESPONDER_AGENT_ID,
            Layer::Communication,
            Arc::new(|id: &str, ctx: &AgentContext| -> Result<Arc<dyn Agent>> {
                Ok(ResponderAgent::new(id, ctx))
            }),
        );

        let hub = IngestionHub::new(workers, router.clone(), storage.clone(), settings.hub.clone());

        Ok(Self {
            settings,
            router,
            storage,
            registry,
            hub,
            replies: Mutex::new(replies),
        })
    }

    /// Build storage, provider and two classifier workers from settings.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let storage = open_storage(&settings.storage)?;
        let provider = create_provider(&settings.provider)?;
        let contract = ExecutionContract::from(&settings.provider);
        let model = settings.provider.model.clone();

        let workers: [Arc<dyn Worker>; 2] = [
            Arc::new(ClassifierWorker::new("worker-1", provider.clone(), model.clone(), contract.clone())),
            Arc::new(ClassifierWorker::new("worker-2", provider, model, contract)),
        ];

        tracing::info!(
            "Coordinator using provider '{}' with {:?} storage",
            settings.provider.name,
            settings.storage.backend
        );
        Self::new(settings, storage, workers)
    }

    /// Start every agent in layer order, then the drain loop. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        self.registry.initialize().await?;
        self.hub.start_draining();
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.registry.is_initialized()
    }

    pub async fn ingest(&self, user_id: &str, content: &str) -> IngestReply {
        self.ingest_message(UserMessage::new(user_id, content)).await
    }

    pub async fn ingest_message(&self, message: UserMessage) -> IngestReply {
        self.hub.ingest(message).await
    }

    pub async fn add_user(&self, user_id: &str) -> Result<()> {
        self.registry.add_user(user_id).await
    }

    pub async fn remove_user(&self, user_id: &str) -> Result<()> {
        self.registry.remove_user(user_id).await
    }

    /// Register agents for users whose latest recorded status is `active`.
    pub async fn restore_users(&self) -> Result<usize> {
        let mut restored = 0;
        for (user_id, status) in user_statuses(self.storage.as_ref()).await? {
            let agent_id = user_agent_id(&user_id);
            if status != "active" || self.registry.contains(&agent_id) {
                continue;
            }
            self.registry
                .add_agent(&agent_id, Layer::UserAgents, UserAgent::factory(&user_id))
                .await?;
            restored += 1;
        }
        Ok(restored)
    }

    /// Wait for the next outbound reply. `None` once the coordinator is gone.
    pub async fn next_reply(&self) -> Option<OutboundReply> {
        self.replies.lock().await.recv().await
    }

    /// Replies that are ready right now.
    pub async fn take_replies(&self) -> Vec<OutboundReply> {
        let mut replies = self.replies.lock().await;
        let mut ready = Vec::new();
        while let Ok(reply) = replies.try_recv() {
            ready.push(reply);
        }
        ready
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            initialized: self.is_initialized(),
            agents: self.registry.ids(),
            statuses: self.registry.statuses(),
            hub: self.hub.stats(),
            queue: self.hub.queue_snapshot(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<IngestionHub> {
        &self.hub
    }

    /// Stop draining, then shut the registry down.
    pub async fn shutdown(&self) {
        self.hub.stop_draining().await;
        self.registry.shutdown().await;
        tracing::info!(
            "Coordinator shut down with {} message(s) still queued",
            self.hub.queue_len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::hub::AnalysisResult;
    use crate::logging;
    use crate::protocol::Priority;
    use crate::storage::{collections, MemoryStorage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FixedWorker {
        id: String,
        failing: AtomicBool,
    }

    impl FixedWorker {
        fn new(id: &str, failing: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                failing: AtomicBool::new(failing),
            })
        }
    }

    #[async_trait]
    impl Worker for FixedWorker {
        fn id(&self) -> &str {
            &self.id
        }

        async fn process(&self, _message: &UserMessage) -> Result<AnalysisResult> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Processing("provider down".to_string()));
            }
            Ok(AnalysisResult {
                intent: "question".to_string(),
                urgency: "high".to_string(),
                action: "answer".to_string(),
                confidence: 0.9,
                summary: None,
            })
        }
    }

    fn coordinator(failing: bool) -> (Coordinator, Arc<MemoryStorage>) {
        logging::init_test();
        let mut settings = Settings::default();
        settings.hub.drain_interval_ms = 5;

        let storage = Arc::new(MemoryStorage::new());
        let workers: [Arc<dyn Worker>; 2] = [
            FixedWorker::new("worker-1", failing),
            FixedWorker::new("worker-2", failing),
        ];
        let coordinator = Coordinator::new(settings, storage.clone(), workers).unwrap();
        (coordinator, storage)
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (coordinator, _) = coordinator(false);

        coordinator.initialize().await.unwrap();
        coordinator.initialize().await.unwrap();

        assert!(coordinator.is_initialized());
        assert_eq!(
            coordinator.registry().ids(),
            vec![STORAGE_AGENT_ID, DECISION_AGENT_ID, RESPONDER_AGENT_ID]
        );
        assert_eq!(coordinator.status().statuses.len(), 3);
        coordinator.shutdown().await;
        assert!(!coordinator.is_initialized());
    }

    #[tokio::test]
    async fn test_message_flows_to_reply() {
        let (coordinator, storage) = coordinator(false);
        coordinator.initialize().await.unwrap();
        coordinator.add_user("alice").await.unwrap();

        let reply = coordinator.ingest("alice", "where is my order?").await;
        assert!(!reply.is_queued());

        let replies = coordinator.take_replies().await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].user_id, "alice");
        assert_eq!(replies[0].priority, Priority::High);
        assert_eq!(replies[0].correlation_id.as_deref(), Some(reply.message_id()));

        assert_eq!(storage.count(collections::MESSAGES), 1);
        assert_eq!(storage.count(collections::ANALYSES), 1);

        let agent = coordinator.registry().get_agent("user:alice").unwrap();
        let user = agent.as_any().downcast_ref::<UserAgent>().unwrap();
        assert_eq!(user.received(), 1);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_message_gets_error_reply() {
        let (coordinator, storage) = coordinator(true);
        coordinator.initialize().await.unwrap();

        let reply = coordinator.ingest("bob", "help, it is broken").await;
        assert!(reply.is_queued());

        let error_reply = tokio::time::timeout(Duration::from_secs(5), coordinator.next_reply())
            .await
            .expect("error reply in time")
            .expect("channel open");
        assert_eq!(error_reply.user_id, "bob");
        assert_eq!(error_reply.correlation_id.as_deref(), Some(reply.message_id()));

        coordinator.shutdown().await;
        assert_eq!(storage.count(collections::ERRORS), 1);
        assert_eq!(coordinator.status().hub.failed, 1);
    }

    #[tokio::test]
    async fn test_user_lifecycle() {
        let (coordinator, storage) = coordinator(false);
        coordinator.initialize().await.unwrap();

        coordinator.add_user("carol").await.unwrap();
        assert!(coordinator.registry().contains("user:carol"));

        coordinator.remove_user("carol").await.unwrap();
        assert!(!coordinator.registry().contains("user:carol"));
        assert_eq!(
            crate::storage::user_status(storage.as_ref(), "carol")
                .await
                .unwrap()
                .as_deref(),
            Some("inactive")
        );

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_active_users() {
        let (coordinator, storage) = coordinator(false);
        crate::storage::set_user_status(storage.as_ref(), "dan", "active").await.unwrap();
        crate::storage::set_user_status(storage.as_ref(), "eve", "active").await.unwrap();
        crate::storage::set_user_status(storage.as_ref(), "eve", "inactive").await.unwrap();

        coordinator.initialize().await.unwrap();
        assert_eq!(coordinator.restore_users().await.unwrap(), 1);
        assert!(coordinator.registry().contains("user:dan"));
        assert!(!coordinator.registry().contains("user:eve"));
        assert_eq!(coordinator.restore_users().await.unwrap(), 0);

        coordinator.shutdown().await;
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = Settings::default();
        settings.hub.max_pending = 0;
        let workers: [Arc<dyn Worker>; 2] = [
            FixedWorker::new("worker-1", false),
            FixedWorker::new("worker-2", false),
        ];

        let result = Coordinator::new(settings, Arc::new(MemoryStorage::new()), workers);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
