//! Agent registry: owns every running agent and its lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::json;

use super::{user_agent_id, Agent, AgentContext, AgentStatus, Layer, UserAgent, DECISION_AGENT_ID};
use crate::core::RepeatingTask;
use crate::error::{Error, Result};
use crate::protocol::{message_types, Envelope};
use crate::storage;

/// Builds an agent for the given ID.
pub type AgentFactory = Arc<dyn Fn(&str, &AgentContext) -> Result<Arc<dyn Agent>> + Send + Sync>;

struct PlannedAgent {
    id: String,
    layer: Layer,
    factory: AgentFactory,
}

/// A live registry entry.
#[derive(Clone)]
pub struct Registration {
    pub id: String,
    pub agent: Arc<dyn Agent>,
    pub layer: Layer,
    /// Registration time (unix ms)
    pub registered_at: i64,
}

pub struct AgentRegistry {
    ctx: AgentContext,
    plan: Mutex<Vec<PlannedAgent>>,
    agents: Arc<RwLock<HashMap<String, Registration>>>,
    initialized: AtomicBool,
    // Serializes initialize/add/remove/shutdown.
    lifecycle: tokio::sync::Mutex<()>,
    monitor: Mutex<Option<RepeatingTask>>,
    monitor_interval: Duration,
}

impl AgentRegistry {
    pub fn new(ctx: AgentContext, monitor_interval: Duration) -> Self {
        Self {
            ctx,
            plan: Mutex::new(Vec::new()),
            agents: Arc::new(RwLock::new(HashMap::new())),
            initialized: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            monitor: Mutex::new(None),
            monitor_interval,
        }
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    /// Queue an agent to be built by [`initialize`](Self::initialize).
    pub fn plan(&self, id: impl Into<String>, layer: Layer, factory: AgentFactory) {
        self.plan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PlannedAgent {
                id: id.into(),
                layer,
                factory,
            });
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Build and start every planned agent, layer by layer.
    ///
    /// Calling this again once initialized does nothing. On failure every
    /// agent started so far is cleaned up and the registry is left empty.
    pub async fn initialize(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_initialized() {
            tracing::debug!("Agent registry already initialized");
            return Ok(());
        }

        let plan: Vec<(String, Layer, AgentFactory)> = self
            .plan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|p| (p.id.clone(), p.layer, p.factory.clone()))
            .collect();

        for layer in Layer::ALL {
            for (id, _, factory) in plan.iter().filter(|(_, l, _)| *l == layer) {
                if let Err(e) = self.attach(id, layer, factory).await {
                    tracing::error!("Failed to initialize agent '{}' ({}): {}", id, layer, e);
                    self.teardown().await;
                    return Err(Error::Initialization(format!("agent '{}': {}", id, e)));
                }
            }
            tracing::debug!("Layer {} initialized", layer);
        }

        self.initialized.store(true, Ordering::SeqCst);
        self.start_monitor();

        tracing::info!("Agent registry initialized with {} agent(s)", self.len());
        Ok(())
    }

    /// Build, start and register one agent.
    pub async fn add_agent(&self, id: &str, layer: Layer, factory: AgentFactory) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.contains(id) {
            return Err(Error::AlreadyRegistered(id.to_string()));
        }

        self.attach(id, layer, &factory).await?;

        tracing::info!("Added agent '{}' ({})", id, layer);
        Ok(())
    }

    /// Run the agent's cleanup hook, if any, then drop it from the registry.
    pub async fn remove_agent(&self, id: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.detach(id).await
    }

    pub fn get_agent(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|r| r.agent.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered IDs ordered by layer, then ID.
    pub fn ids(&self) -> Vec<String> {
        let mut regs = self.registrations();
        regs.sort_by(|a, b| a.layer.cmp(&b.layer).then_with(|| a.id.cmp(&b.id)));
        regs.into_iter().map(|r| r.id).collect()
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Status of every agent that reports one.
    pub fn statuses(&self) -> Vec<AgentStatus> {
        collect_statuses(&self.agents)
    }

    /// Register a per-user agent and announce it to the orchestration layer.
    pub async fn add_user(&self, user_id: &str) -> Result<()> {
        let agent_id = user_agent_id(user_id);
        self.add_agent(&agent_id, Layer::UserAgents, UserAgent::factory(user_id))
            .await?;

        if let Err(e) = storage::set_user_status(self.ctx.storage.as_ref(), user_id, "active").await {
            let err = Error::Persist(format!("status of user {}: {}", user_id, e));
            tracing::warn!("{}", err);
        }

        let envelope = Envelope::new(
            message_types::USER_ADDED,
            "registry",
            json!({ "userId": user_id, "agentId": agent_id }),
        )
        .with_target(DECISION_AGENT_ID);
        self.ctx.router.send_message(envelope).await;

        Ok(())
    }

    /// Mark a user inactive, then remove their agent.
    pub async fn remove_user(&self, user_id: &str) -> Result<()> {
        let agent_id = user_agent_id(user_id);
        {
            let _lifecycle = self.lifecycle.lock().await;
            if !self.contains(&agent_id) {
                return Err(Error::NotFound(format!("user '{}'", user_id)));
            }

            if let Err(e) = storage::set_user_status(self.ctx.storage.as_ref(), user_id, "inactive").await {
                let err = Error::Persist(format!("status of user {}: {}", user_id, e));
                tracing::warn!("{}", err);
            }

            self.detach(&agent_id).await?;
        }

        let envelope = Envelope::new(
            message_types::USER_REMOVED,
            "registry",
            json!({ "userId": user_id, "agentId": agent_id }),
        )
        .with_target(DECISION_AGENT_ID);
        self.ctx.router.send_message(envelope).await;

        Ok(())
    }

    /// Stop the monitor, clean up every agent (latest layer first) and reset.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        self.teardown().await;
        self.initialized.store(false, Ordering::SeqCst);
        tracing::info!("Agent registry shut down");
    }

    /// Build, start and insert an agent. Callers hold the lifecycle lock.
    ///
    /// Factories may subscribe to the router, so an agent that fails to start
    /// or to insert is cleaned up before the error is returned.
    async fn attach(&self, id: &str, layer: Layer, factory: &AgentFactory) -> Result<()> {
        let agent = factory(id, &self.ctx)?;
        if let Some(startable) = agent.as_startable() {
            if let Err(e) = startable.start().await {
                cleanup(agent.as_ref()).await;
                return Err(e);
            }
        }

        if let Err(e) = self.insert(id, agent.clone(), layer) {
            cleanup(agent.as_ref()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Clean up an agent and drop it. Callers hold the lifecycle lock.
    async fn detach(&self, id: &str) -> Result<()> {
        let agent = self
            .get_agent(id)
            .ok_or_else(|| Error::NotFound(format!("agent '{}'", id)))?;

        cleanup(agent.as_ref()).await;
        self.agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);

        tracing::info!("Removed agent '{}'", id);
        Ok(())
    }

    fn insert(&self, id: &str, agent: Arc<dyn Agent>, layer: Layer) -> Result<()> {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if agents.contains_key(id) {
            return Err(Error::AlreadyRegistered(id.to_string()));
        }
        agents.insert(
            id.to_string(),
            Registration {
                id: id.to_string(),
                agent,
                layer,
                registered_at: chrono::Utc::now().timestamp_millis(),
            },
        );
        Ok(())
    }

    async fn teardown(&self) {
        let mut regs: Vec<Registration> = self
            .agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, r)| r)
            .collect();
        regs.sort_by(|a, b| b.layer.cmp(&a.layer).then_with(|| a.id.cmp(&b.id)));

        for reg in regs {
            cleanup(reg.agent.as_ref()).await;
        }
    }

    fn start_monitor(&self) {
        let agents = self.agents.clone();
        let task = RepeatingTask::start("agent-monitor", self.monitor_interval, move || {
            let statuses = collect_statuses(&agents);
            async move {
                for status in statuses {
                    if status.healthy {
                        tracing::debug!(
                            "Agent {}: handled {} ({})",
                            status.agent_id,
                            status.handled,
                            status.detail
                        );
                    } else {
                        tracing::warn!("Agent {} unhealthy: {}", status.agent_id, status.detail);
                    }
                }
            }
        });

        let previous = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task);
        drop(previous);
    }
}

fn collect_statuses(agents: &RwLock<HashMap<String, Registration>>) -> Vec<AgentStatus> {
    let agents = agents.read().unwrap_or_else(|e| e.into_inner());
    let mut statuses: Vec<AgentStatus> = agents
        .values()
        .filter_map(|r| r.agent.as_reportable().map(|a| a.status()))
        .collect();
    statuses.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    statuses
}

async fn cleanup(agent: &dyn Agent) {
    if let Some(stoppable) = agent.as_stoppable() {
        if let Err(e) = stoppable.cleanup().await {
            tracing::warn!("Cleanup of agent '{}' failed: {}", agent.id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{PersistenceAgent, Startable, Stoppable};
    use crate::protocol::Router;
    use crate::storage::{collections, Filter, MemoryStorage, Record, Storage};
    use async_trait::async_trait;
    use std::any::Any;
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Storage that cannot be queried.
    struct UnreachableStorage;

    #[async_trait]
    impl Storage for UnreachableStorage {
        async fn store(&self, _collection: &str, _record: Value) -> Result<String> {
            Err(Error::Storage("offline".to_string()))
        }

        async fn query(&self, _collection: &str, _filter: &Filter) -> Result<Vec<Record>> {
            Err(Error::Storage("offline".to_string()))
        }
    }

    /// Notes how many user-response handlers are live at each status write.
    struct StatusSpy {
        inner: MemoryStorage,
        router: Arc<Router>,
        handlers_at_write: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Storage for StatusSpy {
        async fn store(&self, collection: &str, record: Value) -> Result<String> {
            if collection == collections::USERS {
                self.handlers_at_write
                    .lock()
                    .unwrap()
                    .push(self.router.handler_count(message_types::USER_RESPONSE));
            }
            self.inner.store(collection, record).await
        }

        async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Record>> {
            self.inner.query(collection, filter).await
        }
    }

    /// Records lifecycle calls into a shared log.
    struct Recorder {
        id: String,
        layer: Layer,
        log: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
    }

    #[async_trait]
    impl Startable for Recorder {
        async fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(Error::Other("refused".to_string()));
            }
            self.log.lock().unwrap().push(format!("start:{}", self.id));
            Ok(())
        }
    }

    #[async_trait]
    impl Stoppable for Recorder {
        async fn cleanup(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("cleanup:{}", self.id));
            Ok(())
        }
    }

    impl Agent for Recorder {
        fn id(&self) -> &str {
            &self.id
        }

        fn layer(&self) -> Layer {
            self.layer
        }

        fn as_startable(&self) -> Option<&dyn Startable> {
            Some(self)
        }

        fn as_stoppable(&self) -> Option<&dyn Stoppable> {
            Some(self)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn recorder(layer: Layer, log: Arc<Mutex<Vec<String>>>, fail_start: bool) -> AgentFactory {
        Arc::new(move |id: &str, _ctx: &AgentContext| -> Result<Arc<dyn Agent>> {
            Ok(Arc::new(Recorder {
                id: id.to_string(),
                layer,
                log: log.clone(),
                fail_start,
            }))
        })
    }

    fn context() -> (AgentContext, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let (outbox, _rx) = mpsc::unbounded_channel();
        let ctx = AgentContext {
            router: Arc::new(Router::new()),
            storage: storage.clone() as Arc<dyn Storage>,
            outbox,
        };
        (ctx, storage)
    }

    #[tokio::test]
    async fn test_initialize_in_layer_order() {
        let (ctx, _) = context();
        let registry = AgentRegistry::new(ctx, Duration::from_secs(30));
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.plan("out", Layer::Communication, recorder(Layer::Communication, log.clone(), false));
        registry.plan("core", Layer::CoreServices, recorder(Layer::CoreServices, log.clone(), false));
        registry.plan("brain", Layer::Orchestration, recorder(Layer::Orchestration, log.clone(), false));

        registry.initialize().await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:core", "start:brain", "start:out"]
        );
        assert_eq!(registry.ids(), vec!["core", "brain", "out"]);
        let core = registry.get_agent("core").unwrap();
        assert!(core.as_any().downcast_ref::<Recorder>().is_some());
        assert_eq!(core.layer(), Layer::CoreServices);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (ctx, _) = context();
        let registry = AgentRegistry::new(ctx, Duration::from_secs(30));
        let built = Arc::new(AtomicUsize::new(0));

        let b = built.clone();
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = recorder(Layer::CoreServices, log, false);
        registry.plan(
            "core",
            Layer::CoreServices,
            Arc::new(move |id: &str, ctx: &AgentContext| -> Result<Arc<dyn Agent>> {
                b.fetch_add(1, Ordering::SeqCst);
                inner(id, ctx)
            }),
        );

        registry.initialize().await.unwrap();
        registry.initialize().await.unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.is_initialized());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_initialization_cleans_up() {
        let (ctx, _) = context();
        let registry = AgentRegistry::new(ctx, Duration::from_secs(30));
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.plan("core", Layer::CoreServices, recorder(Layer::CoreServices, log.clone(), false));
        registry.plan("brain", Layer::Orchestration, recorder(Layer::Orchestration, log.clone(), true));
        registry.plan("out", Layer::Communication, recorder(Layer::Communication, log.clone(), false));

        let err = registry.initialize().await.unwrap_err();

        assert!(matches!(err, Error::Initialization(_)));
        assert!(registry.is_empty());
        assert!(!registry.is_initialized());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:core", "cleanup:brain", "cleanup:core"]
        );
    }

    #[tokio::test]
    async fn test_add_and_remove_agent() {
        let (ctx, _) = context();
        let registry = AgentRegistry::new(ctx, Duration::from_secs(30));
        let log = Arc::new(Mutex::new(Vec::new()));
        let factory = recorder(Layer::UserAgents, log.clone(), false);

        registry.add_agent("x", Layer::UserAgents, factory.clone()).await.unwrap();
        let dup = registry.add_agent("x", Layer::UserAgents, factory).await;
        assert!(matches!(dup, Err(Error::AlreadyRegistered(_))));

        registry.remove_agent("x").await.unwrap();
        assert!(registry.get_agent("x").is_none());
        assert!(matches!(
            registry.remove_agent("x").await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(*log.lock().unwrap(), vec!["start:x", "cleanup:x"]);
    }

    #[tokio::test]
    async fn test_shutdown_resets() {
        let (ctx, _) = context();
        let registry = AgentRegistry::new(ctx, Duration::from_millis(5));
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.plan("core", Layer::CoreServices, recorder(Layer::CoreServices, log.clone(), false));
        registry.plan("out", Layer::Communication, recorder(Layer::Communication, log.clone(), false));
        registry.initialize().await.unwrap();

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert!(!registry.is_initialized());
        assert_eq!(
            log.lock().unwrap()[2..].to_vec(),
            vec!["cleanup:out", "cleanup:core"]
        );

        // Can come back up after a shutdown.
        registry.initialize().await.unwrap();
        assert_eq!(registry.len(), 2);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_and_remove_user() {
        let (ctx, storage) = context();
        let router = ctx.router.clone();
        let registry = AgentRegistry::new(ctx, Duration::from_secs(30));

        let announced = Arc::new(Mutex::new(Vec::new()));
        for message_type in [message_types::USER_ADDED, message_types::USER_REMOVED] {
            let announced = announced.clone();
            router.register_handler(message_type, move |env: Envelope| {
                let announced = announced.clone();
                async move {
                    announced
                        .lock()
                        .unwrap()
                        .push((env.message_type.clone(), env.target.clone()));
                    Ok::<(), Error>(())
                }
            });
        }

        registry.add_user("42").await.unwrap();
        assert!(registry.contains("user:42"));
        assert_eq!(
            storage::user_status(storage.as_ref(), "42").await.unwrap().as_deref(),
            Some("active")
        );
        assert!(matches!(
            registry.add_user("42").await,
            Err(Error::AlreadyRegistered(_))
        ));

        registry.remove_user("42").await.unwrap();
        assert!(!registry.contains("user:42"));
        assert_eq!(
            storage::user_status(storage.as_ref(), "42").await.unwrap().as_deref(),
            Some("inactive")
        );

        assert_eq!(
            *announced.lock().unwrap(),
            vec![
                (message_types::USER_ADDED.to_string(), "decision".to_string()),
                (message_types::USER_REMOVED.to_string(), "decision".to_string()),
            ]
        );
        assert!(matches!(
            registry.remove_user("42").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_start_leaves_no_handlers() {
        let (outbox, _rx) = mpsc::unbounded_channel();
        let router = Arc::new(Router::new());
        let ctx = AgentContext {
            router: router.clone(),
            storage: Arc::new(UnreachableStorage),
            outbox,
        };
        let registry = AgentRegistry::new(ctx, Duration::from_secs(30));
        registry.plan(
            "storage",
            Layer::CoreServices,
            Arc::new(|id: &str, ctx: &AgentContext| -> Result<Arc<dyn Agent>> {
                Ok(PersistenceAgent::new(id, ctx))
            }),
        );

        for _ in 0..2 {
            let err = registry.initialize().await.unwrap_err();
            assert!(matches!(err, Error::Initialization(_)));
            assert!(registry.is_empty());
            assert_eq!(router.handler_count(message_types::MESSAGE_ANALYZED), 0);
            assert_eq!(router.handler_count(message_types::USER_COMMUNICATION), 0);
            assert_eq!(router.handler_count(message_types::PROCESSING_ERROR), 0);
        }
    }

    #[tokio::test]
    async fn test_remove_user_persists_status_before_detaching() {
        let (outbox, _rx) = mpsc::unbounded_channel();
        let router = Arc::new(Router::new());
        let spy = Arc::new(StatusSpy {
            inner: MemoryStorage::new(),
            router: router.clone(),
            handlers_at_write: Mutex::new(Vec::new()),
        });
        let ctx = AgentContext {
            router: router.clone(),
            storage: spy.clone() as Arc<dyn Storage>,
            outbox,
        };
        let registry = Arc::new(AgentRegistry::new(ctx, Duration::from_secs(30)));

        registry.add_user("7").await.unwrap();
        registry.remove_user("7").await.unwrap();

        // active after attaching, inactive while the agent is still subscribed
        assert_eq!(*spy.handlers_at_write.lock().unwrap(), vec![1, 1]);
        assert_eq!(router.handler_count(message_types::USER_RESPONSE), 0);

        registry.add_user("8").await.unwrap();
        let (a, b) = tokio::join!(registry.remove_user("8"), registry.remove_user("8"));
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(matches!(a.err().or(b.err()), Some(Error::NotFound(_))));

        // one inactive write for the removal that won
        let statuses: Vec<String> = spy
            .inner
            .query(collections::USERS, &Filter::new().with("userId", "8"))
            .await
            .unwrap()
            .into_iter()
            .filter_map(|r| r.data.get("status").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(statuses, vec!["active", "inactive"]);
    }
}
