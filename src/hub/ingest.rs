//! Ingestion: immediate processing on one of two workers, with a priority
//! queue and drain loop as the fallback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use super::balancer::{self, Selection};
use super::priority::fallback_priority;
use super::worker::{AnalysisResult, AnalyzedMessage, FailedMessage, UserMessage, Worker, WorkerSlot};
use crate::agents::DECISION_AGENT_ID;
use crate::config::HubConfig;
use crate::core::{PriorityQueue, QueueStats, RepeatingTask};
use crate::error::Error;
use crate::protocol::{message_types, Envelope, Priority, Router};
use crate::storage::{self, Storage};

const HUB_SOURCE: &str = "hub";

/// Acknowledgment returned when a message is deferred.
pub const QUEUED_ACK: &str = "processing, please wait";

/// A message waiting for a worker.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: UserMessage,
    pub fallback_priority: Priority,
    pub enqueued_at: Instant,
}

/// What the caller of [`IngestionHub::ingest`] gets back.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestReply {
    Processed {
        message_id: String,
        analysis: AnalysisResult,
        worker: String,
    },
    Queued {
        message_id: String,
        priority: Priority,
        ack: String,
    },
}

impl IngestReply {
    pub fn message_id(&self) -> &str {
        match self {
            IngestReply::Processed { message_id, .. } | IngestReply::Queued { message_id, .. } => {
                message_id
            }
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, IngestReply::Queued { .. })
    }
}

#[derive(Default)]
struct Counters {
    immediate: AtomicU64,
    queued: AtomicU64,
    drained: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: String,
    pub busy: bool,
    pub pending: usize,
    pub processed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    /// Handled on the immediate path
    pub immediate: u64,
    /// Sent to the fallback queue
    pub queued: u64,
    /// Processed after draining
    pub drained: u64,
    /// Drained messages that still failed
    pub failed: u64,
    pub queue_len: usize,
    pub workers: Vec<WorkerStats>,
}

pub struct IngestionHub {
    slots: Vec<Arc<WorkerSlot>>,
    queue: PriorityQueue<QueuedMessage>,
    router: Arc<Router>,
    storage: Arc<dyn Storage>,
    config: HubConfig,
    counters: Counters,
    drain: Mutex<Option<Arc<RepeatingTask>>>,
    in_flight: TaskTracker,
}

impl IngestionHub {
    pub fn new(
        workers: [Arc<dyn Worker>; 2],
        router: Arc<Router>,
        storage: Arc<dyn Storage>,
        config: HubConfig,
    ) -> Arc<Self> {
        let timeout = Duration::from_secs(config.process_timeout_secs);
        let slots = workers
            .into_iter()
            .map(|w| WorkerSlot::new(w, timeout))
            .collect();

        Arc::new(Self {
            slots,
            queue: PriorityQueue::new(),
            router,
            storage,
            config,
            counters: Counters::default(),
            drain: Mutex::new(None),
            in_flight: TaskTracker::new(),
        })
    }

    fn select(&self) -> Option<Selection> {
        let loads: Vec<_> = self.slots.iter().map(|s| s.load()).collect();
        balancer::select(&loads, self.config.max_pending)
    }

    /// Take in a user message.
    ///
    /// Tries the selected worker right away; if that fails for any reason the
    /// message is queued once under its fallback priority and the caller gets
    /// an acknowledgment instead of a result.
    pub async fn ingest(&self, message: UserMessage) -> IngestReply {
        let announce = Envelope::new(
            message_types::USER_COMMUNICATION,
            HUB_SOURCE,
            json!(message),
        )
        .with_correlation_id(message.id.clone());
        self.router.send_message(announce).await;

        let attempt = match self.select() {
            Some(selection) => {
                let slot = &self.slots[selection.index()];
                let assignment = slot.assign();
                tracing::debug!(
                    "Message {} -> {} ({:?})",
                    message.id,
                    assignment.worker_id(),
                    selection
                );
                assignment
                    .try_run(&message)
                    .await
                    .map(|analysis| (analysis, slot.id().to_string()))
            }
            None => Err(Error::Processing("no workers configured".to_string())),
        };

        match attempt {
            Ok((analysis, worker)) => {
                self.counters.immediate.fetch_add(1, Ordering::Relaxed);
                self.deliver(&message, &analysis, &worker).await;
                IngestReply::Processed {
                    message_id: message.id,
                    analysis,
                    worker,
                }
            }
            Err(e) => {
                tracing::info!("Immediate processing of {} failed, queueing: {}", message.id, e);
                self.enqueue(message).await
            }
        }
    }

    async fn enqueue(&self, message: UserMessage) -> IngestReply {
        let status = match storage::user_status(self.storage.as_ref(), &message.user_id).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Could not read status of user {}: {}", message.user_id, e);
                None
            }
        };

        let priority = fallback_priority(
            &message.content,
            status.as_deref(),
            &self.config.urgency_keywords,
        );
        let message_id = message.id.clone();

        self.queue.enqueue(
            QueuedMessage {
                message,
                fallback_priority: priority,
                enqueued_at: Instant::now(),
            },
            priority.weight(),
        );
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Queued {} at {} ({} waiting)", message_id, priority, self.queue.len());

        IngestReply::Queued {
            message_id,
            priority,
            ack: QUEUED_ACK.to_string(),
        }
    }

    /// Hand the head of the queue to an available worker.
    ///
    /// Leaves the queue untouched when no worker is available. Returns the
    /// handle of the spawned processing task.
    pub fn drain_once(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.queue.is_empty() {
            return None;
        }

        let selection = self.select()?;
        if !selection.is_available() {
            tracing::trace!("No worker available, {} message(s) waiting", self.queue.len());
            return None;
        }

        let queued = self.queue.dequeue()?;
        let slot = self.slots[selection.index()].clone();
        let assignment = slot.assign();
        let hub = self.clone();

        Some(self.in_flight.spawn(async move {
            let message = queued.message;
            tracing::debug!(
                "Draining {} to {} after {:?}",
                message.id,
                slot.id(),
                queued.enqueued_at.elapsed()
            );

            match assignment.run(&message).await {
                Ok(analysis) => {
                    hub.counters.drained.fetch_add(1, Ordering::Relaxed);
                    hub.deliver(&message, &analysis, slot.id()).await;
                }
                Err(e) => {
                    hub.counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Queued message {} failed: {}", message.id, e);
                    hub.report_failure(&message, queued.fallback_priority, &e).await;
                }
            }
        }))
    }

    async fn deliver(&self, message: &UserMessage, analysis: &AnalysisResult, worker: &str) {
        let payload = AnalyzedMessage {
            message: message.clone(),
            analysis: analysis.clone(),
            worker: worker.to_string(),
        };
        let envelope = Envelope::new(message_types::MESSAGE_ANALYZED, HUB_SOURCE, json!(payload))
            .with_target(DECISION_AGENT_ID)
            .with_priority(analysis.priority())
            .with_correlation_id(message.id.clone());

        self.router.send_message(envelope).await;
    }

    async fn report_failure(&self, message: &UserMessage, priority: Priority, error: &Error) {
        let payload = FailedMessage {
            message: message.clone(),
            error: error.to_string(),
        };
        let envelope = Envelope::new(message_types::PROCESSING_ERROR, HUB_SOURCE, json!(payload))
            .with_target(DECISION_AGENT_ID)
            .with_priority(priority)
            .with_correlation_id(message.id.clone());

        self.router.send_message(envelope).await;
    }

    /// Start the drain loop if it is not running.
    pub fn start_draining(self: &Arc<Self>) {
        let mut drain = self.drain.lock().unwrap_or_else(|e| e.into_inner());
        if drain.is_some() {
            return;
        }

        let hub = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.drain_interval_ms);
        *drain = Some(Arc::new(RepeatingTask::start("hub-drain", interval, move || {
            let hub = hub.clone();
            async move {
                if let Some(hub) = hub.upgrade() {
                    hub.drain_once();
                }
            }
        })));
    }

    /// Stop the drain loop and wait for drained messages still in progress.
    pub async fn stop_draining(&self) {
        let task = self.drain.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.stop().await;
        }

        self.in_flight.close();
        self.in_flight.wait().await;
        self.in_flight.reopen();
    }

    pub fn is_draining(&self) -> bool {
        self.drain
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| t.is_running())
    }

    /// Wait for the next drain tick. `None` if the loop is not running.
    pub async fn next_drain_tick(&self) -> Option<u64> {
        let task = self.drain.lock().unwrap_or_else(|e| e.into_inner()).clone()?;
        Some(task.next_tick().await)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_snapshot(&self) -> QueueStats {
        self.queue.snapshot()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            immediate: self.counters.immediate.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            drained: self.counters.drained.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            queue_len: self.queue.len(),
            workers: self
                .slots
                .iter()
                .map(|s| {
                    let load = s.load();
                    WorkerStats {
                        id: s.id().to_string(),
                        busy: load.busy,
                        pending: load.pending,
                        processed: s.processed(),
                        failed: s.failed(),
                    }
                })
                .collect(),
        }
    }
}
