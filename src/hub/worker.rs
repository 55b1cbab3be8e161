//! Workers and the per-worker availability state the hub keeps for them.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::Priority;

/// A message from a user as received at ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub channel: String,
    /// Receive timestamp (unix ms)
    pub timestamp: i64,
}

impl UserMessage {
    pub fn new(user_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            user_id: user_id.into(),
            content: content.into(),
            channel: "cli".to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}

/// Classification produced by a worker.
///
/// Missing fields take the documented defaults, so a partial model answer
/// still yields a usable result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    #[serde(default = "default_intent")]
    pub intent: String,
    #[serde(default = "default_urgency")]
    pub urgency: String,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

fn default_intent() -> String {
    "help".to_string()
}

fn default_urgency() -> String {
    "medium".to_string()
}

fn default_action() -> String {
    "provide_help".to_string()
}

fn default_confidence() -> f64 {
    0.5
}

impl Default for AnalysisResult {
    fn default() -> Self {
        Self {
            intent: default_intent(),
            urgency: default_urgency(),
            action: default_action(),
            confidence: default_confidence(),
            summary: None,
        }
    }
}

impl AnalysisResult {
    /// Build from loosely structured output. Fields with the wrong type are
    /// treated as absent.
    pub fn from_value(value: &Value) -> Self {
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Self {
            intent: text("intent").unwrap_or_else(default_intent),
            urgency: text("urgency").unwrap_or_else(default_urgency),
            action: text("action").unwrap_or_else(default_action),
            confidence: value
                .get("confidence")
                .and_then(Value::as_f64)
                .map(|c| c.clamp(0.0, 1.0))
                .unwrap_or_else(default_confidence),
            summary: text("summary"),
        }
    }

    /// Routing priority derived from the classified urgency.
    pub fn priority(&self) -> Priority {
        Priority::from_label(&self.urgency)
    }
}

/// Payload of a `MESSAGE_ANALYZED` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzedMessage {
    pub message: UserMessage,
    pub analysis: AnalysisResult,
    pub worker: String,
}

/// Payload of a `PROCESSING_ERROR` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedMessage {
    pub message: UserMessage,
    pub error: String,
}

/// One interchangeable processing unit.
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> &str;

    async fn process(&self, message: &UserMessage) -> Result<AnalysisResult>;
}

/// Availability snapshot of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WorkerLoad {
    pub busy: bool,
    pub pending: usize,
}

impl WorkerLoad {
    /// Available iff not busy and below the pending threshold.
    pub fn is_available(&self, max_pending: usize) -> bool {
        !self.busy && self.pending < max_pending
    }
}

/// Hub-side wrapper around a worker enforcing one message in flight.
pub struct WorkerSlot {
    worker: Arc<dyn Worker>,
    lane: tokio::sync::Mutex<()>,
    busy: AtomicBool,
    pending: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    timeout: Duration,
}

impl WorkerSlot {
    pub fn new(worker: Arc<dyn Worker>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            worker,
            lane: tokio::sync::Mutex::new(()),
            busy: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timeout,
        })
    }

    pub fn id(&self) -> &str {
        self.worker.id()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn load(&self) -> WorkerLoad {
        WorkerLoad {
            busy: self.is_busy(),
            pending: self.pending_count(),
        }
    }

    pub fn is_available(&self, max_pending: usize) -> bool {
        self.load().is_available(max_pending)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Count a message against this worker until the returned handle is dropped.
    pub fn assign(self: &Arc<Self>) -> Assignment {
        self.pending.fetch_add(1, Ordering::SeqCst);
        Assignment { slot: self.clone() }
    }

    // Caller holds the lane, so at most one execution is in flight.
    async fn execute(&self, message: &UserMessage) -> Result<AnalysisResult> {
        self.busy.store(true, Ordering::SeqCst);
        let _busy = BusyFlag(&self.busy);

        let outcome = match tokio::time::timeout(self.timeout, self.worker.process(message)).await {
            Ok(Ok(analysis)) => Ok(analysis),
            Ok(Err(Error::Processing(reason))) => Err(Error::Processing(reason)),
            Ok(Err(e)) => Err(Error::Processing(format!("worker {}: {}", self.id(), e))),
            Err(_) => Err(Error::Processing(format!(
                "worker {} timed out after {:?}",
                self.id(),
                self.timeout
            ))),
        };

        match &outcome {
            Ok(_) => self.processed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        outcome
    }
}

struct BusyFlag<'a>(&'a AtomicBool);

impl Drop for BusyFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A message counted against a worker's pending total.
pub struct Assignment {
    slot: Arc<WorkerSlot>,
}

impl Assignment {
    pub fn worker_id(&self) -> &str {
        self.slot.id()
    }

    /// Process now or fail: a worker that is already busy is an error.
    pub async fn try_run(&self, message: &UserMessage) -> Result<AnalysisResult> {
        let _lane = self
            .slot
            .lane
            .try_lock()
            .map_err(|_| Error::Processing(format!("worker {} is busy", self.slot.id())))?;
        self.slot.execute(message).await
    }

    /// Wait for the worker to free up, then process.
    pub async fn run(&self, message: &UserMessage) -> Result<AnalysisResult> {
        let _lane = self.slot.lane.lock().await;
        self.slot.execute(message).await
    }
}

impl Drop for Assignment {
    fn drop(&mut self) {
        self.slot.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Sleeps, tracks peak concurrency and answers with a fixed result.
    pub(crate) struct SlowWorker {
        pub id: String,
        pub delay: Duration,
        pub in_flight: AtomicUsize,
        pub peak: AtomicUsize,
        pub calls: AtomicUsize,
    }

    impl SlowWorker {
        pub fn new(id: &str, delay: Duration) -> Self {
            Self {
                id: id.to_string(),
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Worker for SlowWorker {
        fn id(&self) -> &str {
            &self.id
        }

        async fn process(&self, message: &UserMessage) -> Result<AnalysisResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            tracing::trace!("{} handled {}", self.id, message.id);
            Ok(AnalysisResult {
                intent: "question".to_string(),
                urgency: "high".to_string(),
                action: "answer".to_string(),
                confidence: 0.9,
                summary: None,
            })
        }
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let result = AnalysisResult::from_value(&json!({"summary": "x"}));
        assert_eq!(result.intent, "help");
        assert_eq!(result.urgency, "medium");
        assert_eq!(result.action, "provide_help");
        assert_eq!(result.confidence, 0.5);
        assert_eq!(result.priority(), Priority::Medium);

        let parsed: AnalysisResult = serde_json::from_str(r#"{"intent": "bug"}"#).unwrap();
        assert_eq!(parsed.intent, "bug");
        assert_eq!(parsed.urgency, "medium");
    }

    #[test]
    fn test_wrong_types_treated_as_absent() {
        let result = AnalysisResult::from_value(&json!({"intent": 7, "urgency": "critical", "confidence": "high"}));
        assert_eq!(result.intent, "help");
        assert_eq!(result.priority(), Priority::Critical);
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn test_availability_predicate() {
        assert!(WorkerLoad { busy: false, pending: 4 }.is_available(5));
        assert!(!WorkerLoad { busy: false, pending: 5 }.is_available(5));
        assert!(!WorkerLoad { busy: true, pending: 0 }.is_available(5));
    }

    #[tokio::test]
    async fn test_one_message_in_flight_per_worker() {
        let worker = Arc::new(SlowWorker::new("w", Duration::from_millis(20)));
        let slot = WorkerSlot::new(worker.clone(), Duration::from_secs(5));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let assignment = slot.assign();
            handles.push(tokio::spawn(async move {
                assignment.run(&UserMessage::new("u", "hi")).await
            }));
        }
        assert_eq!(slot.pending_count(), 4);

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(worker.peak.load(Ordering::SeqCst), 1);
        assert_eq!(slot.pending_count(), 0);
        assert!(!slot.is_busy());
        assert_eq!(slot.processed(), 4);
    }

    #[tokio::test]
    async fn test_try_run_rejects_busy_worker() {
        let worker = Arc::new(SlowWorker::new("w", Duration::from_millis(50)));
        let slot = WorkerSlot::new(worker.clone(), Duration::from_secs(5));

        let first = slot.assign();
        let running = tokio::spawn(async move { first.run(&UserMessage::new("u", "one")).await });

        while !slot.is_busy() {
            tokio::task::yield_now().await;
        }

        let second = slot.assign();
        let err = second.try_run(&UserMessage::new("u", "two")).await.unwrap_err();
        assert!(matches!(err, Error::Processing(_)));
        drop(second);

        assert!(running.await.unwrap().is_ok());
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_processing_error() {
        let worker = Arc::new(SlowWorker::new("w", Duration::from_millis(200)));
        let slot = WorkerSlot::new(worker, Duration::from_millis(10));

        let err = slot
            .assign()
            .run(&UserMessage::new("u", "slow"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Processing(_)));
        assert_eq!(slot.failed(), 1);
        assert!(!slot.is_busy());
    }
}
