//! Dual-worker ingestion and load balancing.
//!
//! A message is offered to the least loaded available worker right away.
//! If that fails it waits in a priority queue, ordered by a keyword
//! heuristic, until the drain loop finds a free worker for it.

pub mod balancer;
pub mod classifier;
pub mod ingest;
pub mod priority;
pub mod worker;

pub use balancer::{select, Selection};
pub use classifier::{parse_analysis, ClassifierWorker};
pub use ingest::{HubStats, IngestReply, IngestionHub, QueuedMessage, WorkerStats, QUEUED_ACK};
pub use priority::fallback_priority;
pub use worker::{
    AnalysisResult, AnalyzedMessage, Assignment, FailedMessage, UserMessage, Worker, WorkerLoad,
    WorkerSlot,
};
